use std::sync::Arc;

use chrono::{DateTime, Utc};
use corelay_core::user::UserSnapshot;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use socketioxide::SocketIo;
use socketioxide::extract::SocketRef;
use tracing::warn;

use crate::error::AppError;

/// Identity and connection metadata attached to every admitted session.
#[derive(Clone)]
pub struct SocketUserContext {
    pub user: UserSnapshot,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl SocketUserContext {
    pub fn new(user: UserSnapshot, client_ip: String, user_agent: Option<String>) -> Self {
        Self {
            user,
            client_ip,
            user_agent,
            connected_at: Utc::now(),
        }
    }
}

/// Handle for emitting to rooms from code without a socket in hand
/// (sweepers, grace timers). Wraps the lazily-set server instance.
#[derive(Clone, Default)]
pub struct RoomEmitter {
    io: Arc<OnceCell<Arc<SocketIo>>>,
}

impl RoomEmitter {
    pub fn cell(&self) -> Arc<OnceCell<Arc<SocketIo>>> {
        self.io.clone()
    }

    pub fn bind(&self, io: Arc<SocketIo>) {
        let _ = self.io.set(io);
    }

    /// Emit to every session in `room`, sender included.
    pub async fn emit(&self, room: &str, event: &str, payload: &JsonValue) {
        let Some(io) = self.io.get() else {
            return;
        };
        let Some(ns) = io.of("/") else {
            return;
        };
        if let Err(err) = ns.to(room.to_owned()).emit(event, payload).await {
            warn!(room, event, ?err, "failed to emit room broadcast");
        }
    }
}

/// Unicast a structured `error` event to the offending session only.
pub fn emit_error(socket: &SocketRef, error: &AppError) {
    if let Err(err) = socket.emit("error", &error.socket_payload()) {
        warn!(?err, "failed to unicast error event");
    }
}

pub fn emit_to_socket(socket: &SocketRef, event: &str, payload: &JsonValue) {
    if let Err(err) = socket.emit(event, payload) {
        warn!(event, ?err, "failed to unicast event");
    }
}

/// Deserialize an event payload, turning missing or mistyped fields
/// into a `validation` error the caller reports back to the sender.
pub fn parse_payload<T: DeserializeOwned>(value: JsonValue) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|err| AppError::validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct JoinPayload {
        workspace_id: String,
        user: UserSnapshot,
    }

    #[test]
    fn parse_payload_accepts_well_formed_events() {
        let payload: JoinPayload = parse_payload(json!({
            "workspaceId": "ws1",
            "user": {"id": "u1", "email": "a@x", "name": "A"},
        }))
        .unwrap();
        assert_eq!(payload.workspace_id, "ws1");
        assert_eq!(payload.user.email, "a@x");
    }

    #[test]
    fn parse_payload_maps_missing_fields_to_validation() {
        let err = parse_payload::<JoinPayload>(json!({"user": {}})).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }

    #[tokio::test]
    async fn emitter_without_bound_server_is_inert() {
        // Sweepers start before the socket layer is mounted; emitting
        // into the unbound cell must be a no-op, not a panic.
        let emitter = RoomEmitter::default();
        emitter.emit("ws1", "users_connected", &json!([])).await;
    }
}
