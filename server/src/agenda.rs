//! Agenda presence and task fan-out. Presence mirrors the workspace
//! engine scoped to `agenda:{ws}` with no disconnect grace; task events
//! are pass-through broadcasts enriched with a server timestamp and
//! twinned into the parent workspace room. Nothing here is persisted
//! beyond the presence record.

use std::sync::Arc;

use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use corelay_core::user::{PresenceMember, PresenceRecord, UserSnapshot, dedupe_by_email};
use dashmap::DashMap;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use crate::error::AppError;
use crate::presence::now_millis;
use crate::socket::rooms::Scope;
use crate::socket::types::RoomEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Created,
    Updated,
    Deleted,
    Moved,
}

impl TaskEvent {
    pub fn agenda_event(&self) -> &'static str {
        match self {
            TaskEvent::Created => "task_created",
            TaskEvent::Updated => "task_updated",
            TaskEvent::Deleted => "task_deleted",
            TaskEvent::Moved => "task_moved",
        }
    }

    pub fn workspace_event(&self) -> &'static str {
        match self {
            TaskEvent::Created => "workspace_task_created",
            TaskEvent::Updated => "workspace_task_updated",
            TaskEvent::Deleted => "workspace_task_deleted",
            TaskEvent::Moved => "workspace_task_moved",
        }
    }
}

#[derive(Clone)]
pub struct AgendaHandler {
    inner: Arc<Inner>,
}

struct Inner {
    store: SharedStore,
    metrics: Arc<MetricsRegistry>,
    emitter: RoomEmitter,
    /// workspace id -> session id -> member
    agendas: DashMap<String, PresenceRecord>,
}

impl AgendaHandler {
    pub fn new(store: SharedStore, metrics: Arc<MetricsRegistry>, emitter: RoomEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                emitter,
                agendas: DashMap::new(),
            }),
        }
    }

    pub async fn apply_join(
        &self,
        workspace_id: &str,
        session_id: &str,
        user: UserSnapshot,
    ) -> Vec<UserSnapshot> {
        let scope = Scope::agenda(workspace_id);
        let mut record = self.load_record(&scope, workspace_id).await;

        record.retain(|sid, member| member.user.email != user.email || sid == session_id);
        record.insert(
            session_id.to_owned(),
            PresenceMember {
                user: user.clone(),
                joined_at: now_millis(),
            },
        );

        self.store_local(workspace_id, &record);
        self.write_record(&scope, &record).await;

        let users = dedupe_by_email(&record);
        self.inner
            .emitter
            .emit(
                &scope.room_name(),
                "agenda_users_updated",
                &json!({ "users": users }),
            )
            .await;
        // The parent workspace room learns about agenda membership so
        // off-agenda clients can badge the board.
        self.inner
            .emitter
            .emit(
                &Scope::workspace(workspace_id).room_name(),
                "agenda_user_joined",
                &json!({ "user": user }),
            )
            .await;
        self.inner.metrics.count("user_joined_agenda");
        users
    }

    pub async fn apply_leave(&self, workspace_id: &str, session_id: &str) -> Option<UserSnapshot> {
        let scope = Scope::agenda(workspace_id);
        let mut record = self.load_record(&scope, workspace_id).await;
        let removed = record.remove(session_id)?;

        self.store_local(workspace_id, &record);
        self.write_record(&scope, &record).await;

        self.inner
            .emitter
            .emit(
                &scope.room_name(),
                "agenda_users_updated",
                &json!({ "users": dedupe_by_email(&record) }),
            )
            .await;
        self.inner
            .emitter
            .emit(
                &Scope::workspace(workspace_id).room_name(),
                "agenda_user_left",
                &json!({ "user": removed.user }),
            )
            .await;
        self.inner.metrics.count("user_left_agenda");
        Some(removed.user)
    }

    pub async fn current_users(&self, workspace_id: &str) -> Vec<UserSnapshot> {
        let record = self
            .load_record(&Scope::agenda(workspace_id), workspace_id)
            .await;
        dedupe_by_email(&record)
    }

    /// Validate and enrich a task event payload. The caller fans the
    /// returned payload out to the agenda room (excluding the sender)
    /// and to the workspace room under the `workspace_task_*` twin.
    pub fn enrich_task_payload(&self, payload: JsonValue) -> Result<(String, JsonValue), AppError> {
        let JsonValue::Object(mut object) = payload else {
            return Err(AppError::validation("task payload must be an object"));
        };

        let workspace_id = object
            .get("workspaceId")
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::validation("workspaceId is required"))?;

        object.insert("timestamp".to_owned(), json!(now_millis()));
        Ok((workspace_id, JsonValue::Object(object)))
    }

    pub async fn handle_disconnect(&self, session_id: &str) {
        let workspaces: Vec<String> = self
            .inner
            .agendas
            .iter()
            .filter(|entry| entry.value().contains_key(session_id))
            .map(|entry| entry.key().clone())
            .collect();

        for workspace_id in workspaces {
            self.apply_leave(&workspace_id, session_id).await;
        }
    }

    async fn load_record(&self, scope: &Scope, workspace_id: &str) -> PresenceRecord {
        match self.inner.store.get_bypass_cache(&scope.store_key()).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => PresenceRecord::new(),
            Err(_) => self
                .inner
                .agendas
                .get(workspace_id)
                .map(|entry| entry.clone())
                .unwrap_or_default(),
        }
    }

    fn store_local(&self, workspace_id: &str, record: &PresenceRecord) {
        if record.is_empty() {
            self.inner.agendas.remove(workspace_id);
        } else {
            self.inner
                .agendas
                .insert(workspace_id.to_owned(), record.clone());
        }
    }

    async fn write_record(&self, scope: &Scope, record: &PresenceRecord) {
        let key = scope.store_key();
        let result = if record.is_empty() {
            self.inner.store.delete(&key).await
        } else {
            self.inner.store.set(&key, &json!(record)).await
        };

        if let Err(err) = result {
            self.inner.store.count_dropped_write();
            warn!(key, error = %err, "agenda presence write dropped");
        }
    }

    #[cfg(test)]
    fn tracked_agendas(&self) -> usize {
        self.inner.agendas.len()
    }
}
