//! Workspace chat: bounded message history, typing indicators, and the
//! compressed wire form broadcast to rooms. History and typing state
//! are mirrored to the shared store so any instance can serve them;
//! the local ring is the fallback when the store is down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::presence::now_millis;
use crate::socket::rooms::{Scope, chat_messages_key, chat_typing_key};
use crate::socket::types::RoomEmitter;

pub const MESSAGE_LIMIT: usize = 100;
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);
pub const TYPING_TTL: Duration = Duration::from_secs(10);
const IMAGE_URL_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub workspace_id: String,
    pub sender_email: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_image: Option<String>,
    pub content: String,
    pub timestamp: i64,
}

impl ChatMessage {
    /// Wire form with single-letter keys; the image only rides along
    /// when it is short enough to be worth the bytes.
    pub fn compressed(&self) -> JsonValue {
        let mut payload = json!({
            "i": self.id,
            "w": self.workspace_id,
            "e": self.sender_email,
            "n": self.sender_name,
            "c": self.content,
            "t": self.timestamp,
        });
        if let Some(image) = &self.sender_image {
            if !image.is_empty() && image.len() < IMAGE_URL_LIMIT {
                payload["img"] = json!(image);
            }
        }
        payload
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub workspace_id: String,
    pub sender_email: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_image: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TypingEntry {
    name: String,
    #[serde(rename = "ts")]
    updated_at: i64,
}

#[derive(Clone)]
pub struct ChatHandler {
    inner: Arc<Inner>,
}

struct Inner {
    store: SharedStore,
    metrics: Arc<MetricsRegistry>,
    emitter: RoomEmitter,
    histories: DashMap<String, VecDeque<ChatMessage>>,
    typing: DashMap<String, HashMap<String, TypingEntry>>,
    sequence: AtomicU64,
}

impl ChatHandler {
    pub fn new(store: SharedStore, metrics: Arc<MetricsRegistry>, emitter: RoomEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                emitter,
                histories: DashMap::new(),
                typing: DashMap::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Validate, persist, and fan out one chat message. Returns the
    /// stored message; a validation failure is reported to the caller
    /// for the `error` unicast.
    pub async fn post_message(&self, payload: NewMessagePayload) -> Result<ChatMessage, AppError> {
        if payload.workspace_id.trim().is_empty() {
            return Err(AppError::validation("workspaceId is required"));
        }
        if payload.sender_email.trim().is_empty() {
            return Err(AppError::validation("senderEmail is required"));
        }
        if payload.content.trim().is_empty() {
            return Err(AppError::validation("content is required"));
        }

        let now = now_millis();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let message = ChatMessage {
            id: format!("{now}-{sequence}"),
            sender_name: payload
                .sender_name
                .unwrap_or_else(|| payload.sender_email.clone()),
            workspace_id: payload.workspace_id,
            sender_email: payload.sender_email,
            sender_image: payload.sender_image,
            content: payload.content,
            timestamp: now,
        };

        self.append_local(&message);
        self.append_shared(&message).await;
        self.inner.metrics.count("chat_message_posted");

        let room = Scope::workspace(&message.workspace_id).room_name();
        self.inner
            .emitter
            .emit(&room, "new_message", &message.compressed())
            .await;

        // Sending a message implies the sender stopped typing.
        self.clear_typing(&message.workspace_id, &message.sender_email)
            .await;

        Ok(message)
    }

    pub async fn user_typing(&self, workspace_id: &str, email: &str, name: &str) {
        let entry = TypingEntry {
            name: name.to_owned(),
            updated_at: now_millis(),
        };

        self.inner
            .typing
            .entry(workspace_id.to_owned())
            .or_default()
            .insert(email.to_owned(), entry);
        self.write_typing_shared(workspace_id).await;

        let room = Scope::workspace(workspace_id).room_name();
        self.inner
            .emitter
            .emit(&room, "user_typing", &json!({ "email": email, "name": name }))
            .await;
    }

    pub async fn user_stop_typing(&self, workspace_id: &str, email: &str) {
        self.clear_typing(workspace_id, email).await;
    }

    /// Remove a typing entry and broadcast the stop exactly once.
    pub async fn clear_typing(&self, workspace_id: &str, email: &str) {
        let removed = self
            .inner
            .typing
            .get_mut(workspace_id)
            .map(|mut entry| entry.remove(email).is_some())
            .unwrap_or(false);
        if !removed {
            return;
        }

        self.inner
            .typing
            .remove_if(workspace_id, |_, entries| entries.is_empty());
        self.write_typing_shared(workspace_id).await;

        let room = Scope::workspace(workspace_id).room_name();
        self.inner
            .emitter
            .emit(&room, "user_stop_typing", &json!({ "email": email }))
            .await;
    }

    /// Evict typing entries older than the timeout, broadcasting one
    /// synthetic stop per eviction. Driven every `TYPING_TIMEOUT`.
    pub async fn sweep_typing(&self) -> usize {
        let cutoff = now_millis() - TYPING_TIMEOUT.as_millis() as i64;
        let mut expired: Vec<(String, String)> = Vec::new();

        for entry in self.inner.typing.iter() {
            for (email, typing) in entry.value() {
                if typing.updated_at < cutoff {
                    expired.push((entry.key().clone(), email.clone()));
                }
            }
        }

        for (workspace_id, email) in &expired {
            self.clear_typing(workspace_id, email).await;
        }
        expired.len()
    }

    /// History for one workspace, shared list first. A store error or
    /// an empty shared list falls back to the local ring, which may
    /// still hold messages from before an outage.
    pub async fn history(&self, workspace_id: &str) -> Vec<JsonValue> {
        let shared = match self.inner.store.get(&chat_messages_key(workspace_id)).await {
            Ok(Some(JsonValue::Array(items))) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value::<ChatMessage>(item).ok())
                .collect::<Vec<_>>(),
            Ok(_) => Vec::new(),
            Err(err) => {
                debug!(workspace_id, error = %err, "chat history degraded to local ring");
                Vec::new()
            }
        };

        let messages: Vec<ChatMessage> = if shared.is_empty() {
            self.inner
                .histories
                .get(workspace_id)
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            shared
        };

        messages.iter().map(ChatMessage::compressed).collect()
    }

    pub fn typing_entries(&self, workspace_id: &str) -> usize {
        self.inner
            .typing
            .get(workspace_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    fn append_local(&self, message: &ChatMessage) {
        let mut ring = self
            .inner
            .histories
            .entry(message.workspace_id.clone())
            .or_default();
        if ring.len() >= MESSAGE_LIMIT {
            ring.pop_front();
        }
        ring.push_back(message.clone());
    }

    async fn append_shared(&self, message: &ChatMessage) {
        let key = chat_messages_key(&message.workspace_id);
        let mut items = match self.inner.store.get_bypass_cache(&key).await {
            Ok(Some(JsonValue::Array(items))) => items,
            Ok(_) => Vec::new(),
            Err(err) => {
                self.inner.store.count_dropped_write();
                debug!(key, error = %err, "chat history write dropped");
                return;
            }
        };

        items.push(json!(message));
        if items.len() > MESSAGE_LIMIT {
            let excess = items.len() - MESSAGE_LIMIT;
            items.drain(..excess);
        }

        if let Err(err) = self.inner.store.set(&key, &JsonValue::Array(items)).await {
            self.inner.store.count_dropped_write();
            warn!(key, error = %err, "chat history write dropped");
        }
    }

    async fn write_typing_shared(&self, workspace_id: &str) {
        let key = chat_typing_key(workspace_id);
        let entries = self
            .inner
            .typing
            .get(workspace_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();

        let result = if entries.is_empty() {
            self.inner.store.delete(&key).await
        } else {
            self.inner
                .store
                .set_with_ttl(&key, &json!(entries), TYPING_TTL)
                .await
        };

        if let Err(err) = result {
            self.inner.store.count_dropped_write();
            debug!(key, error = %err, "typing state write dropped");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatHandler {
        ChatHandler::new(
            SharedStore::disabled(),
            Arc::new(MetricsRegistry::default()),
            RoomEmitter::default(),
        )
    }

    fn message_payload(workspace: &str, email: &str, content: &str) -> NewMessagePayload {
        NewMessagePayload {
            workspace_id: workspace.to_owned(),
            sender_email: email.to_owned(),
            sender_name: Some("Alice".to_owned()),
            sender_image: None,
            content: content.to_owned(),
        }
    }

    #[tokio::test]
    async fn message_requires_workspace_sender_and_content() {
        let chat = chat();
        for payload in [
            message_payload("", "alice@x", "hi"),
            message_payload("ws1", "", "hi"),
            message_payload("ws1", "alice@x", "  "),
        ] {
            let err = chat.post_message(payload).await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION");
        }
    }

    #[tokio::test]
    async fn message_ids_are_time_ordered_and_unique() {
        let chat = chat();
        let first = chat
            .post_message(message_payload("ws1", "alice@x", "one"))
            .await
            .unwrap();
        let second = chat
            .post_message(message_payload("ws1", "alice@x", "two"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.timestamp <= second.timestamp);
    }

    #[tokio::test]
    async fn history_is_bounded_to_the_message_limit() {
        let chat = chat();
        for i in 0..(MESSAGE_LIMIT + 10) {
            chat.post_message(message_payload("ws1", "alice@x", &format!("m{i}")))
                .await
                .unwrap();
        }

        let history = chat.history("ws1").await;
        assert_eq!(history.len(), MESSAGE_LIMIT);
        assert_eq!(history.first().unwrap()["c"], "m10");
        assert_eq!(history.last().unwrap()["c"], format!("m{}", MESSAGE_LIMIT + 9));
    }

    #[tokio::test]
    async fn compressed_form_uses_single_letter_keys() {
        let chat = chat();
        let message = chat
            .post_message(message_payload("ws1", "alice@x", "hi"))
            .await
            .unwrap();

        let wire = message.compressed();
        assert_eq!(wire["w"], "ws1");
        assert_eq!(wire["e"], "alice@x");
        assert_eq!(wire["n"], "Alice");
        assert_eq!(wire["c"], "hi");
        assert!(wire.get("img").is_none());
    }

    #[tokio::test]
    async fn oversized_images_are_dropped_from_the_wire_form() {
        let chat = chat();
        let mut payload = message_payload("ws1", "alice@x", "hi");
        payload.sender_image = Some("x".repeat(500));
        let long = chat.post_message(payload).await.unwrap();
        assert!(long.compressed().get("img").is_none());

        let mut payload = message_payload("ws1", "alice@x", "hi");
        payload.sender_image = Some("https://cdn/avatar.png".to_owned());
        let short = chat.post_message(payload).await.unwrap();
        assert_eq!(short.compressed()["img"], "https://cdn/avatar.png");
    }

    #[tokio::test]
    async fn posting_clears_the_senders_typing_state() {
        let chat = chat();
        chat.user_typing("ws1", "alice@x", "Alice").await;
        assert_eq!(chat.typing_entries("ws1"), 1);

        chat.post_message(message_payload("ws1", "alice@x", "hi"))
            .await
            .unwrap();
        assert_eq!(chat.typing_entries("ws1"), 0);
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_typing_entries() {
        let chat = chat();
        chat.user_typing("ws1", "alice@x", "Alice").await;

        // Fresh entry survives the sweep.
        assert_eq!(chat.sweep_typing().await, 0);
        assert_eq!(chat.typing_entries("ws1"), 1);

        // Age the entry past the timeout by hand.
        chat.inner
            .typing
            .get_mut("ws1")
            .unwrap()
            .get_mut("alice@x")
            .unwrap()
            .updated_at -= TYPING_TIMEOUT.as_millis() as i64 + 1000;

        assert_eq!(chat.sweep_typing().await, 1);
        assert_eq!(chat.typing_entries("ws1"), 0);

        // A second sweep has nothing left to evict.
        assert_eq!(chat.sweep_typing().await, 0);
    }

    #[tokio::test]
    async fn stop_typing_is_idempotent() {
        let chat = chat();
        chat.user_typing("ws1", "alice@x", "Alice").await;
        chat.user_stop_typing("ws1", "alice@x").await;
        chat.user_stop_typing("ws1", "alice@x").await;
        assert_eq!(chat.typing_entries("ws1"), 0);
    }
}
