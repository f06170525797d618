//! Live note collaboration: an ordered member list per note, cursor
//! fan-out with server-authoritative echo, and last-writer-wins text
//! content mirrored to the shared store with a long TTL.

use std::sync::Arc;
use std::time::Duration;

use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use corelay_core::user::UserSnapshot;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::socket::rooms::{Scope, note_content_key};
use crate::socket::types::RoomEmitter;

pub const CONTENT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMember {
    pub session_id: String,
    pub user: UserSnapshot,
}

pub struct NoteJoin {
    pub content: String,
    pub members: Vec<NoteMember>,
}

#[derive(Clone)]
pub struct NoteHandler {
    inner: Arc<Inner>,
}

struct Inner {
    store: SharedStore,
    metrics: Arc<MetricsRegistry>,
    emitter: RoomEmitter,
    /// (workspace id, note id) -> ordered member list
    members: DashMap<(String, String), Vec<NoteMember>>,
    /// (workspace id, note id) -> latest text content
    contents: DashMap<(String, String), String>,
}

impl NoteHandler {
    pub fn new(store: SharedStore, metrics: Arc<MetricsRegistry>, emitter: RoomEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                emitter,
                members: DashMap::new(),
                contents: DashMap::new(),
            }),
        }
    }

    /// Join a note: idempotent per user id (a rejoin replaces the
    /// session in place, keeping list order), appending otherwise.
    /// Returns the content for the `note_content_loaded` unicast and
    /// the refreshed member list.
    pub async fn apply_join(
        &self,
        workspace_id: &str,
        note_id: &str,
        session_id: &str,
        user: UserSnapshot,
    ) -> NoteJoin {
        let scope = Scope::note(workspace_id, note_id);
        let mut members = self.load_members(&scope, workspace_id, note_id).await;

        match members.iter_mut().find(|member| member.user.id == user.id) {
            Some(existing) => {
                existing.session_id = session_id.to_owned();
                existing.user = user;
            }
            None => members.push(NoteMember {
                session_id: session_id.to_owned(),
                user,
            }),
        }

        self.store_local_members(workspace_id, note_id, &members);
        self.write_members(&scope, &members).await;

        let content = self.load_content(workspace_id, note_id).await;

        self.inner
            .emitter
            .emit(
                &scope.room_name(),
                "note_users_updated",
                &json!({ "noteId": note_id, "users": members }),
            )
            .await;
        self.inner.metrics.count("user_joined_note");

        NoteJoin { content, members }
    }

    /// Leave a note: refresh the member list for the room and withdraw
    /// the leaver's cursor. The caller leaves the transport room first.
    pub async fn apply_leave(&self, workspace_id: &str, note_id: &str, session_id: &str) -> bool {
        let scope = Scope::note(workspace_id, note_id);
        let mut members = self.load_members(&scope, workspace_id, note_id).await;
        let before = members.len();
        members.retain(|member| member.session_id != session_id);
        if members.len() == before {
            return false;
        }

        self.store_local_members(workspace_id, note_id, &members);
        self.write_members(&scope, &members).await;

        let room = scope.room_name();
        self.inner
            .emitter
            .emit(
                &room,
                "note_users_updated",
                &json!({ "noteId": note_id, "users": members }),
            )
            .await;
        self.inner
            .emitter
            .emit(
                &room,
                "cursor_updated",
                &json!({ "noteId": note_id, "userId": session_id, "cursor": JsonValue::Null }),
            )
            .await;
        self.inner.metrics.count("user_left_note");
        true
    }

    /// Cursor move. Unknown sessions are dropped silently; everyone in
    /// the room, the sender included, receives the echo.
    pub async fn cursor_update(
        &self,
        workspace_id: &str,
        note_id: &str,
        session_id: &str,
        cursor: JsonValue,
    ) -> bool {
        let key = (workspace_id.to_owned(), note_id.to_owned());
        let member = self.inner.members.get(&key).and_then(|members| {
            members
                .iter()
                .find(|member| member.session_id == session_id)
                .cloned()
        });
        let Some(member) = member else {
            return false;
        };

        let room = Scope::note(workspace_id, note_id).room_name();
        self.inner
            .emitter
            .emit(
                &room,
                "cursor_updated",
                &json!({
                    "noteId": note_id,
                    "userId": session_id,
                    "userData": member.user,
                    "cursor": cursor,
                }),
            )
            .await;
        true
    }

    /// Overwrite the note's content, last writer wins. Returns false
    /// when the note has no members (nothing to update against). The
    /// caller broadcasts `note_content_updated` excluding the sender.
    pub async fn content_update(&self, workspace_id: &str, note_id: &str, content: &str) -> bool {
        let key = (workspace_id.to_owned(), note_id.to_owned());
        let occupied = self
            .inner
            .members
            .get(&key)
            .is_some_and(|members| !members.is_empty());
        if !occupied {
            return false;
        }

        self.inner.contents.insert(key, content.to_owned());

        let store_key = note_content_key(workspace_id, note_id);
        if let Err(err) = self
            .inner
            .store
            .set_with_ttl(&store_key, &json!(content), CONTENT_TTL)
            .await
        {
            self.inner.store.count_dropped_write();
            warn!(key = store_key, error = %err, "note content write dropped");
        }
        true
    }

    /// Immediate removal from every note on transport disconnect.
    pub async fn handle_disconnect(&self, session_id: &str) {
        let memberships: Vec<(String, String)> = self
            .inner
            .members
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .iter()
                    .any(|member| member.session_id == session_id)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for (workspace_id, note_id) in memberships {
            self.apply_leave(&workspace_id, &note_id, session_id).await;
        }
    }

    pub fn member_count(&self, workspace_id: &str, note_id: &str) -> usize {
        self.inner
            .members
            .get(&(workspace_id.to_owned(), note_id.to_owned()))
            .map(|members| members.len())
            .unwrap_or(0)
    }

    async fn load_members(
        &self,
        scope: &Scope,
        workspace_id: &str,
        note_id: &str,
    ) -> Vec<NoteMember> {
        match self.inner.store.get_bypass_cache(&scope.store_key()).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(_) => self
                .inner
                .members
                .get(&(workspace_id.to_owned(), note_id.to_owned()))
                .map(|members| members.clone())
                .unwrap_or_default(),
        }
    }

    fn store_local_members(&self, workspace_id: &str, note_id: &str, members: &[NoteMember]) {
        let key = (workspace_id.to_owned(), note_id.to_owned());
        if members.is_empty() {
            self.inner.members.remove(&key);
            self.inner.contents.remove(&key);
        } else {
            self.inner.members.insert(key, members.to_vec());
        }
    }

    async fn write_members(&self, scope: &Scope, members: &[NoteMember]) {
        let key = scope.store_key();
        let result = if members.is_empty() {
            self.inner.store.delete(&key).await
        } else {
            self.inner.store.set(&key, &json!(members)).await
        };

        if let Err(err) = result {
            self.inner.store.count_dropped_write();
            warn!(key, error = %err, "note presence write dropped");
        }
    }

    async fn load_content(&self, workspace_id: &str, note_id: &str) -> String {
        let key = (workspace_id.to_owned(), note_id.to_owned());
        if let Some(content) = self.inner.contents.get(&key) {
            return content.clone();
        }

        match self
            .inner
            .store
            .get(&note_content_key(workspace_id, note_id))
            .await
        {
            Ok(Some(JsonValue::String(content))) => {
                self.inner.contents.insert(key, content.clone());
                content
            }
            Ok(_) => String::new(),
            Err(err) => {
                debug!(workspace_id, note_id, error = %err, "note content read degraded");
                String::new()
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> NoteHandler {
        NoteHandler::new(
            SharedStore::disabled(),
            Arc::new(MetricsRegistry::default()),
            RoomEmitter::default(),
        )
    }

    fn user(id: &str) -> UserSnapshot {
        UserSnapshot {
            id: id.to_owned(),
            email: format!("{id}@x"),
            name: id.to_owned(),
            image: None,
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_per_user_id() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;
        notes.apply_join("ws1", "n1", "s2", user("u2")).await;
        // u1 reconnects with a fresh session: replaced in place.
        let join = notes.apply_join("ws1", "n1", "s3", user("u1")).await;

        assert_eq!(join.members.len(), 2);
        assert_eq!(join.members[0].user.id, "u1");
        assert_eq!(join.members[0].session_id, "s3");
        assert_eq!(join.members[1].user.id, "u2");
    }

    #[tokio::test]
    async fn content_survives_within_the_local_map() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;
        assert!(notes.content_update("ws1", "n1", "hello").await);

        let join = notes.apply_join("ws1", "n1", "s2", user("u2")).await;
        assert_eq!(join.content, "hello");
    }

    #[tokio::test]
    async fn content_update_requires_an_occupied_note() {
        let notes = notes();
        assert!(!notes.content_update("ws1", "empty", "ignored").await);
    }

    #[tokio::test]
    async fn cursor_update_from_non_member_is_dropped() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;

        assert!(notes.cursor_update("ws1", "n1", "s1", json!({"x": 1})).await);
        assert!(
            !notes
                .cursor_update("ws1", "n1", "stranger", json!({"x": 1}))
                .await
        );
    }

    #[tokio::test]
    async fn last_member_leaving_reclaims_the_note() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;
        notes.content_update("ws1", "n1", "text").await;

        assert!(notes.apply_leave("ws1", "n1", "s1").await);
        assert_eq!(notes.member_count("ws1", "n1"), 0);

        // Content map was reclaimed with the membership; with the
        // store offline a rejoin starts from empty content.
        let join = notes.apply_join("ws1", "n1", "s2", user("u1")).await;
        assert_eq!(join.content, "");
    }

    #[tokio::test]
    async fn disconnect_removes_the_session_from_every_note() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;
        notes.apply_join("ws1", "n2", "s1", user("u1")).await;
        notes.apply_join("ws1", "n2", "s2", user("u2")).await;

        notes.handle_disconnect("s1").await;
        assert_eq!(notes.member_count("ws1", "n1"), 0);
        assert_eq!(notes.member_count("ws1", "n2"), 1);
    }

    #[tokio::test]
    async fn leave_of_unknown_session_is_a_no_op() {
        let notes = notes();
        notes.apply_join("ws1", "n1", "s1", user("u1")).await;
        assert!(!notes.apply_leave("ws1", "n1", "other").await);
        assert_eq!(notes.member_count("ws1", "n1"), 1);
    }
}
