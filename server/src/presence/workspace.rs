//! Workspace presence: the only scope with disconnect grace. Joins,
//! leaves, and the duplicate sweeper all treat the shared-store record
//! as the authority and the in-process map as the fallback view, so
//! instances converge within one sweep interval.

use std::collections::HashMap;
use std::sync::Arc;

use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use corelay_core::user::{
    PresenceMember, PresenceRecord, UserSnapshot, dedupe_by_email, stale_duplicate_sessions,
};
use dashmap::DashMap;
use serde_json::json;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::socket::rooms::Scope;
use crate::socket::types::RoomEmitter;

use super::{RECONNECT_GRACE, now_millis};

pub struct JoinOutcome {
    pub users: Vec<UserSnapshot>,
    pub was_reconnect: bool,
    /// True when neither a live session nor a pending reconnection for
    /// this email existed: the join that earns a `user_joined`.
    pub first_join: bool,
}

pub struct LeaveOutcome {
    pub user: UserSnapshot,
}

struct PendingDisconnect {
    session_id: String,
    handle: AbortHandle,
}

#[derive(Clone)]
pub struct WorkspacePresence {
    inner: Arc<Inner>,
}

struct Inner {
    store: SharedStore,
    metrics: Arc<MetricsRegistry>,
    emitter: RoomEmitter,
    /// workspace id -> session id -> member
    rooms: DashMap<String, PresenceRecord>,
    /// workspace id -> email -> last-seen unix millis
    last_seen: DashMap<String, HashMap<String, i64>>,
    /// (workspace id, email) -> pending grace timer
    pending: DashMap<(String, String), PendingDisconnect>,
}

impl WorkspacePresence {
    pub fn new(store: SharedStore, metrics: Arc<MetricsRegistry>, emitter: RoomEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                emitter,
                rooms: DashMap::new(),
                last_seen: DashMap::new(),
                pending: DashMap::new(),
            }),
        }
    }

    /// Admit `session_id` into the workspace and broadcast the
    /// refreshed scope snapshot. The caller joins the transport room
    /// first so the joiner receives its own `users_connected`.
    pub async fn apply_join(
        &self,
        workspace_id: &str,
        session_id: &str,
        user: UserSnapshot,
    ) -> JoinOutcome {
        let scope = Scope::workspace(workspace_id);
        let mut record = self.load_record(&scope).await;

        let was_reconnect = self.cancel_pending(workspace_id, &user.email);
        let had_prior = record
            .values()
            .any(|member| member.user.email == user.email);

        // A user runs one live session per workspace: evict any other
        // session already holding this email.
        record.retain(|sid, member| member.user.email != user.email || sid == session_id);
        record.insert(
            session_id.to_owned(),
            PresenceMember {
                user: user.clone(),
                joined_at: now_millis(),
            },
        );

        self.inner
            .rooms
            .insert(workspace_id.to_owned(), record.clone());
        self.write_record(&scope, &record).await;
        self.touch_last_seen(workspace_id, &user.email);

        let users = dedupe_by_email(&record);
        self.inner
            .emitter
            .emit(&scope.room_name(), "users_connected", &json!(users))
            .await;

        self.inner.metrics.count("user_joined_workspace");

        JoinOutcome {
            users,
            was_reconnect,
            first_join: !was_reconnect && !had_prior,
        }
    }

    /// Remove `session_id` from the workspace and broadcast `user_left`
    /// plus the refreshed snapshot. The caller leaves the transport
    /// room first so the leaver is excluded.
    pub async fn apply_leave(&self, workspace_id: &str, session_id: &str) -> Option<LeaveOutcome> {
        self.cancel_pending_session(workspace_id, session_id);

        let scope = Scope::workspace(workspace_id);
        let mut record = self.load_record(&scope).await;
        let removed = record.remove(session_id)?;

        self.store_local(workspace_id, &record);
        self.write_record(&scope, &record).await;
        self.touch_last_seen(workspace_id, &removed.user.email);

        let room = scope.room_name();
        self.inner
            .emitter
            .emit(
                &room,
                "user_left",
                &json!({ "email": removed.user.email, "name": removed.user.name }),
            )
            .await;
        self.inner
            .emitter
            .emit(&room, "users_connected", &json!(dedupe_by_email(&record)))
            .await;

        self.inner.metrics.count("user_left_workspace");

        Some(LeaveOutcome { user: removed.user })
    }

    /// Snapshot for a `get_workspace_users` request: shared record
    /// first, local view when the store is down.
    pub async fn current_users(&self, workspace_id: &str) -> Vec<UserSnapshot> {
        let record = self.load_record(&Scope::workspace(workspace_id)).await;
        dedupe_by_email(&record)
    }

    /// Transport disconnect: start one grace timer per workspace this
    /// session occupies. Returns how many timers were armed.
    pub fn schedule_disconnect(&self, session_id: &str) -> usize {
        let mut armed = 0;
        for entry in self.inner.rooms.iter() {
            let Some(member) = entry.value().get(session_id) else {
                continue;
            };

            let workspace_id = entry.key().clone();
            let email = member.user.email.clone();
            let pending_key = (workspace_id.clone(), email.clone());

            let presence = self.clone();
            let timer_ws = workspace_id.clone();
            let timer_email = email.clone();
            let timer_session = session_id.to_owned();
            let handle = tokio::spawn(async move {
                sleep(RECONNECT_GRACE).await;
                presence
                    .fire_pending(&timer_ws, &timer_email, &timer_session)
                    .await;
            })
            .abort_handle();

            // A newer timer for the same email supersedes the old one.
            if let Some(previous) = self.inner.pending.insert(
                pending_key,
                PendingDisconnect {
                    session_id: session_id.to_owned(),
                    handle,
                },
            ) {
                previous.handle.abort();
            }
            armed += 1;
        }
        armed
    }

    async fn fire_pending(&self, workspace_id: &str, email: &str, session_id: &str) {
        let key = (workspace_id.to_owned(), email.to_owned());
        let still_pending = self
            .inner
            .pending
            .remove_if(&key, |_, pending| pending.session_id == session_id)
            .is_some();
        if !still_pending {
            return;
        }

        debug!(workspace_id, email, "reconnect grace expired; finalizing leave");
        self.apply_leave(workspace_id, session_id).await;
    }

    /// Cancel a pending timer for this email in this workspace.
    /// Returns true when one existed (the join is a reconnection).
    pub fn cancel_pending(&self, workspace_id: &str, email: &str) -> bool {
        if let Some((_, pending)) = self
            .inner
            .pending
            .remove(&(workspace_id.to_owned(), email.to_owned()))
        {
            pending.handle.abort();
            true
        } else {
            false
        }
    }

    fn cancel_pending_session(&self, workspace_id: &str, session_id: &str) {
        let key = self.inner.pending.iter().find_map(|entry| {
            (entry.key().0 == workspace_id && entry.value().session_id == session_id)
                .then(|| entry.key().clone())
        });
        if let Some(key) = key {
            if let Some((_, pending)) = self.inner.pending.remove(&key) {
                pending.handle.abort();
            }
        }
    }

    /// Every workspace and email this session currently occupies; used
    /// by the disconnect path to clear dependent state (typing).
    pub fn sessions_of(&self, session_id: &str) -> Vec<(String, String)> {
        self.inner
            .rooms
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get(session_id)
                    .map(|member| (entry.key().clone(), member.user.email.clone()))
            })
            .collect()
    }

    pub fn active_workspaces(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Collapse duplicate emails in every workspace, locally and in the
    /// shared store. Returns the number of evicted sessions.
    pub async fn sweep_duplicates(&self) -> usize {
        let mut evicted = 0;

        let workspace_ids: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for workspace_id in workspace_ids {
            evicted += self.dedupe_workspace(&workspace_id).await;
        }

        // Shared-store walk picks up workspaces other instances own.
        match self.inner.store.keys("workspace:*:users").await {
            Ok(keys) => {
                for key in keys {
                    let Some(workspace_id) = workspace_id_from_key(&key) else {
                        continue;
                    };
                    if self.inner.rooms.contains_key(&workspace_id) {
                        continue;
                    }
                    evicted += self.dedupe_shared_only(&key).await;
                }
            }
            Err(err) => debug!(error = %err, "duplicate sweep skipped shared walk"),
        }

        evicted
    }

    async fn dedupe_workspace(&self, workspace_id: &str) -> usize {
        let scope = Scope::workspace(workspace_id);
        let mut record = self.load_record(&scope).await;
        let stale = stale_duplicate_sessions(&record);
        if stale.is_empty() {
            return 0;
        }

        for session_id in &stale {
            record.remove(session_id);
        }
        self.store_local(workspace_id, &record);
        self.write_record(&scope, &record).await;
        stale.len()
    }

    async fn dedupe_shared_only(&self, key: &str) -> usize {
        let Ok(Some(value)) = self.inner.store.get_bypass_cache(key).await else {
            return 0;
        };
        let Ok(mut record) = serde_json::from_value::<PresenceRecord>(value) else {
            return 0;
        };

        let stale = stale_duplicate_sessions(&record);
        if stale.is_empty() {
            return 0;
        }
        for session_id in &stale {
            record.remove(session_id);
        }
        if let Err(err) = self.inner.store.set(key, &json!(record)).await {
            self.inner.store.count_dropped_write();
            debug!(key, error = %err, "duplicate sweep write dropped");
        }
        stale.len()
    }

    // ---- record plumbing ---------------------------------------------

    async fn load_record(&self, scope: &Scope) -> PresenceRecord {
        match self.inner.store.get_bypass_cache(&scope.store_key()).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => PresenceRecord::new(),
            Err(_) => self
                .inner
                .rooms
                .get(scope.workspace_id())
                .map(|entry| entry.clone())
                .unwrap_or_default(),
        }
    }

    fn store_local(&self, workspace_id: &str, record: &PresenceRecord) {
        if record.is_empty() {
            self.inner.rooms.remove(workspace_id);
            self.inner.last_seen.remove(workspace_id);
        } else {
            self.inner
                .rooms
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
            warn!(key, error = %err, "presence write dropped; serving local state");
        }
    }

    fn touch_last_seen(&self, workspace_id: &str, email: &str) {
        self.inner
            .last_seen
            .entry(workspace_id.to_owned())
            .or_default()
            .insert(email.to_owned(), now_millis());
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

fn workspace_id_from_key(key: &str) -> Option<String> {
    let rest = key.strip_prefix("workspace:")?;
    let workspace_id = rest.strip_suffix(":users")?;
    (!workspace_id.is_empty()).then(|| workspace_id.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep as test_sleep;

    fn presence() -> WorkspacePresence {
        WorkspacePresence::new(
            SharedStore::disabled(),
            Arc::new(MetricsRegistry::default()),
            RoomEmitter::default(),
        )
    }

    fn user(email: &str) -> UserSnapshot {
        UserSnapshot {
            id: format!("id-{email}"),
            email: email.to_owned(),
            name: email.to_owned(),
            image: None,
        }
    }

    #[tokio::test]
    async fn join_deduplicates_broadcast_by_email() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        presence.apply_join("ws1", "s2", user("bob@x")).await;
        let outcome = presence.apply_join("ws1", "s3", user("alice@x")).await;

        let emails: Vec<_> = outcome.users.iter().map(|u| u.email.as_str()).collect();
        assert_eq!(emails.len(), 2);
        assert!(emails.contains(&"alice@x"));
        assert!(emails.contains(&"bob@x"));
    }

    #[tokio::test]
    async fn rejoining_email_evicts_the_older_session() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        presence.apply_join("ws1", "s2", user("alice@x")).await;

        // The original session is gone, so leaving with it is a no-op.
        assert!(presence.apply_leave("ws1", "s1").await.is_none());
        assert!(presence.apply_leave("ws1", "s2").await.is_some());
    }

    #[tokio::test]
    async fn first_join_is_flagged_only_for_new_emails() {
        let presence = presence();
        let first = presence.apply_join("ws1", "s1", user("alice@x")).await;
        assert!(first.first_join);

        let second = presence.apply_join("ws1", "s2", user("alice@x")).await;
        assert!(!second.first_join, "same email already present");
    }

    #[tokio::test]
    async fn leave_of_last_member_reclaims_the_workspace() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        assert_eq!(presence.active_workspaces(), 1);

        presence.apply_leave("ws1", "s1").await;
        assert_eq!(presence.active_workspaces(), 0);
    }

    #[tokio::test]
    async fn rejoin_within_grace_cancels_the_pending_timer() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;

        assert_eq!(presence.schedule_disconnect("s1"), 1);
        assert_eq!(presence.pending_count(), 1);

        let outcome = presence.apply_join("ws1", "s2", user("alice@x")).await;
        assert!(outcome.was_reconnect);
        assert!(!outcome.first_join);
        assert_eq!(presence.pending_count(), 0);
    }

    #[tokio::test]
    async fn explicit_leave_cancels_the_pending_timer() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        presence.schedule_disconnect("s1");

        presence.apply_leave("ws1", "s1").await;
        assert_eq!(presence.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_finalizes_the_leave_exactly_once() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        presence.schedule_disconnect("s1");

        tokio::time::advance(RECONNECT_GRACE + Duration::from_millis(50)).await;
        // Yield so the timer task runs to completion.
        test_sleep(Duration::from_millis(1)).await;

        assert_eq!(presence.active_workspaces(), 0);
        assert_eq!(presence.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_sweep_keeps_the_most_recent_session() {
        let presence = presence();
        // Bypass the join-time eviction by writing the local map
        // directly, as a racing instance would.
        let mut record = PresenceRecord::new();
        record.insert(
            "s1".into(),
            PresenceMember {
                user: user("alice@x"),
                joined_at: 1,
            },
        );
        record.insert(
            "s2".into(),
            PresenceMember {
                user: user("alice@x"),
                joined_at: 2,
            },
        );
        presence.inner.rooms.insert("ws1".into(), record);

        let evicted = presence.sweep_duplicates().await;
        assert_eq!(evicted, 1);

        let users = presence.current_users("ws1").await;
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn sessions_of_reports_workspace_and_email() {
        let presence = presence();
        presence.apply_join("ws1", "s1", user("alice@x")).await;
        presence.apply_join("ws2", "s1", user("alice@x")).await;

        let mut sessions = presence.sessions_of("s1");
        sessions.sort();
        assert_eq!(
            sessions,
            vec![
                ("ws1".to_string(), "alice@x".to_string()),
                ("ws2".to_string(), "alice@x".to_string()),
            ]
        );
    }
}
