//! Collection presence. Same record shape as workspace presence but
//! broadcast to the parent workspace room so member sidebars stay
//! current, and with no disconnect grace: a dropped transport removes
//! the session immediately.

use std::sync::Arc;

use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use corelay_core::user::{PresenceMember, PresenceRecord, UserSnapshot, dedupe_by_email};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, warn};

use crate::socket::rooms::{Scope, collection_id_from_key, collection_scan_pattern};
use crate::socket::types::RoomEmitter;

use super::now_millis;

#[derive(Clone)]
pub struct CollectionPresence {
    inner: Arc<Inner>,
}

struct Inner {
    store: SharedStore,
    metrics: Arc<MetricsRegistry>,
    emitter: RoomEmitter,
    /// (workspace id, collection id) -> session id -> member
    collections: DashMap<(String, String), PresenceRecord>,
}

impl CollectionPresence {
    pub fn new(store: SharedStore, metrics: Arc<MetricsRegistry>, emitter: RoomEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                emitter,
                collections: DashMap::new(),
            }),
        }
    }

    pub async fn apply_join(
        &self,
        workspace_id: &str,
        collection_id: &str,
        session_id: &str,
        user: UserSnapshot,
    ) -> Vec<UserSnapshot> {
        let scope = Scope::collection(workspace_id, collection_id);
        let mut record = self.load_record(&scope, workspace_id, collection_id).await;

        record.retain(|sid, member| member.user.email != user.email || sid == session_id);
        record.insert(
            session_id.to_owned(),
            PresenceMember {
                user: user.clone(),
                joined_at: now_millis(),
            },
        );

        self.store_local(workspace_id, collection_id, &record);
        self.write_record(&scope, &record).await;

        let users = dedupe_by_email(&record);
        self.notify_workspace(
            workspace_id,
            collection_id,
            Some(("collection_user_joined", &user)),
            &users,
        )
        .await;
        self.inner.metrics.count("user_joined_collection");
        users
    }

    pub async fn apply_leave(
        &self,
        workspace_id: &str,
        collection_id: &str,
        session_id: &str,
    ) -> Option<UserSnapshot> {
        let scope = Scope::collection(workspace_id, collection_id);
        let mut record = self.load_record(&scope, workspace_id, collection_id).await;
        let removed = record.remove(session_id)?;

        self.store_local(workspace_id, collection_id, &record);
        self.write_record(&scope, &record).await;

        let users = dedupe_by_email(&record);
        self.notify_workspace(
            workspace_id,
            collection_id,
            Some(("collection_user_left", &removed.user)),
            &users,
        )
        .await;
        self.inner.metrics.count("user_left_collection");
        Some(removed.user)
    }

    /// Snapshot of every non-empty collection in the workspace, keyed
    /// for one `collection_users_updated` unicast each. Shared-store
    /// scan first; local view when the store is down.
    pub async fn collections_of(&self, workspace_id: &str) -> Vec<(String, Vec<UserSnapshot>)> {
        match self
            .inner
            .store
            .keys(&collection_scan_pattern(workspace_id))
            .await
        {
            Ok(keys) => {
                let mut out = Vec::new();
                for key in keys {
                    let Some(collection_id) = collection_id_from_key(workspace_id, &key) else {
                        continue;
                    };
                    let record = self
                        .load_record(
                            &Scope::collection(workspace_id, &collection_id),
                            workspace_id,
                            &collection_id,
                        )
                        .await;
                    if !record.is_empty() {
                        out.push((collection_id, dedupe_by_email(&record)));
                    }
                }
                out
            }
            Err(err) => {
                debug!(workspace_id, error = %err, "collection scan degraded to local view");
                self.inner
                    .collections
                    .iter()
                    .filter(|entry| entry.key().0 == workspace_id && !entry.value().is_empty())
                    .map(|entry| (entry.key().1.clone(), dedupe_by_email(entry.value())))
                    .collect()
            }
        }
    }

    /// Immediate removal on transport disconnect; no grace here.
    pub async fn handle_disconnect(&self, session_id: &str) {
        let memberships: Vec<(String, String)> = self
            .inner
            .collections
            .iter()
            .filter(|entry| entry.value().contains_key(session_id))
            .map(|entry| entry.key().clone())
            .collect();

        for (workspace_id, collection_id) in memberships {
            self.apply_leave(&workspace_id, &collection_id, session_id)
                .await;
        }
    }

    async fn notify_workspace(
        &self,
        workspace_id: &str,
        collection_id: &str,
        membership_event: Option<(&str, &UserSnapshot)>,
        users: &[UserSnapshot],
    ) {
        let workspace_room = Scope::workspace(workspace_id).room_name();
        if let Some((event, user)) = membership_event {
            self.inner
                .emitter
                .emit(
                    &workspace_room,
                    event,
                    &json!({ "collectionId": collection_id, "user": user }),
                )
                .await;
        }
        self.inner
            .emitter
            .emit(
                &workspace_room,
                "collection_users_updated",
                &json!({ "collectionId": collection_id, "users": users }),
            )
            .await;
    }

    async fn load_record(
        &self,
        scope: &Scope,
        workspace_id: &str,
        collection_id: &str,
    ) -> PresenceRecord {
        match self.inner.store.get_bypass_cache(&scope.store_key()).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => PresenceRecord::new(),
            Err(_) => self
                .inner
                .collections
                .get(&(workspace_id.to_owned(), collection_id.to_owned()))
                .map(|entry| entry.clone())
                .unwrap_or_default(),
        }
    }

    fn store_local(&self, workspace_id: &str, collection_id: &str, record: &PresenceRecord) {
        let key = (workspace_id.to_owned(), collection_id.to_owned());
        if record.is_empty() {
            self.inner.collections.remove(&key);
        } else {
            self.inner.collections.insert(key, record.clone());
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
            warn!(key, error = %err, "collection presence write dropped");
        }
    }

    #[cfg(test)]
    fn tracked_collections(&self) -> usize {
        self.inner.collections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence() -> CollectionPresence {
        CollectionPresence::new(
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
    async fn join_and_leave_round_trip() {
        let presence = presence();
        let users = presence
            .apply_join("ws1", "c1", "s1", user("alice@x"))
            .await;
        assert_eq!(users.len(), 1);

        let removed = presence.apply_leave("ws1", "c1", "s1").await;
        assert_eq!(removed.unwrap().email, "alice@x");
        assert_eq!(presence.tracked_collections(), 0);
    }

    #[tokio::test]
    async fn duplicate_email_is_collapsed_on_join() {
        let presence = presence();
        presence.apply_join("ws1", "c1", "s1", user("alice@x")).await;
        let users = presence
            .apply_join("ws1", "c1", "s2", user("alice@x"))
            .await;
        assert_eq!(users.len(), 1);
        assert!(presence.apply_leave("ws1", "c1", "s1").await.is_none());
    }

    #[tokio::test]
    async fn disconnect_removes_every_membership_immediately() {
        let presence = presence();
        presence.apply_join("ws1", "c1", "s1", user("alice@x")).await;
        presence.apply_join("ws1", "c2", "s1", user("alice@x")).await;
        assert_eq!(presence.tracked_collections(), 2);

        presence.handle_disconnect("s1").await;
        assert_eq!(presence.tracked_collections(), 0);
    }

    #[tokio::test]
    async fn collections_of_degrades_to_local_view_when_store_is_down() {
        let presence = presence();
        presence.apply_join("ws1", "c1", "s1", user("alice@x")).await;
        presence.apply_join("ws1", "c2", "s2", user("bob@x")).await;
        presence.apply_join("ws2", "c9", "s3", user("eve@x")).await;

        let mut collections = presence.collections_of("ws1").await;
        collections.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].0, "c1");
        assert_eq!(collections[1].0, "c2");
    }
}
