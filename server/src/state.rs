use std::sync::Arc;
use std::time::{Duration, Instant};

use corelay_core::config::AppConfig;
use corelay_core::metrics::MetricsRegistry;
use corelay_core::store::SharedStore;
use tokio::{spawn, time::sleep};
use tracing::{debug, warn};

use crate::agenda::AgendaHandler;
use crate::chat::{ChatHandler, TYPING_TIMEOUT};
use crate::notes::NoteHandler;
use crate::presence::{CollectionPresence, DUPLICATE_SWEEP_INTERVAL, WorkspacePresence};
use crate::rate_limit::ConnectionRateLimiter;
use crate::socket::types::RoomEmitter;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: SharedStore,
    pub metrics: Arc<MetricsRegistry>,
    pub rate_limiter: ConnectionRateLimiter,
    pub emitter: RoomEmitter,
    pub workspaces: WorkspacePresence,
    pub collections: CollectionPresence,
    pub chat: ChatHandler,
    pub notes: NoteHandler,
    pub agenda: AgendaHandler,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the handlers onto their shared collaborators. Does not
    /// spawn the operational loops; `build_state` does.
    pub fn new(config: AppConfig, store: SharedStore) -> Self {
        let metrics = Arc::new(MetricsRegistry::default());
        let emitter = RoomEmitter::default();

        Self {
            workspaces: WorkspacePresence::new(store.clone(), metrics.clone(), emitter.clone()),
            collections: CollectionPresence::new(store.clone(), metrics.clone(), emitter.clone()),
            chat: ChatHandler::new(store.clone(), metrics.clone(), emitter.clone()),
            notes: NoteHandler::new(store.clone(), metrics.clone(), emitter.clone()),
            agenda: AgendaHandler::new(store.clone(), metrics.clone(), emitter.clone()),
            rate_limiter: ConnectionRateLimiter::default(),
            started_at: Instant::now(),
            config,
            store,
            metrics,
            emitter,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub async fn build_state(config: AppConfig) -> AppState {
    let store = SharedStore::connect(config.redis_url()).await;
    let state = AppState::new(config, store);
    spawn_background_tasks(&state);
    state
}

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const ALERT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const ARCHIVE_INTERVAL: Duration = Duration::from_secs(3600);
const DAILY_ROLLUP_TTL: Duration = Duration::from_secs(90 * 24 * 3600);

pub fn spawn_background_tasks(state: &AppState) {
    start_typing_sweeper(state.chat.clone());
    start_duplicate_sweeper(state.workspaces.clone());
    start_cache_sweeper(state.store.clone());
    start_rate_limit_sweeper(state.rate_limiter.clone());
    start_system_metrics_loop(state.clone());
    start_snapshot_loop(state.metrics.clone());
    start_alert_loop(state.metrics.clone());
    start_archive_loop(state.clone());
}

fn start_typing_sweeper(chat: ChatHandler) {
    spawn(async move {
        loop {
            sleep(TYPING_TIMEOUT).await;
            let evicted = chat.sweep_typing().await;
            if evicted > 0 {
                debug!(evicted, "typing sweeper evicted stale entries");
            }
        }
    });
}

fn start_duplicate_sweeper(workspaces: WorkspacePresence) {
    spawn(async move {
        loop {
            sleep(DUPLICATE_SWEEP_INTERVAL).await;
            let evicted = workspaces.sweep_duplicates().await;
            if evicted > 0 {
                debug!(evicted, "duplicate sweeper collapsed sessions");
            }
        }
    });
}

fn start_cache_sweeper(store: SharedStore) {
    spawn(async move {
        loop {
            sleep(CACHE_SWEEP_INTERVAL).await;
            let evicted = store.cache().evict_expired();
            if evicted > 0 {
                debug!(evicted, "cache sweeper evicted expired entries");
            }
        }
    });
}

fn start_rate_limit_sweeper(rate_limiter: ConnectionRateLimiter) {
    spawn(async move {
        loop {
            sleep(RATE_LIMIT_SWEEP_INTERVAL).await;
            rate_limiter.sweep();
        }
    });
}

fn start_system_metrics_loop(state: AppState) {
    spawn(async move {
        loop {
            sleep(SYSTEM_METRICS_INTERVAL).await;
            let health = state.store.health_check().await;
            state.metrics.refresh_system(health);
            state
                .metrics
                .set_active_workspaces(state.workspaces.active_workspaces() as u64);
        }
    });
}

fn start_snapshot_loop(metrics: Arc<MetricsRegistry>) {
    spawn(async move {
        loop {
            sleep(SNAPSHOT_INTERVAL).await;
            metrics.take_minute_snapshot();
        }
    });
}

fn start_alert_loop(metrics: Arc<MetricsRegistry>) {
    spawn(async move {
        loop {
            sleep(ALERT_CHECK_INTERVAL).await;
            for alert in metrics.check_alerts() {
                warn!(kind = ?alert.kind, message = %alert.message, "metrics alert fired");
            }
        }
    });
}

fn start_archive_loop(state: AppState) {
    spawn(async move {
        loop {
            sleep(ARCHIVE_INTERVAL).await;
            let pruned = state.metrics.cleanup();
            if pruned > 0 {
                debug!(pruned, "pruned metric snapshots past retention");
            }

            let rollup = state.metrics.daily_rollup();
            let date = rollup["date"].as_str().unwrap_or_default().to_owned();
            let key = format!("metrics:daily:{date}");
            if let Err(err) = state.store.set_with_ttl(&key, &rollup, DAILY_ROLLUP_TTL).await {
                state.store.count_dropped_write();
                debug!(key, error = %err, "daily metrics roll-up dropped");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_shares_one_store_and_metrics_instance() {
        let state = AppState::new(AppConfig::default(), SharedStore::disabled());

        state.metrics.count("probe");
        let summary = state.metrics.summary(true);
        assert_eq!(summary["counters"]["probe"], 1);

        // The chat handler writes through the same store singleton.
        state.store.count_dropped_write();
        assert_eq!(state.store.dropped_writes(), 1);
    }

    #[tokio::test]
    async fn uptime_starts_near_zero() {
        let state = AppState::new(AppConfig::default(), SharedStore::disabled());
        assert!(state.uptime_seconds() < 5);
    }
}
