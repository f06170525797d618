use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::StreamExt;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, broadcast};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    CircuitBreaker, EXTENDED_BREAKER_HOLD, HealthStatus, LONG_RETRY_DELAY, LocalCache,
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, StoreError, StoreHealth, StoreResult,
};

const SUBSCRIPTION_BUFFER: usize = 256;
const SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_secs(5);
const DEGRADED_THRESHOLD: Duration = Duration::from_millis(100);

/// Process-singleton client for the remote key-value + pub/sub store.
/// Reads go through the bounded local cache; every operation is gated
/// by the circuit breaker and reports a typed result instead of
/// panicking or raising, so callers can degrade to local state.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    url: String,
    connection: RwLock<Option<MultiplexedConnection>>,
    cache: LocalCache,
    breaker: CircuitBreaker,
    reconnect_attempts: AtomicU32,
    reconnect_scheduled: AtomicBool,
    subscriptions: DashMap<String, broadcast::Sender<String>>,
    dropped_writes: AtomicU64,
    closed: AtomicBool,
}

impl SharedStore {
    /// Connect to the store at `url`. A failed first connection does
    /// not fail construction: the client starts degraded and the
    /// reconnect loop keeps trying in the background.
    pub async fn connect(url: impl Into<String>) -> Self {
        let store = Self::offline(url);
        match store.initialize().await {
            Ok(()) => info!(url = %store.inner.url, "connected to shared store"),
            Err(err) => {
                warn!(url = %store.inner.url, error = %err, "initial shared store connection failed");
                store.schedule_reconnect();
            }
        }
        store
    }

    /// A client with no connection and no reconnect loop. Operations
    /// report `NotConnected`; used by tests and local-only runs.
    pub fn disabled() -> Self {
        let store = Self::offline("redis://disabled");
        store.inner.closed.store(true, Ordering::SeqCst);
        store
    }

    fn offline(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                url: url.into(),
                connection: RwLock::new(None),
                cache: LocalCache::default(),
                breaker: CircuitBreaker::default(),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_scheduled: AtomicBool::new(false),
                subscriptions: DashMap::new(),
                dropped_writes: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    pub fn dropped_writes(&self) -> u64 {
        self.inner.dropped_writes.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.read().await.is_some()
    }

    pub fn breaker_open(&self) -> bool {
        self.inner.breaker.is_open()
    }

    /// Drop the connection and stop reconnecting. Part of graceful
    /// shutdown.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.connection.write().await = None;
        self.inner.subscriptions.clear();
    }

    // ---- operations --------------------------------------------------

    pub async fn set(&self, key: &str, value: &JsonValue) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        match redis::cmd("SET")
            .arg(key)
            .arg(text)
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => {
                self.inner.breaker.record_success();
                self.inner.cache.put(key, value.clone());
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &JsonValue, ttl: Duration) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        match redis::cmd("SET")
            .arg(key)
            .arg(text)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => {
                self.inner.breaker.record_success();
                self.inner.cache.put(key, value.clone());
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<JsonValue>> {
        self.get_inner(key, false).await
    }

    pub async fn get_bypass_cache(&self, key: &str) -> StoreResult<Option<JsonValue>> {
        self.get_inner(key, true).await
    }

    async fn get_inner(&self, key: &str, bypass_cache: bool) -> StoreResult<Option<JsonValue>> {
        if !bypass_cache {
            if let Some(value) = self.inner.cache.get(key) {
                return Ok(Some(value));
            }
        }

        let mut conn = self.conn().await?;
        match redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(Some(raw)) => {
                self.inner.breaker.record_success();
                let value = parse_value(&raw);
                self.inner.cache.put(key, value.clone());
                Ok(Some(value))
            }
            Ok(None) => {
                self.inner.breaker.record_success();
                Ok(None)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.cache.remove(key);
        let mut conn = self.conn().await?;
        match redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await {
            Ok(_) => {
                self.inner.breaker.record_success();
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<JsonValue>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        match cmd.query_async::<Vec<Option<String>>>(&mut conn).await {
            Ok(rows) => {
                self.inner.breaker.record_success();
                let values = rows
                    .into_iter()
                    .zip(keys)
                    .map(|(raw, key)| {
                        raw.map(|raw| {
                            let value = parse_value(&raw);
                            self.inner.cache.put(key, value.clone());
                            value
                        })
                    })
                    .collect();
                Ok(values)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn mset(&self, pairs: &[(String, JsonValue)]) -> StoreResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MSET");
        for (key, value) in pairs {
            cmd.arg(key).arg(serde_json::to_string(value)?);
        }
        match cmd.query_async::<()>(&mut conn).await {
            Ok(()) => {
                self.inner.breaker.record_success();
                for (key, value) in pairs {
                    self.inner.cache.put(key, value.clone());
                }
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        match redis::cmd("INCR").arg(key).query_async::<i64>(&mut conn).await {
            Ok(count) => {
                self.inner.breaker.record_success();
                self.inner.cache.put(key, JsonValue::from(count));
                Ok(count)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        match redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<i64>(&mut conn)
            .await
        {
            Ok(applied) => {
                self.inner.breaker.record_success();
                Ok(applied == 1)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        match redis::cmd("KEYS")
            .arg(pattern)
            .query_async::<Vec<String>>(&mut conn)
            .await
        {
            Ok(keys) => {
                self.inner.breaker.record_success();
                Ok(keys)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn publish(&self, channel: &str, value: &JsonValue) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        match redis::cmd("PUBLISH")
            .arg(channel)
            .arg(text)
            .query_async::<i64>(&mut conn)
            .await
        {
            Ok(_) => {
                self.inner.breaker.record_success();
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Subscribe to a pub/sub channel. The first subscriber spawns a
    /// listener task that forwards payloads into an in-process
    /// broadcast channel; later subscribers share it.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        if let Some(sender) = self.inner.subscriptions.get(channel) {
            return sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .subscriptions
            .insert(channel.to_owned(), sender.clone());

        let store = self.clone();
        let channel = channel.to_owned();
        tokio::spawn(async move {
            store.subscription_loop(channel, sender).await;
        });

        receiver
    }

    /// Count a write that was dropped because the store was
    /// unavailable. Handlers call this when they swallow a failure.
    pub fn count_dropped_write(&self) {
        self.inner.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn health_check(&self) -> StoreHealth {
        if !self.inner.breaker.allow() {
            return StoreHealth::unhealthy("circuit breaker open");
        }

        let Some(mut conn) = self.inner.connection.read().await.clone() else {
            self.schedule_reconnect();
            return StoreHealth::unhealthy("not connected");
        };

        let started = Instant::now();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => {
                self.inner.breaker.record_success();
                let elapsed = started.elapsed();
                let status = if elapsed < DEGRADED_THRESHOLD {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                };
                StoreHealth {
                    status,
                    response_time_ms: Some(elapsed.as_millis() as u64),
                    error: None,
                }
            }
            Err(err) => {
                let err = self.fail(err).await;
                StoreHealth::unhealthy(err.to_string())
            }
        }
    }

    // ---- connection lifecycle ---------------------------------------

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        if !self.inner.breaker.allow() {
            return Err(StoreError::CircuitOpen);
        }

        match self.inner.connection.read().await.clone() {
            Some(conn) => Ok(conn),
            None => {
                self.inner.breaker.record_failure();
                self.schedule_reconnect();
                Err(StoreError::NotConnected)
            }
        }
    }

    async fn fail(&self, err: redis::RedisError) -> StoreError {
        self.inner.breaker.record_failure();
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            *self.inner.connection.write().await = None;
            self.schedule_reconnect();
        }
        StoreError::Command(err)
    }

    async fn initialize(&self) -> StoreResult<()> {
        let client = redis::Client::open(self.inner.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        *self.inner.connection.write().await = Some(conn);
        self.inner.breaker.record_success();
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn schedule_reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            store.reconnect_loop().await;
            store.inner.reconnect_scheduled.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                warn!(
                    attempts = MAX_RECONNECT_ATTEMPTS,
                    "shared store reconnect attempts exhausted; backing off"
                );
                self.inner.breaker.force_open_for(EXTENDED_BREAKER_HOLD);
                sleep(LONG_RETRY_DELAY).await;
                self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
                continue;
            }

            sleep(reconnect_delay(attempt)).await;

            match self.initialize().await {
                Ok(()) => {
                    info!(attempt, "shared store reconnected");
                    return;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "shared store reconnect attempt failed");
                }
            }
        }
    }

    async fn subscription_loop(&self, channel: String, sender: broadcast::Sender<String>) {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) || sender.receiver_count() == 0 {
                self.inner.subscriptions.remove(&channel);
                return;
            }

            let pubsub = match redis::Client::open(self.inner.url.as_str()) {
                Ok(client) => client.get_async_pubsub().await,
                Err(err) => Err(err),
            };

            let mut pubsub = match pubsub {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    debug!(channel = %channel, error = %err, "pub/sub connection failed");
                    sleep(SUBSCRIPTION_RETRY_DELAY).await;
                    continue;
                }
            };

            if let Err(err) = pubsub.subscribe(&channel).await {
                debug!(channel = %channel, error = %err, "pub/sub subscribe failed");
                sleep(SUBSCRIPTION_RETRY_DELAY).await;
                continue;
            }

            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = sender.send(payload);
                    }
                    Err(err) => {
                        debug!(channel = %channel, error = %err, "dropped unreadable pub/sub payload")
                    }
                }
            }

            // Stream ended: the pub/sub connection died. Retry.
            sleep(SUBSCRIPTION_RETRY_DELAY).await;
        }
    }
}

fn parse_value(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_owned()))
}

fn reconnect_delay(attempt: u32) -> Duration {
    let base = RECONNECT_BASE_DELAY.as_millis() as f64;
    let backoff = base * 1.5_f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = backoff * rand::thread_rng().gen_range(0.0..0.3);
    Duration::from_millis((backoff + jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FAILURE_THRESHOLD;
    use serde_json::json;

    #[test]
    fn parse_value_falls_back_to_raw_text() {
        assert_eq!(parse_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_value("not json"), JsonValue::String("not json".into()));
        assert_eq!(parse_value("42"), json!(42));
    }

    #[test]
    fn reconnect_delay_grows_with_attempts() {
        let first = reconnect_delay(1);
        let fifth = reconnect_delay(5);
        assert!(first >= RECONNECT_BASE_DELAY);
        // 1.5^4 = ~5x base before jitter; jitter adds at most 30%.
        assert!(fifth >= first * 3);
    }

    #[tokio::test]
    async fn disconnected_store_reports_not_connected() {
        let store = SharedStore::disabled();
        match store.get("k").await {
            Err(StoreError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
        assert!(!store.is_connected().await);
    }

    #[tokio::test]
    async fn repeated_failures_open_the_breaker() {
        let store = SharedStore::disabled();
        for _ in 0..FAILURE_THRESHOLD {
            let _ = store.get("k").await;
        }
        match store.get("k").await {
            Err(StoreError::CircuitOpen) => {}
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert!(store.breaker_open());
    }

    #[tokio::test]
    async fn unavailable_writes_do_not_populate_the_cache() {
        let store = SharedStore::disabled();
        let _ = store.set("k", &json!({"a": 1})).await;
        assert_eq!(store.cache().get("k"), None);
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_when_offline() {
        let store = SharedStore::disabled();
        let health = store.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn dropped_write_counter_accumulates() {
        let store = SharedStore::disabled();
        store.count_dropped_write();
        store.count_dropped_write();
        assert_eq!(store.dropped_writes(), 2);
    }
}
