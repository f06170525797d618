//! Per-IP connection rate limiting at the handshake edge.
//!
//! Fixed 60 s windows per client IP: the bucket counts connections
//! since its window start and resets when the window lapses. A sweeper
//! purges buckets idle for more than two windows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

pub const MAX_CONNECTIONS_PER_MINUTE: u32 = 60;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const IDLE_BUCKET_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("too many connections (max {MAX_CONNECTIONS_PER_MINUTE}/min per client)")]
    TooManyConnections,
}

#[derive(Clone)]
pub struct ConnectionRateLimiter {
    inner: Arc<Mutex<HashMap<String, Bucket>>>,
    limit: u32,
    window: Duration,
}

struct Bucket {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new(MAX_CONNECTIONS_PER_MINUTE, RATE_LIMIT_WINDOW)
    }
}

impl ConnectionRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    /// Count one connection attempt from `ip`, rejecting when the
    /// window budget is spent.
    pub fn check_and_record(&self, ip: &str) -> Result<(), RateLimitError> {
        self.check_and_record_at(ip, Instant::now())
    }

    fn check_and_record_at(&self, ip: &str, now: Instant) -> Result<(), RateLimitError> {
        let mut buckets = self.inner.lock().expect("rate limit lock poisoned");
        let bucket = buckets.entry(ip.to_owned()).or_insert(Bucket {
            count: 0,
            window_start: now,
            last_seen: now,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.last_seen = now;

        if bucket.count >= self.limit {
            return Err(RateLimitError::TooManyConnections);
        }

        bucket.count += 1;
        Ok(())
    }

    /// Remove buckets idle for more than two windows; returns how many
    /// were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let idle_after = self.window * 2;
        let mut buckets = self.inner.lock().expect("rate limit lock poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) <= idle_after);
        before - buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.lock().expect("rate limit lock poisoned").len()
    }
}
