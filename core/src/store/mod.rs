mod breaker;
mod cache;
mod client;

pub use breaker::CircuitBreaker;
pub use cache::{CacheConfig, CacheStats, LocalCache};
pub use client::SharedStore;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub const CACHE_TTL: Duration = Duration::from_secs(30);
pub const CACHE_CAPACITY: usize = 10_000;
pub const FAILURE_THRESHOLD: u32 = 5;
pub const RESET_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const EXTENDED_BREAKER_HOLD: Duration = Duration::from_secs(60);
pub const LONG_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Shared-store operations return this instead of raising: callers pick
/// between degrading to local state and surfacing the failure.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store is not connected")]
    NotConnected,
    #[error("shared store circuit breaker is open")]
    CircuitOpen,
    #[error("shared store command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("failed to encode value for shared store: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the failure is the breaker or the link, not the data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::NotConnected | StoreError::CircuitOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    #[serde(rename = "responseTime")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error.into()),
        }
    }
}
