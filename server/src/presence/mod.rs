pub mod collection;
pub mod workspace;

pub use collection::CollectionPresence;
pub use workspace::WorkspacePresence;

use std::time::Duration;

pub const RECONNECT_GRACE: Duration = Duration::from_secs(5);
pub const DUPLICATE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
