use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

pub const SNAPSHOT_CAPACITY: usize = 1440;
pub const SNAPSHOT_RETENTION_HOURS: i64 = 24;
pub const ALERT_CAPACITY: usize = 10;

/// One-minute roll-up of the registry's scalar state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteSnapshot {
    pub at: DateTime<Utc>,
    pub active_connections: i64,
    pub total_connections: u64,
    pub messages_last_minute: u64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub total_errors: u64,
    pub rss_bytes: u64,
}

/// Bounded time series of minute snapshots; capacity plus a wall-clock
/// retention window so restarts with skewed clocks still converge.
#[derive(Debug, Default)]
pub struct SnapshotRing {
    entries: VecDeque<MinuteSnapshot>,
}

impl SnapshotRing {
    pub fn push(&mut self, snapshot: MinuteSnapshot) {
        if self.entries.len() >= SNAPSHOT_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(SNAPSHOT_RETENTION_HOURS);
        let before = self.entries.len();
        while self
            .entries
            .front()
            .is_some_and(|snapshot| snapshot.at < cutoff)
        {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn latest(&self, count: usize) -> Vec<MinuteSnapshot> {
        self.entries
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighLatency,
    HighErrorRate,
    HighMemory,
    StoreDegraded,
    StoreUnhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The ten most recent alerts, oldest dropped first.
#[derive(Debug, Default)]
pub struct AlertRing {
    entries: VecDeque<Alert>,
}

impl AlertRing {
    pub fn push(&mut self, alert: Alert) {
        if self.entries.len() >= ALERT_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(alert);
    }

    pub fn all(&self) -> Vec<Alert> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(at: DateTime<Utc>) -> MinuteSnapshot {
        MinuteSnapshot {
            at,
            active_connections: 1,
            total_connections: 1,
            messages_last_minute: 0,
            mean_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            total_errors: 0,
            rss_bytes: 0,
        }
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let mut ring = SnapshotRing::default();
        let base = Utc::now();
        for i in 0..(SNAPSHOT_CAPACITY + 5) {
            ring.push(snapshot(base + ChronoDuration::minutes(i as i64)));
        }
        assert_eq!(ring.len(), SNAPSHOT_CAPACITY);
    }

    #[test]
    fn prune_removes_entries_past_retention() {
        let mut ring = SnapshotRing::default();
        let now = Utc::now();
        ring.push(snapshot(now - ChronoDuration::hours(30)));
        ring.push(snapshot(now - ChronoDuration::minutes(5)));
        let removed = ring.prune(now);
        assert_eq!(removed, 1);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn alert_ring_keeps_only_most_recent_ten() {
        let mut ring = AlertRing::default();
        for i in 0..15 {
            ring.push(Alert {
                kind: AlertKind::HighLatency,
                message: format!("alert {i}"),
                at: Utc::now(),
            });
        }
        assert_eq!(ring.len(), ALERT_CAPACITY);
        assert_eq!(ring.all().first().unwrap().message, "alert 5");
    }
}
