mod snapshot;

pub use snapshot::{Alert, AlertKind, AlertRing, MinuteSnapshot, SnapshotRing};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value as JsonValue, json};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

use crate::store::{HealthStatus, StoreHealth};

pub const HIGH_LATENCY_MS: f64 = 500.0;
pub const HIGH_ERROR_RATE_PCT: f64 = 5.0;
pub const HIGH_MEMORY_PCT: f64 = 90.0;

const LATENCY_RESERVOIR: usize = 1024;

/// Gateway-wide metrics: atomics for the hot counters, dashmaps for
/// the by-type breakdowns, mutexes only around the complex rings.
pub struct MetricsRegistry {
    started_at: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicI64,
    peak: Mutex<PeakConnections>,
    messages_by_type: DashMap<String, u64>,
    errors_by_type: DashMap<String, u64>,
    counters: DashMap<String, u64>,
    latency: Mutex<LatencyReservoir>,
    by_user_agent: DashMap<String, u64>,
    by_country: DashMap<String, u64>,
    active_workspaces: AtomicU64,
    messages_this_minute: AtomicU64,
    message_rate_per_minute: AtomicU64,
    system: Mutex<SystemGauges>,
    store_health: Mutex<Option<StoreHealth>>,
    snapshots: Mutex<SnapshotRing>,
    alerts: Mutex<AlertRing>,
    sampler: Mutex<Option<(System, Pid)>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PeakConnections {
    count: i64,
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SystemGauges {
    rss_bytes: u64,
    virtual_bytes: u64,
    cpu_pct: f64,
    memory_pct: f64,
}

#[derive(Debug, Default)]
struct LatencyReservoir {
    samples: VecDeque<f64>,
}

impl LatencyReservoir {
    fn record(&mut self, latency_ms: f64) {
        if self.samples.len() >= LATENCY_RESERVOIR {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let index = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[index.saturating_sub(1).min(sorted.len() - 1)]
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        let sampler = sysinfo::get_current_pid()
            .map(|pid| (System::new(), pid))
            .map_err(|err| warn!(error = %err, "process sampler unavailable"))
            .ok();

        Self {
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            peak: Mutex::new(PeakConnections::default()),
            messages_by_type: DashMap::new(),
            errors_by_type: DashMap::new(),
            counters: DashMap::new(),
            latency: Mutex::new(LatencyReservoir::default()),
            by_user_agent: DashMap::new(),
            by_country: DashMap::new(),
            active_workspaces: AtomicU64::new(0),
            messages_this_minute: AtomicU64::new(0),
            message_rate_per_minute: AtomicU64::new(0),
            system: Mutex::new(SystemGauges::default()),
            store_health: Mutex::new(None),
            snapshots: Mutex::new(SnapshotRing::default()),
            alerts: Mutex::new(AlertRing::default()),
            sampler: Mutex::new(sampler),
        }
    }
}

impl MetricsRegistry {
    pub fn connection_opened(&self, user_agent: Option<&str>, country: Option<&str>) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;

        let mut peak = self.peak.lock().expect("peak lock poisoned");
        if active > peak.count {
            peak.count = active;
            peak.at = Some(Utc::now());
        }
        drop(peak);

        let agent = agent_family(user_agent);
        *self.by_user_agent.entry(agent.to_owned()).or_insert(0) += 1;
        let country = country.unwrap_or("unknown").to_ascii_uppercase();
        *self.by_country.entry(country).or_insert(0) += 1;
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_processed(&self, event: &str, latency_ms: f64) {
        *self.messages_by_type.entry(event.to_owned()).or_insert(0) += 1;
        self.messages_this_minute.fetch_add(1, Ordering::Relaxed);
        self.latency
            .lock()
            .expect("latency lock poisoned")
            .record(latency_ms);
    }

    pub fn error_occurred(&self, kind: &str) {
        *self.errors_by_type.entry(kind.to_owned()).or_insert(0) += 1;
    }

    /// Bump a named domain counter (joins, leaves, evictions).
    pub fn count(&self, name: &str) {
        *self.counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    pub fn set_active_workspaces(&self, count: u64) {
        self.active_workspaces.store(count, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> u64 {
        self.messages_by_type.iter().map(|entry| *entry.value()).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_type.iter().map(|entry| *entry.value()).sum()
    }

    pub fn error_rate_pct(&self) -> f64 {
        let messages = self.total_messages();
        if messages == 0 {
            return 0.0;
        }
        (self.total_errors() as f64 / messages as f64) * 100.0
    }

    /// Refresh process/system gauges and remember the latest store
    /// probe. Driven by the 5 s loop.
    pub fn refresh_system(&self, store_health: StoreHealth) {
        let mut sampler = self.sampler.lock().expect("sampler lock poisoned");
        if let Some((system, pid)) = sampler.as_mut() {
            system.refresh_memory();
            system.refresh_processes(ProcessesToUpdate::Some(&[*pid]), true);

            let total_memory = system.total_memory().max(1);
            let mut gauges = self.system.lock().expect("system lock poisoned");
            if let Some(process) = system.process(*pid) {
                gauges.rss_bytes = process.memory();
                gauges.virtual_bytes = process.virtual_memory();
                gauges.cpu_pct = process.cpu_usage() as f64;
                gauges.memory_pct = (process.memory() as f64 / total_memory as f64) * 100.0;
            }
        }
        drop(sampler);

        *self.store_health.lock().expect("store health lock poisoned") = Some(store_health);
    }

    /// Roll the per-minute message counter and append a snapshot.
    pub fn take_minute_snapshot(&self) {
        let last_minute = self.messages_this_minute.swap(0, Ordering::Relaxed);
        self.message_rate_per_minute
            .store(last_minute, Ordering::Relaxed);

        let latency = self.latency.lock().expect("latency lock poisoned");
        let (mean, p95) = (latency.mean(), latency.p95());
        drop(latency);
        let gauges = *self.system.lock().expect("system lock poisoned");

        let snapshot = MinuteSnapshot {
            at: Utc::now(),
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_last_minute: last_minute,
            mean_latency_ms: mean,
            p95_latency_ms: p95,
            total_errors: self.total_errors(),
            rss_bytes: gauges.rss_bytes,
        };

        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .push(snapshot);
    }

    /// Evaluate alert thresholds; newly fired alerts are queued and
    /// returned for logging.
    pub fn check_alerts(&self) -> Vec<Alert> {
        let mut fired = Vec::new();
        let now = Utc::now();

        let latency = self.latency.lock().expect("latency lock poisoned");
        let mean = latency.mean();
        drop(latency);
        if mean > HIGH_LATENCY_MS {
            fired.push(Alert {
                kind: AlertKind::HighLatency,
                message: format!("mean message latency {mean:.1}ms exceeds {HIGH_LATENCY_MS}ms"),
                at: now,
            });
        }

        let error_rate = self.error_rate_pct();
        if error_rate > HIGH_ERROR_RATE_PCT {
            fired.push(Alert {
                kind: AlertKind::HighErrorRate,
                message: format!("error rate {error_rate:.1}% exceeds {HIGH_ERROR_RATE_PCT}%"),
                at: now,
            });
        }

        let memory_pct = self.system.lock().expect("system lock poisoned").memory_pct;
        if memory_pct > HIGH_MEMORY_PCT {
            fired.push(Alert {
                kind: AlertKind::HighMemory,
                message: format!("process memory {memory_pct:.1}% exceeds {HIGH_MEMORY_PCT}%"),
                at: now,
            });
        }

        let store_health = self
            .store_health
            .lock()
            .expect("store health lock poisoned")
            .clone();
        if let Some(health) = store_health {
            match health.status {
                HealthStatus::Degraded => fired.push(Alert {
                    kind: AlertKind::StoreDegraded,
                    message: format!(
                        "shared store degraded ({}ms round-trip)",
                        health.response_time_ms.unwrap_or_default()
                    ),
                    at: now,
                }),
                HealthStatus::Unhealthy => fired.push(Alert {
                    kind: AlertKind::StoreUnhealthy,
                    message: format!(
                        "shared store unhealthy: {}",
                        health.error.as_deref().unwrap_or("unknown")
                    ),
                    at: now,
                }),
                HealthStatus::Healthy => {}
            }
        }

        let mut alerts = self.alerts.lock().expect("alert lock poisoned");
        for alert in &fired {
            alerts.push(alert.clone());
        }
        fired
    }

    /// Hourly housekeeping: prune snapshots outside the retention
    /// window.
    pub fn cleanup(&self) -> usize {
        self.snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .prune(Utc::now())
    }

    /// Daily aggregate persisted to the shared store by the archive
    /// job.
    pub fn daily_rollup(&self) -> JsonValue {
        let latency = self.latency.lock().expect("latency lock poisoned");
        let (mean, p95) = (latency.mean(), latency.p95());
        drop(latency);
        let peak = *self.peak.lock().expect("peak lock poisoned");

        json!({
            "date": Utc::now().format("%Y-%m-%d").to_string(),
            "totalConnections": self.total_connections.load(Ordering::Relaxed),
            "totalMessages": self.total_messages(),
            "totalErrors": self.total_errors(),
            "meanLatencyMs": mean,
            "p95LatencyMs": p95,
            "peakConnections": {
                "count": peak.count,
                "at": peak.at,
            },
        })
    }

    pub fn summary(&self, detailed: bool) -> JsonValue {
        let latency = self.latency.lock().expect("latency lock poisoned");
        let (mean, p95) = (latency.mean(), latency.p95());
        drop(latency);
        let peak = *self.peak.lock().expect("peak lock poisoned");
        let gauges = *self.system.lock().expect("system lock poisoned");
        let store_health = self
            .store_health
            .lock()
            .expect("store health lock poisoned")
            .clone();

        let mut summary = json!({
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "connections": {
                "total": self.total_connections.load(Ordering::Relaxed),
                "active": self.active_connections(),
                "peak": {
                    "count": peak.count,
                    "at": peak.at,
                },
            },
            "messages": {
                "total": self.total_messages(),
                "perMinute": self.message_rate_per_minute.load(Ordering::Relaxed),
                "latency": {
                    "meanMs": mean,
                    "p95Ms": p95,
                },
            },
            "errors": {
                "total": self.total_errors(),
                "ratePct": self.error_rate_pct(),
            },
            "workspaces": {
                "active": self.active_workspaces.load(Ordering::Relaxed),
            },
            "system": {
                "rssBytes": gauges.rss_bytes,
                "virtualBytes": gauges.virtual_bytes,
                "cpuPct": gauges.cpu_pct,
                "memoryPct": gauges.memory_pct,
            },
            "store": store_health,
        });

        if detailed {
            let object = summary.as_object_mut().expect("summary is an object");
            object.insert(
                "messagesByType".to_owned(),
                json!(dashmap_to_json(&self.messages_by_type)),
            );
            object.insert(
                "errorsByType".to_owned(),
                json!(dashmap_to_json(&self.errors_by_type)),
            );
            object.insert(
                "connectionsByUserAgent".to_owned(),
                json!(dashmap_to_json(&self.by_user_agent)),
            );
            object.insert(
                "connectionsByCountry".to_owned(),
                json!(dashmap_to_json(&self.by_country)),
            );
            object.insert("counters".to_owned(), json!(dashmap_to_json(&self.counters)));
            object.insert(
                "alerts".to_owned(),
                json!(self.alerts.lock().expect("alert lock poisoned").all()),
            );
        }

        summary
    }

    pub fn performance_report(&self) -> JsonValue {
        let latency = self.latency.lock().expect("latency lock poisoned");
        let (mean, p95) = (latency.mean(), latency.p95());
        drop(latency);
        let peak = *self.peak.lock().expect("peak lock poisoned");
        let snapshots = self
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .latest(60);

        json!({
            "meanLatencyMs": mean,
            "p95LatencyMs": p95,
            "messageRatePerMinute": self.message_rate_per_minute.load(Ordering::Relaxed),
            "errorRatePct": self.error_rate_pct(),
            "peakConnections": {
                "count": peak.count,
                "at": peak.at,
            },
            "snapshots": snapshots,
        })
    }
}

fn dashmap_to_json(map: &DashMap<String, u64>) -> serde_json::Map<String, JsonValue> {
    map.iter()
        .map(|entry| (entry.key().clone(), json!(*entry.value())))
        .collect()
}

fn agent_family(user_agent: Option<&str>) -> &'static str {
    let Some(agent) = user_agent else {
        return "unknown";
    };

    if agent.contains("Edg/") {
        "edge"
    } else if agent.contains("Chrome") {
        "chrome"
    } else if agent.contains("Firefox") {
        "firefox"
    } else if agent.contains("Safari") {
        "safari"
    } else if agent.contains("curl") {
        "curl"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lifecycle_tracks_active_and_peak() {
        let metrics = MetricsRegistry::default();
        metrics.connection_opened(Some("Mozilla Chrome/120"), Some("de"));
        metrics.connection_opened(Some("curl/8.0"), None);
        metrics.connection_closed();

        assert_eq!(metrics.active_connections(), 1);
        let summary = metrics.summary(true);
        assert_eq!(summary["connections"]["total"], 2);
        assert_eq!(summary["connections"]["peak"]["count"], 2);
        assert_eq!(summary["connectionsByUserAgent"]["chrome"], 1);
        assert_eq!(summary["connectionsByCountry"]["DE"], 1);
        assert_eq!(summary["connectionsByCountry"]["UNKNOWN"], 1);
    }

    #[test]
    fn latency_percentiles_are_derived_from_the_reservoir() {
        let metrics = MetricsRegistry::default();
        for i in 1..=100 {
            metrics.message_processed("new_message", i as f64);
        }

        let summary = metrics.summary(false);
        let mean = summary["messages"]["latency"]["meanMs"].as_f64().unwrap();
        let p95 = summary["messages"]["latency"]["p95Ms"].as_f64().unwrap();
        assert!((mean - 50.5).abs() < 0.01);
        assert!((p95 - 95.0).abs() < 0.01);
    }

    #[test]
    fn error_rate_is_percent_of_messages() {
        let metrics = MetricsRegistry::default();
        for _ in 0..98 {
            metrics.message_processed("join_workspace", 1.0);
        }
        metrics.message_processed("new_message", 1.0);
        metrics.message_processed("new_message", 1.0);
        for _ in 0..10 {
            metrics.error_occurred("validation");
        }
        assert!((metrics.error_rate_pct() - 10.0).abs() < 0.001);
    }

    #[test]
    fn high_error_rate_fires_an_alert() {
        let metrics = MetricsRegistry::default();
        metrics.message_processed("new_message", 1.0);
        metrics.error_occurred("internal");

        let fired = metrics.check_alerts();
        assert!(
            fired
                .iter()
                .any(|alert| alert.kind == AlertKind::HighErrorRate)
        );
    }

    #[test]
    fn minute_snapshot_resets_the_per_minute_counter() {
        let metrics = MetricsRegistry::default();
        metrics.message_processed("cursor_update", 2.0);
        metrics.message_processed("cursor_update", 2.0);
        metrics.take_minute_snapshot();

        let report = metrics.performance_report();
        assert_eq!(report["messageRatePerMinute"], 2);
        assert_eq!(report["snapshots"].as_array().unwrap().len(), 1);

        metrics.take_minute_snapshot();
        let report = metrics.performance_report();
        assert_eq!(report["messageRatePerMinute"], 0);
    }

    #[test]
    fn unhealthy_store_probe_fires_alert() {
        let metrics = MetricsRegistry::default();
        metrics.refresh_system(StoreHealth::unhealthy("connection refused"));
        let fired = metrics.check_alerts();
        assert!(
            fired
                .iter()
                .any(|alert| alert.kind == AlertKind::StoreUnhealthy)
        );
    }

    #[test]
    fn agent_families_bucket_common_browsers() {
        assert_eq!(agent_family(Some("Mozilla/5.0 Chrome/120 Safari/537")), "chrome");
        assert_eq!(agent_family(Some("Mozilla/5.0 Firefox/121")), "firefox");
        assert_eq!(agent_family(Some("Mozilla/5.0 Version/17 Safari/605")), "safari");
        assert_eq!(agent_family(None), "unknown");
    }
}
