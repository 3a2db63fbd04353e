//! Heartbeat & health reporter (C8, §4.8).
//!
//! Every pipeline process owns one [`Reporter`] and spawns its ticker
//! alongside the main consume/process loop, mirroring the heartbeat task
//! the teacher's `EventEngine::start` spawns next to its event bus.

use crate::bus::Bus;
use crate::error::Result;
use crate::model::{keys, HeartbeatStatus};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const HEARTBEAT_INTERVAL_SEC: u64 = 30;
pub const HEARTBEAT_TTL_SEC: u64 = 120;

/// Lock-free counters a component bumps as it processes messages;
/// snapshotted into the heartbeat's `stats` JSON blob (§6.5).
#[derive(Debug, Default)]
pub struct Stats {
    pub processed: AtomicU64,
    pub fused: AtomicU64,
    pub filtered: AtomicU64,
    pub duplicate: AtomicU64,
    pub super_events: AtomicU64,
    pub errors: AtomicU64,
    score_sum_millis: AtomicI64,
    score_count: AtomicU64,
}

impl Stats {
    pub fn record_score(&self, score: f64) {
        self.score_sum_millis
            .fetch_add((score * 1000.0) as i64, Ordering::Relaxed);
        self.score_count.fetch_add(1, Ordering::Relaxed);
    }

    fn avg_score(&self) -> f64 {
        let count = self.score_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        (self.score_sum_millis.load(Ordering::Relaxed) as f64 / 1000.0) / count as f64
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "processed": self.processed.load(Ordering::Relaxed),
            "fused": self.fused.load(Ordering::Relaxed),
            "filtered": self.filtered.load(Ordering::Relaxed),
            "duplicate": self.duplicate.load(Ordering::Relaxed),
            "super_events": self.super_events.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "avg_score": self.avg_score(),
        })
    }
}

/// Three-way liveness classification a heartbeat consumer derives from
/// `timestamp` against the 120 s TTL (§4.8). Not used internally by the
/// writer side; exposed for downstream health dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Offline,
}

pub fn classify_freshness(now_ms: i64, heartbeat_timestamp_ms: i64) -> Freshness {
    let age_sec = (now_ms - heartbeat_timestamp_ms) / 1000;
    if age_sec < 90 {
        Freshness::Fresh
    } else if age_sec < 120 {
        Freshness::Stale
    } else {
        Freshness::Offline
    }
}

/// Writes `node:heartbeat:<id>` (§4.1) on a 30 s cadence.
pub struct Reporter {
    bus: Arc<dyn Bus>,
    node_id: String,
    version: String,
    started_at: Instant,
    stats: Arc<Stats>,
}

impl Reporter {
    pub fn new(bus: Arc<dyn Bus>, node_id: String, version: String, stats: Arc<Stats>) -> Self {
        Self {
            bus,
            node_id,
            version,
            started_at: Instant::now(),
            stats,
        }
    }

    fn status_str(status: HeartbeatStatus) -> &'static str {
        match status {
            HeartbeatStatus::Running => "running",
            HeartbeatStatus::Stopped => "stopped",
            HeartbeatStatus::Error => "error",
            HeartbeatStatus::Paused => "paused",
        }
    }

    pub async fn publish(&self, status: HeartbeatStatus) -> Result<()> {
        let uptime_seconds = self.started_at.elapsed().as_secs() as i64;
        let fields = [
            ("status", Self::status_str(status).to_string()),
            ("node_id", self.node_id.clone()),
            ("version", self.version.clone()),
            ("uptime_seconds", uptime_seconds.to_string()),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
            ("stats", self.stats.snapshot().to_string()),
        ];
        self.bus
            .set_hash(&keys::heartbeat(&self.node_id), &fields, HEARTBEAT_TTL_SEC)
            .await
    }

    /// Spawns the heartbeat writer task (§5 task list item 4). The
    /// caller's shutdown path should publish one final `Stopped` heartbeat
    /// after aborting this handle (§5 Cancellation & shutdown).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                if let Err(e) = self.publish(HeartbeatStatus::Running).await {
                    tracing::warn!(error = %e, "heartbeat publish failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    #[tokio::test]
    async fn publish_writes_heartbeat_hash() {
        let bus = Arc::new(MockBus::new());
        let stats = Arc::new(Stats::default());
        stats.processed.store(10, Ordering::Relaxed);
        stats.fused.store(3, Ordering::Relaxed);
        let reporter = Reporter::new(bus.clone(), "node-1".to_string(), "0.1.0".to_string(), stats);

        reporter.publish(HeartbeatStatus::Running).await.unwrap();

        let raw = bus.get(&keys::heartbeat("node-1")).await.unwrap();
        assert!(raw.is_some());
        let decoded: std::collections::HashMap<String, String> =
            serde_json::from_str(&raw.unwrap()).unwrap();
        assert_eq!(decoded.get("status").map(String::as_str), Some("running"));
        assert_eq!(decoded.get("node_id").map(String::as_str), Some("node-1"));
    }

    #[test]
    fn freshness_thresholds_match_spec() {
        let now = 1_000_000_000_i64;
        assert_eq!(classify_freshness(now, now - 10_000), Freshness::Fresh);
        assert_eq!(classify_freshness(now, now - 100_000), Freshness::Stale);
        assert_eq!(classify_freshness(now, now - 130_000), Freshness::Offline);
    }

    #[test]
    fn avg_score_tracks_recorded_scores() {
        let stats = Stats::default();
        stats.record_score(30.0);
        stats.record_score(50.0);
        let snap = stats.snapshot();
        assert!((snap["avg_score"].as_f64().unwrap() - 40.0).abs() < 1e-6);
    }
}
