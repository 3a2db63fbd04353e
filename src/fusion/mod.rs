//! Fusion engine orchestrator (C6, §4.6).
//!
//! Consumes `events:raw`, runs each message through normalize → dedup →
//! aggregate, acks it, and on a separate ticker flushes expired
//! aggregation windows to `events:fused`. Generalizes the teacher's
//! `run_bot` sleep/retry main loop (`main.rs`) and the
//! `ingester::source::SourceAggregator::run` spawn-one-task-per-concern
//! shape to this crate's consume/flush/reclaim/heartbeat task split.

use crate::aggregate::Aggregator;
use crate::bus::Bus;
use crate::dedup::{self, DedupDecision};
use crate::error::Result;
use crate::heartbeat::Stats;
use crate::ingest::{self, RawPayload};
use crate::model::{keys, wire, FusedEvent, RawEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const CONSUME_COUNT: usize = 100;
const CONSUME_BLOCK_MS: u64 = 5_000;
const FLUSH_INTERVAL_MS: u64 = 500;
const RECLAIM_INTERVAL_SEC: u64 = 30;
const RECLAIM_MIN_IDLE_MS: i64 = 30_000;
const FUSED_STREAM_MAX_LEN: usize = 50_000;

fn payload_from_fields(fields: &HashMap<String, String>) -> RawPayload {
    let sidecars = fields
        .iter()
        .filter(|(k, _)| matches!(k.as_str(), "telegram" | "twitter" | "chain"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    RawPayload {
        source: fields.get("source").cloned(),
        source_type: fields.get("source_type").cloned(),
        exchange: fields.get("exchange").cloned(),
        symbol: fields.get("symbol").cloned(),
        event: fields.get("event").cloned(),
        raw_text: fields.get("raw_text").cloned(),
        url: fields.get("url").cloned(),
        detected_at: fields.get("detected_at").and_then(|v| v.parse().ok()),
        node_id: fields.get("node_id").cloned(),
        sidecars,
    }
}

pub struct FusionEngine {
    bus: Arc<dyn Bus>,
    aggregator: Arc<Aggregator>,
    dedup_ttl_sec: u64,
    consumer_name: String,
    stats: Arc<Stats>,
}

impl FusionEngine {
    pub fn new(bus: Arc<dyn Bus>, aggregator: Arc<Aggregator>, dedup_ttl_sec: u64, consumer_name: String, stats: Arc<Stats>) -> Self {
        Self {
            bus,
            aggregator,
            dedup_ttl_sec,
            consumer_name,
            stats,
        }
    }

    /// Normalize → dedup → aggregate a single raw message. Every error is
    /// contained here: the caller always acks and moves on (§4.6 failure
    /// semantics — a bad message must never halt the loop).
    async fn process_one(&self, fields: &HashMap<String, String>, bus_id: &str) {
        self.stats.processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let payload = payload_from_fields(fields);
        let event: RawEvent = match ingest::normalize(payload) {
            Ok(e) => e,
            Err(reason) => {
                tracing::debug!(%reason, bus_id, "rejecting raw event");
                self.stats.filtered.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        };

        let fp = event.fingerprint();
        let already_aggregated = self.aggregator.sources_for(&event);
        let decision = match dedup::check(self.bus.as_ref(), &fp, &event.source, &already_aggregated, self.dedup_ttl_sec).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "dedup check failed, passing event through");
                DedupDecision::Pass
            }
        };
        if decision == DedupDecision::Suppress {
            self.stats.duplicate.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        if let Err(e) = self.aggregator.add(&event, bus_id).await {
            tracing::warn!(error = %e, bus_id, "aggregator add failed");
            self.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    async fn consume_once(&self) -> Result<()> {
        let entries = self
            .bus
            .consume(
                keys::EVENTS_RAW,
                keys::FUSION_ENGINE_GROUP,
                &self.consumer_name,
                CONSUME_COUNT,
                CONSUME_BLOCK_MS,
            )
            .await?;

        for entry in entries {
            self.process_one(&entry.fields, &entry.id).await;
            if let Err(e) = self.bus.ack(keys::EVENTS_RAW, keys::FUSION_ENGINE_GROUP, &entry.id).await {
                tracing::warn!(error = %e, id = %entry.id, "ack failed");
            }
        }
        Ok(())
    }

    async fn flush_once(&self, now_ms: i64) {
        for fused in self.aggregator.flush_expired(now_ms) {
            self.publish_fused(fused).await;
        }
    }

    async fn publish_fused(&self, fused: FusedEvent) {
        self.stats.fused.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.stats.record_score(fused.score);
        if fused.is_super_event {
            self.stats.super_events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        let fields = wire::fused_event_fields(&fused);
        if let Err(e) = self
            .bus
            .publish(keys::EVENTS_FUSED, &fields, Some(FUSED_STREAM_MAX_LEN))
            .await
        {
            tracing::error!(error = %e, event_id = %fused.event_id, "failed to publish fused event");
            self.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    async fn reclaim_once(&self) {
        let claimed = self
            .bus
            .claim_idle(
                keys::EVENTS_RAW,
                keys::FUSION_ENGINE_GROUP,
                &self.consumer_name,
                RECLAIM_MIN_IDLE_MS,
                CONSUME_COUNT,
            )
            .await;
        let entries = match claimed {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "reclaim failed");
                return;
            }
        };
        for entry in entries {
            self.process_one(&entry.fields, &entry.id).await;
            if let Err(e) = self.bus.ack(keys::EVENTS_RAW, keys::FUSION_ENGINE_GROUP, &entry.id).await {
                tracing::warn!(error = %e, id = %entry.id, "ack failed on reclaimed entry");
            }
        }
    }

    /// Flush every remaining window regardless of expiry, for graceful
    /// shutdown (§5 Cancellation & shutdown).
    async fn flush_all(&self) {
        for fused in self.aggregator.flush_all() {
            self.publish_fused(fused).await;
        }
    }

    /// Runs the consume loop, the 500 ms flush ticker, and the 30 s
    /// reclaim ticker concurrently until `shutdown` fires, then flushes
    /// every remaining window before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let consume_handle = {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        result = engine.consume_once() => {
                            if let Err(e) = result {
                                tracing::error!(error = %e, "bus consume failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            })
        };

        let flush_handle = {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let now_ms = chrono::Utc::now().timestamp_millis();
                            engine.flush_once(now_ms).await;
                        }
                    }
                }
            })
        };

        let reclaim_handle = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(RECLAIM_INTERVAL_SEC));
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => engine.reclaim_once().await,
                    }
                }
            })
        };

        let _ = tokio::join!(consume_handle, flush_handle, reclaim_handle);
        self.flush_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::scoring::ScoringConfig;

    fn raw_fields(source: &str, exchange: &str, symbol: &str, detected_at: i64) -> Vec<(&'static str, String)> {
        vec![
            ("source", source.to_string()),
            ("source_type", "websocket".to_string()),
            ("exchange", exchange.to_string()),
            ("symbol", symbol.to_string()),
            ("event", "listing".to_string()),
            ("raw_text", format!("{symbol} listing")),
            ("detected_at", detected_at.to_string()),
            ("node_id", "collector-1".to_string()),
        ]
    }

    #[tokio::test]
    async fn single_message_is_normalized_deduped_and_aggregated() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let aggregator = Arc::new(Aggregator::new(bus.clone(), scoring, 5_000, 10_000, 3_600));
        let stats = Arc::new(Stats::default());
        let engine = FusionEngine::new(bus.clone(), aggregator.clone(), 300, "consumer-1".to_string(), stats.clone());

        let now = chrono::Utc::now().timestamp_millis();
        bus.publish(keys::EVENTS_RAW, &raw_fields("ws_binance", "binance", "ABCUSDT", now), None)
            .await
            .unwrap();

        engine.consume_once().await.unwrap();

        assert_eq!(aggregator.open_window_count(), 1);
        assert_eq!(stats.processed.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(bus.pending_count(keys::EVENTS_RAW), 0);
    }

    #[tokio::test]
    async fn flush_publishes_super_events_to_fused_stream() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let aggregator = Arc::new(Aggregator::new(bus.clone(), scoring, 5_000, 10_000, 3_600));
        let stats = Arc::new(Stats::default());
        let engine = FusionEngine::new(bus.clone(), aggregator.clone(), 300, "consumer-1".to_string(), stats.clone());

        let t0 = chrono::Utc::now().timestamp_millis();
        bus.publish(keys::EVENTS_RAW, &raw_fields("ws_binance", "binance", "ABCUSDT", t0), None)
            .await
            .unwrap();
        engine.consume_once().await.unwrap();
        bus.publish(keys::EVENTS_RAW, &raw_fields("tg_alpha_intel", "binance", "ABCUSDT", t0 + 2_000), None)
            .await
            .unwrap();
        engine.consume_once().await.unwrap();

        engine.flush_once(t0 + 2_000 + 5_000).await;

        assert_eq!(bus.stream_len(keys::EVENTS_FUSED), 1);
        assert_eq!(stats.fused.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(stats.super_events.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_without_failing_loop() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let aggregator = Arc::new(Aggregator::new(bus.clone(), scoring, 5_000, 10_000, 3_600));
        let stats = Arc::new(Stats::default());
        let engine = FusionEngine::new(bus.clone(), aggregator.clone(), 300, "consumer-1".to_string(), stats.clone());

        bus.publish(keys::EVENTS_RAW, &[("source", "ws_binance".to_string())], None)
            .await
            .unwrap();

        engine.consume_once().await.unwrap();

        assert_eq!(aggregator.open_window_count(), 0);
        assert_eq!(stats.filtered.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(bus.pending_count(keys::EVENTS_RAW), 0);
    }
}
