//! Signal router (C7, §4.7).
//!
//! Classifies fused events into `cex` / `hl` / `notify` / `drop` routes
//! with per-symbol cooldown, generalizing the teacher's `strategy`
//! module's signal-to-decision classification shape to this spec's
//! routing priority tree.

use crate::bus::Bus;
use crate::error::Result;
use crate::heartbeat::Stats;
use crate::model::{
    keys, wire, CexRoute, FusedEvent, HlRoute, NotifyPayload, OrderType, RoutedEvent, Urgency,
};
use crate::notify::WebhookNotifier;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const CONSUME_COUNT: usize = 100;
const CONSUME_BLOCK_MS: u64 = 5_000;
const RECLAIM_INTERVAL_SEC: u64 = 30;
const RECLAIM_MIN_IDLE_MS: i64 = 30_000;

/// Routing configuration resolved at startup (§6.6 `router.*`).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub cex_priority: Vec<String>,
    pub blacklist: std::collections::BTreeSet<String>,
    pub hl_market_map: HashMap<String, String>,
    pub cooldown_ttl_sec: u64,
    pub cex_route_min: f64,
    pub hl_route_min: f64,
    pub notify_min: f64,
    /// Position-sizing base in USD; scaled by the fused event's
    /// confidence. The spec names `max_position_usd`/`size_usd` as wire
    /// fields without specifying their formula; this is the router's own
    /// sizing heuristic (see DESIGN.md).
    pub position_size_base_usd: Decimal,
    pub hl_leverage: i32,
    pub hl_tp_percent: f64,
    pub hl_sl_percent: f64,
    pub hl_timeout_seconds: i64,
}

impl RouterConfig {
    /// Resolves router settings from the top-level [`crate::config::Config`],
    /// pulling routing thresholds from the scoring table and the cooldown
    /// TTL from the dedup settings (§6.6).
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        let scoring = cfg.scoring_config();
        Self::from_parts(
            cfg.router.cex_priority.clone(),
            cfg.router.blacklist.clone(),
            cfg.router.hl_market_map.clone(),
            cfg.dedup.cooldown_ttl_sec,
            scoring.cex_route_min,
            scoring.hl_route_min,
            scoring.notify_min,
        )
    }

    pub fn from_parts(
        cex_priority: Vec<String>,
        blacklist: Vec<String>,
        hl_market_map: HashMap<String, String>,
        cooldown_ttl_sec: u64,
        cex_route_min: f64,
        hl_route_min: f64,
        notify_min: f64,
    ) -> Self {
        Self {
            cex_priority,
            blacklist: blacklist.into_iter().map(|s| s.to_ascii_uppercase()).collect(),
            hl_market_map,
            cooldown_ttl_sec,
            cex_route_min,
            hl_route_min,
            notify_min,
            position_size_base_usd: Decimal::new(500, 0),
            hl_leverage: 1,
            hl_tp_percent: 5.0,
            hl_sl_percent: 3.0,
            hl_timeout_seconds: 300,
        }
    }
}

pub struct Router {
    bus: Arc<dyn Bus>,
    cfg: RouterConfig,
    node_id: String,
}

impl Router {
    pub fn new(bus: Arc<dyn Bus>, cfg: RouterConfig, node_id: String) -> Self {
        Self { bus, cfg, node_id }
    }

    /// First venue in `cex_priority` whose `known_pairs:<exchange>` set
    /// already contains the symbol (collector-maintained memory, §4.1).
    async fn first_known_venue(&self, symbol: &str) -> Result<Option<String>> {
        for exchange in &self.cfg.cex_priority {
            if self
                .bus
                .set_contains(&keys::known_pairs(exchange), symbol)
                .await?
            {
                return Ok(Some(exchange.clone()));
            }
        }
        Ok(None)
    }

    fn build_cex_route(&self, fused: &FusedEvent, exchange: String, routing_priority: i32, now_ms: i64) -> RoutedEvent {
        let urgency = Urgency::from_score(fused.score);
        let confidence = Decimal::try_from(fused.confidence).unwrap_or_default();
        RoutedEvent::Cex(CexRoute {
            event_id: fused.event_id.clone(),
            symbol: fused.symbol.clone(),
            exchange: exchange.clone(),
            action: "buy",
            score: fused.score,
            confidence: fused.confidence,
            urgency,
            suggested_pairs: vec![format!("{}/USDT", fused.symbol)],
            routing_reason: format!(
                "score {:.2} >= cex_route_min, known on {}, sources={}",
                fused.score, exchange, fused.source_count
            ),
            routing_priority,
            max_position_usd: self.cfg.position_size_base_usd * confidence,
            risk_params: serde_json::json!({ "is_super_event": fused.is_super_event }),
            source_summary: serde_json::json!({
                "sources": fused.sources,
                "source_count": fused.source_count,
            }),
            created_at: now_ms,
            routed_by: self.node_id.clone(),
        })
    }

    fn build_hl_route(&self, fused: &FusedEvent, hl_market: String, now_ms: i64) -> RoutedEvent {
        let urgency = Urgency::from_score(fused.score);
        let confidence = Decimal::try_from(fused.confidence).unwrap_or_default();
        RoutedEvent::Hl(HlRoute {
            event_id: fused.event_id.clone(),
            symbol: fused.symbol.clone(),
            hl_market,
            action: "buy",
            order_type: OrderType::Market,
            size_usd: self.cfg.position_size_base_usd * confidence,
            leverage: self.cfg.hl_leverage,
            tp_percent: self.cfg.hl_tp_percent,
            sl_percent: self.cfg.hl_sl_percent,
            timeout_seconds: self.cfg.hl_timeout_seconds,
            score: fused.score,
            confidence: fused.confidence,
            urgency,
            routing_reason: format!("score {:.2} >= hl_route_min, hl market configured", fused.score),
            wallet_config: serde_json::json!({}),
            order_config: serde_json::json!({}),
            created_at: now_ms,
            routed_by: self.node_id.clone(),
        })
    }

    fn build_notify_route(&self, fused: &FusedEvent, now_ms: i64) -> RoutedEvent {
        RoutedEvent::Notify(NotifyPayload {
            event_id: fused.event_id.clone(),
            symbol: fused.symbol.clone(),
            exchange: fused.exchange.clone(),
            event_type: fused.event_type,
            raw_text: fused.raw_text.clone(),
            score: fused.score,
            confidence: fused.confidence,
            source_count: fused.source_count,
            is_super_event: fused.is_super_event,
            sources: fused.sources.clone(),
            urls: fused.urls.clone(),
            timestamp: now_ms,
            metadata: serde_json::json!({ "timeliness_category": fused.timeliness_category }),
        })
    }

    /// §4.7 routing decision tree. Returns the ordered set of routed
    /// events for `fused`; at least one of `{cex, hl, notify}` or exactly
    /// one `drop` is always produced.
    pub async fn route(&self, fused: &FusedEvent, now_ms: i64) -> Result<Vec<RoutedEvent>> {
        let blacklisted = self.cfg.blacklist.contains(&fused.symbol);
        let cooldown_key = keys::cooldown(&fused.symbol);
        let cooldown_active = self.bus.get(&cooldown_key).await?.is_some();

        let cex_venue = if blacklisted || cooldown_active {
            None
        } else {
            self.first_known_venue(&fused.symbol).await?
        };
        let cex_eligible = fused.score >= self.cfg.cex_route_min && cex_venue.is_some();
        let cex_priority = cex_venue
            .as_ref()
            .and_then(|v| self.cfg.cex_priority.iter().position(|p| p == v))
            .map(|idx| idx as i32 + 1)
            .unwrap_or(0);

        let hl_market = self.cfg.hl_market_map.get(&fused.symbol).cloned();
        let hl_eligible = fused.score >= self.cfg.hl_route_min && hl_market.is_some() && !cooldown_active;

        let mut routes = Vec::new();
        let mut routed_cex = false;
        let mut routed_hl = false;

        if cex_eligible {
            routes.push(self.build_cex_route(fused, cex_venue.clone().unwrap(), cex_priority, now_ms));
            routed_cex = true;
        } else if hl_eligible {
            routes.push(self.build_hl_route(fused, hl_market.clone().unwrap(), now_ms));
            routed_hl = true;
        }

        if fused.score >= self.cfg.notify_min {
            routes.push(self.build_notify_route(fused, now_ms));
        }

        // Super events route to both cex and hl in parallel when both are
        // independently eligible (§4.4.3, §4.7, P8).
        if fused.is_super_event {
            if cex_eligible && !routed_cex {
                routes.push(self.build_cex_route(fused, cex_venue.clone().unwrap(), cex_priority, now_ms));
                routed_cex = true;
            }
            if hl_eligible && !routed_hl {
                routes.push(self.build_hl_route(fused, hl_market.clone().unwrap(), now_ms));
                routed_hl = true;
            }
        }

        if routed_cex || routed_hl {
            self.bus
                .set(&cooldown_key, "1", self.cfg.cooldown_ttl_sec)
                .await?;
        }

        if routes.is_empty() {
            let reason = if blacklisted {
                "blacklisted"
            } else if cooldown_active {
                "cooldown_active"
            } else {
                "below_thresholds"
            };
            routes.push(RoutedEvent::Drop {
                event_id: fused.event_id.clone(),
                reason: reason.to_string(),
            });
        }

        Ok(routes)
    }

    /// Publishes each routed event to its target stream (§4.1).
    pub async fn publish(&self, routed: &RoutedEvent) -> Result<()> {
        let (stream, payload) = match routed {
            RoutedEvent::Cex(r) => (keys::EVENTS_ROUTE_CEX, serde_json::to_string(r)?),
            RoutedEvent::Hl(r) => (keys::EVENTS_ROUTE_HL, serde_json::to_string(r)?),
            RoutedEvent::Dex(r) => (keys::EVENTS_ROUTE_DEX, serde_json::to_string(r)?),
            RoutedEvent::Notify(_) | RoutedEvent::Drop { .. } => return Ok(()),
        };
        self.bus
            .publish(stream, &[("payload", payload)], Some(1_000))
            .await?;
        Ok(())
    }
}

/// Long-running process wrapper: consumes `events:fused`, routes each
/// event, publishes the resulting routes, delivers `notify` payloads via
/// the webhook notifier, and acks — mirroring the fusion engine's
/// consume/reclaim task split (§5).
pub struct RouterRuntime {
    bus: Arc<dyn Bus>,
    router: Arc<Router>,
    notifier: Arc<WebhookNotifier>,
    consumer_name: String,
    stats: Arc<Stats>,
}

impl RouterRuntime {
    pub fn new(bus: Arc<dyn Bus>, router: Arc<Router>, notifier: Arc<WebhookNotifier>, consumer_name: String, stats: Arc<Stats>) -> Self {
        Self {
            bus,
            router,
            notifier,
            consumer_name,
            stats,
        }
    }

    async fn process_one(&self, fields: &HashMap<String, String>) {
        self.stats.processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let Some(fused) = wire::parse_fused_event(fields) else {
            tracing::warn!("dropping unparseable fused event");
            self.stats.filtered.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let routes = match self.router.route(&fused, now_ms).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, event_id = %fused.event_id, "routing failed");
                self.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        };

        for routed in &routes {
            match routed {
                RoutedEvent::Notify(payload) => {
                    if let Err(e) = self.notifier.send(payload).await {
                        tracing::warn!(error = %e, event_id = %fused.event_id, "notify delivery failed");
                    }
                }
                RoutedEvent::Drop { reason, .. } => {
                    tracing::debug!(event_id = %fused.event_id, reason, "event dropped");
                }
                _ => {
                    if let Err(e) = self.router.publish(routed).await {
                        tracing::error!(error = %e, event_id = %fused.event_id, "failed to publish route");
                        self.stats.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn consume_once(&self) -> Result<()> {
        let entries = self
            .bus
            .consume(
                keys::EVENTS_FUSED,
                keys::ROUTER_GROUP,
                &self.consumer_name,
                CONSUME_COUNT,
                CONSUME_BLOCK_MS,
            )
            .await?;

        for entry in entries {
            self.process_one(&entry.fields).await;
            if let Err(e) = self.bus.ack(keys::EVENTS_FUSED, keys::ROUTER_GROUP, &entry.id).await {
                tracing::warn!(error = %e, id = %entry.id, "ack failed");
            }
        }
        Ok(())
    }

    async fn reclaim_once(&self) {
        let claimed = self
            .bus
            .claim_idle(
                keys::EVENTS_FUSED,
                keys::ROUTER_GROUP,
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
            self.process_one(&entry.fields).await;
            if let Err(e) = self.bus.ack(keys::EVENTS_FUSED, keys::ROUTER_GROUP, &entry.id).await {
                tracing::warn!(error = %e, id = %entry.id, "ack failed on reclaimed entry");
            }
        }
    }

    /// Runs the consume loop and the 30 s reclaim ticker until `shutdown`
    /// fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let consume_handle = {
            let runtime = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        result = runtime.consume_once() => {
                            if let Err(e) = result {
                                tracing::error!(error = %e, "bus consume failed, backing off");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            })
        };

        let reclaim_handle = {
            let runtime = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(RECLAIM_INTERVAL_SEC));
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => runtime.reclaim_once().await,
                    }
                }
            })
        };

        let _ = tokio::join!(consume_handle, reclaim_handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::model::{EventType, ScoreBreakdown, TimelinessCategory};
    use std::collections::BTreeSet;

    fn fused(symbol: &str, score: f64, is_super: bool) -> FusedEvent {
        let mut sources = BTreeSet::new();
        sources.insert("ws_binance".to_string());
        FusedEvent {
            event_id: format!("fused_1_{symbol}"),
            symbol: symbol.to_string(),
            symbols: BTreeSet::new(),
            exchange: Some("binance".to_string()),
            exchanges: BTreeSet::new(),
            event_type: EventType::Listing,
            sources,
            source_count: 1,
            source_events: vec!["1-0".to_string()],
            first_seen_at: 1_000,
            last_seen_at: 1_000,
            aggregation_window_ms: 5_000,
            score,
            score_breakdown: ScoreBreakdown::default(),
            confidence: (score / 80.0).min(1.0),
            is_super_event: is_super,
            is_first_seen: true,
            timeliness_category: TimelinessCategory::FirstSeen,
            raw_text: format!("{symbol} listing"),
            urls: Vec::new(),
            created_at: 6_000,
        }
    }

    fn cfg() -> RouterConfig {
        RouterConfig::from_parts(
            vec!["gate".to_string(), "mexc".to_string(), "bitget".to_string()],
            vec!["USDT".to_string(), "USDC".to_string(), "BTC".to_string()],
            HashMap::from([("ABC".to_string(), "ABC-PERP".to_string())]),
            30,
            50.0,
            40.0,
            28.0,
        )
    }

    #[tokio::test]
    async fn blacklisted_symbol_always_drops() {
        let bus = Arc::new(MockBus::new());
        let router = Router::new(bus, cfg(), "router-1".to_string());
        let routes = router.route(&fused("USDT", 80.0, false), 6_000).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert!(matches!(routes[0], RoutedEvent::Drop { .. }));
    }

    #[tokio::test]
    async fn non_super_event_routes_to_at_most_one_of_cex_hl() {
        let bus = Arc::new(MockBus::new());
        bus.seed_set("known_pairs:gate", "ABC");
        let router = Router::new(bus, cfg(), "router-1".to_string());

        let routes = router.route(&fused("ABC", 60.0, false), 6_000).await.unwrap();
        let cex_count = routes.iter().filter(|r| matches!(r, RoutedEvent::Cex(_))).count();
        let hl_count = routes.iter().filter(|r| matches!(r, RoutedEvent::Hl(_))).count();
        assert_eq!(cex_count, 1);
        assert_eq!(hl_count, 0);
        assert!(routes.iter().any(|r| matches!(r, RoutedEvent::Notify(_))));
    }

    #[tokio::test]
    async fn super_event_routes_to_both_cex_and_hl() {
        let bus = Arc::new(MockBus::new());
        bus.seed_set("known_pairs:gate", "ABC");
        let router = Router::new(bus, cfg(), "router-1".to_string());

        let routes = router.route(&fused("ABC", 75.0, true), 6_000).await.unwrap();
        assert!(routes.iter().any(|r| matches!(r, RoutedEvent::Cex(_))));
        assert!(routes.iter().any(|r| matches!(r, RoutedEvent::Hl(_))));
        assert!(routes.iter().any(|r| matches!(r, RoutedEvent::Notify(_))));
    }

    #[tokio::test]
    async fn cooldown_demotes_second_route_to_notify_only() {
        let bus = Arc::new(MockBus::new());
        bus.seed_set("known_pairs:gate", "ABC");
        let router = Router::new(bus, cfg(), "router-1".to_string());

        let first = router.route(&fused("ABC", 60.0, false), 6_000).await.unwrap();
        assert!(first.iter().any(|r| matches!(r, RoutedEvent::Cex(_))));

        let second = router.route(&fused("ABC", 60.0, false), 16_000).await.unwrap();
        assert!(!second.iter().any(|r| matches!(r, RoutedEvent::Cex(_))));
        assert!(!second.iter().any(|r| matches!(r, RoutedEvent::Hl(_))));
        assert!(second.iter().any(|r| matches!(r, RoutedEvent::Notify(_))));
    }

    #[tokio::test]
    async fn below_all_thresholds_drops() {
        let bus = Arc::new(MockBus::new());
        let router = Router::new(bus, cfg(), "router-1".to_string());
        let routes = router.route(&fused("XYZ", 10.0, false), 6_000).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert!(matches!(routes[0], RoutedEvent::Drop { .. }));
    }
}
