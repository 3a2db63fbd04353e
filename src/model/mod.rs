//! Canonical event model and bus wire contract (C1).
//!
//! Types here are the shared vocabulary between the ingestion normalizer,
//! scoring engine, aggregator, and router. Nothing in this module talks to
//! the bus directly; see `crate::bus` for that.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Stream and key names that are part of the wire contract. Changing any
/// of these is a breaking change for every collector and consumer.
pub mod keys {
    pub const EVENTS_RAW: &str = "events:raw";
    pub const EVENTS_FUSED: &str = "events:fused";
    pub const EVENTS_ROUTE_CEX: &str = "events:route:cex";
    pub const EVENTS_ROUTE_HL: &str = "events:route:hl";
    pub const EVENTS_ROUTE_DEX: &str = "events:route:dex";

    pub fn known_pairs(exchange: &str) -> String {
        format!("known_pairs:{exchange}")
    }

    pub fn dedup(fingerprint: &str) -> String {
        format!("dedup:{fingerprint}")
    }

    pub fn first_seen(fingerprint: &str) -> String {
        format!("first_seen:{fingerprint}")
    }

    pub fn cooldown(symbol: &str) -> String {
        format!("cooldown:{symbol}")
    }

    pub fn heartbeat(node_id: &str) -> String {
        format!("node:heartbeat:{node_id}")
    }

    pub const FUSION_ENGINE_GROUP: &str = "fusion_engine_group";
    pub const ROUTER_GROUP: &str = "router_group";
    pub const WEBHOOK_PUSHER_GROUP: &str = "webhook_pusher_group";
}

/// Raw-event transport classification, independent of its scoring tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Websocket,
    Market,
    Social,
    Chain,
    News,
}

/// One of the five independent groups the multi-source bonus counts over.
/// Every raw `source` identifier belongs to exactly one group (see
/// `crate::scoring::default_source_table`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceGroup {
    ExchangeOfficial,
    AlphaIntel,
    Social,
    Chain,
    News,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Listing,
    Delisting,
    TradingOpen,
    DepositOpen,
    WithdrawOpen,
    FuturesLaunch,
    Airdrop,
    PairCreated,
    LiquidityAdd,
    Announcement,
    PriceAlert,
    OiAlert,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Listing => "listing",
            EventType::Delisting => "delisting",
            EventType::TradingOpen => "trading_open",
            EventType::DepositOpen => "deposit_open",
            EventType::WithdrawOpen => "withdraw_open",
            EventType::FuturesLaunch => "futures_launch",
            EventType::Airdrop => "airdrop",
            EventType::PairCreated => "pair_created",
            EventType::LiquidityAdd => "liquidity_add",
            EventType::Announcement => "announcement",
            EventType::PriceAlert => "price_alert",
            EventType::OiAlert => "oi_alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelinessCategory {
    FirstSeen,
    Within5s,
    Within30s,
    Within1min,
    Within5min,
    Older,
}

/// An observation produced by a collector. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: String,
    pub source_type: SourceType,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    /// `normalize(symbol)`, computed at normalization time (§3.2).
    pub canonical_symbol: Option<String>,
    pub event: EventType,
    pub raw_text: String,
    pub url: Option<String>,
    pub detected_at: i64,
    pub node_id: String,
    /// Opaque source-specific sidecars (`telegram`, `twitter`, `chain`, ...),
    /// copied through without interpretation.
    #[serde(default)]
    pub sidecars: serde_json::Map<String, serde_json::Value>,
}

impl RawEvent {
    pub fn fingerprint(&self) -> String {
        fingerprint(
            self.exchange.as_deref().unwrap_or(""),
            self.canonical_symbol
                .as_deref()
                .or(self.symbol.as_deref())
                .unwrap_or(""),
            self.event.as_str(),
        )
    }
}

/// Reasons a raw payload can be rejected by the normalizer (§4.2).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RejectReason {
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),
    #[error("stale or skewed: detected_at={detected_at_ms} now={now_ms}")]
    StaleOrSkewed { detected_at_ms: i64, now_ms: i64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub source: f64,
    pub multi_source: f64,
    pub timeliness: f64,
    pub exchange: f64,
}

impl ScoreBreakdown {
    /// §4.3.6 — the sole place the final weighted formula is computed.
    pub fn final_score(&self) -> f64 {
        0.25 * self.source + 0.40 * self.multi_source + 0.15 * self.timeliness + 0.20 * self.exchange
    }

    pub fn confidence(&self) -> f64 {
        (self.final_score() / 80.0).min(1.0)
    }
}

/// The deduplicated, scored, aggregated output of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedEvent {
    pub event_id: String,
    pub symbol: String,
    pub symbols: BTreeSet<String>,
    pub exchange: Option<String>,
    pub exchanges: BTreeSet<String>,
    pub event_type: EventType,
    pub sources: BTreeSet<String>,
    pub source_count: usize,
    pub source_events: Vec<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub aggregation_window_ms: i64,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub confidence: f64,
    pub is_super_event: bool,
    pub is_first_seen: bool,
    pub timeliness_category: TimelinessCategory,
    pub raw_text: String,
    pub urls: Vec<String>,
    pub created_at: i64,
}

impl FusedEvent {
    /// Format: `fused_<detected_at_ms>_<16-hex>` (§3.1).
    pub fn make_event_id(detected_at_ms: i64, fingerprint: &str) -> String {
        format!("fused_{detected_at_ms}_{fingerprint}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            Urgency::Critical
        } else if score >= 55.0 {
            Urgency::High
        } else if score >= 40.0 {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// One classified output per target stream. A single `FusedEvent` may
/// yield zero, one, or several `RoutedEvent`s (parallel routing for
/// super events, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum RoutedEvent {
    Cex(CexRoute),
    Hl(HlRoute),
    Dex(DexRoute),
    Notify(NotifyPayload),
    Drop { event_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CexRoute {
    pub event_id: String,
    pub symbol: String,
    pub exchange: String,
    pub action: &'static str,
    pub score: f64,
    pub confidence: f64,
    pub urgency: Urgency,
    pub suggested_pairs: Vec<String>,
    pub routing_reason: String,
    pub routing_priority: i32,
    pub max_position_usd: rust_decimal::Decimal,
    pub risk_params: serde_json::Value,
    pub source_summary: serde_json::Value,
    pub created_at: i64,
    pub routed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlRoute {
    pub event_id: String,
    pub symbol: String,
    pub hl_market: String,
    pub action: &'static str,
    pub order_type: OrderType,
    pub size_usd: rust_decimal::Decimal,
    pub leverage: i32,
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub timeout_seconds: i64,
    pub score: f64,
    pub confidence: f64,
    pub urgency: Urgency,
    pub routing_reason: String,
    pub wallet_config: serde_json::Value,
    pub order_config: serde_json::Value,
    pub created_at: i64,
    pub routed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexRoute {
    pub event_id: String,
    pub symbol: String,
    pub route_info: serde_json::Value,
    pub score: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub event_id: String,
    pub symbol: String,
    pub exchange: Option<String>,
    pub event_type: EventType,
    pub raw_text: String,
    pub score: f64,
    pub confidence: f64,
    pub source_count: usize,
    pub is_super_event: bool,
    pub sources: BTreeSet<String>,
    pub urls: Vec<String>,
    pub timestamp: i64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Running,
    Stopped,
    Error,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: HeartbeatStatus,
    pub node_id: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub timestamp: i64,
    pub stats: serde_json::Value,
}

/// §6.3 wire encoding/decoding of a [`FusedEvent`] for the `events:fused`
/// stream, shared by the fusion engine (encoder) and the router
/// (decoder) so the two sides of the wire contract can't drift apart.
pub mod wire {
    use super::*;
    use std::collections::HashMap;

    pub fn fused_event_fields(event: &FusedEvent) -> Vec<(&'static str, String)> {
        vec![
            ("event_id", event.event_id.clone()),
            ("symbol", event.symbol.clone()),
            ("exchange", event.exchange.clone().unwrap_or_default()),
            ("event_type", event.event_type.as_str().to_string()),
            ("score", event.score.to_string()),
            ("confidence", event.confidence.to_string()),
            ("is_super_event", if event.is_super_event { "1" } else { "0" }.to_string()),
            ("is_first_seen", if event.is_first_seen { "1" } else { "0" }.to_string()),
            ("source_count", event.source_count.to_string()),
            ("sources", serde_json::to_string(&event.sources).unwrap_or_default()),
            ("first_seen_at", event.first_seen_at.to_string()),
            ("last_seen_at", event.last_seen_at.to_string()),
            ("created_at", event.created_at.to_string()),
            ("raw_text", event.raw_text.clone()),
            ("urls", serde_json::to_string(&event.urls).unwrap_or_default()),
            (
                "score_breakdown",
                serde_json::to_string(&event.score_breakdown).unwrap_or_default(),
            ),
        ]
    }

    /// Unknown or missing values fall back to `Announcement`, matching the
    /// normalizer's own default for an event type it can't otherwise infer
    /// (§4.2: "Infer event from keyword patterns ...; default announcement").
    fn parse_event_type(s: &str) -> EventType {
        match s {
            "listing" => EventType::Listing,
            "delisting" => EventType::Delisting,
            "trading_open" => EventType::TradingOpen,
            "deposit_open" => EventType::DepositOpen,
            "withdraw_open" => EventType::WithdrawOpen,
            "futures_launch" => EventType::FuturesLaunch,
            "airdrop" => EventType::Airdrop,
            "pair_created" => EventType::PairCreated,
            "liquidity_add" => EventType::LiquidityAdd,
            "price_alert" => EventType::PriceAlert,
            "oi_alert" => EventType::OiAlert,
            "announcement" => EventType::Announcement,
            _ => EventType::Announcement,
        }
    }

    /// Reconstructs a [`FusedEvent`] from its wire fields. Returns `None`
    /// if a mandatory field (§6.3) is missing or malformed; the router
    /// treats that as a schema failure on an individual message, never as
    /// a reason to halt the consumer loop.
    pub fn parse_fused_event(fields: &HashMap<String, String>) -> Option<FusedEvent> {
        let event_id = fields.get("event_id")?.clone();
        let symbol = fields.get("symbol")?.clone();
        let score: f64 = fields.get("score")?.parse().ok()?;
        let is_super_event = fields.get("is_super_event").map(|v| v == "1").unwrap_or(false);
        let first_seen_at: i64 = fields.get("first_seen_at")?.parse().ok()?;
        let created_at: i64 = fields.get("created_at")?.parse().ok()?;

        let sources: BTreeSet<String> = fields
            .get("sources")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let urls: Vec<String> = fields
            .get("urls")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let score_breakdown: ScoreBreakdown = fields
            .get("score_breakdown")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let confidence = fields
            .get("confidence")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| score_breakdown.confidence());

        Some(FusedEvent {
            event_id,
            symbol,
            symbols: BTreeSet::new(),
            exchange: fields.get("exchange").filter(|s| !s.is_empty()).cloned(),
            exchanges: BTreeSet::new(),
            event_type: fields.get("event_type").map(|s| parse_event_type(s)).unwrap_or(EventType::Announcement),
            source_count: fields.get("source_count").and_then(|v| v.parse().ok()).unwrap_or(sources.len()),
            sources,
            source_events: Vec::new(),
            first_seen_at,
            last_seen_at: fields.get("last_seen_at").and_then(|v| v.parse().ok()).unwrap_or(first_seen_at),
            aggregation_window_ms: 0,
            score,
            score_breakdown,
            confidence,
            is_super_event,
            is_first_seen: fields.get("is_first_seen").map(|v| v == "1").unwrap_or(false),
            timeliness_category: TimelinessCategory::Older,
            raw_text: fields.get("raw_text").cloned().unwrap_or_default(),
            urls,
            created_at,
        })
    }
}

/// `normalize(symbol)` — strips common quote-pair suffixes and
/// non-alphanumerics, then uppercases (§3.2).
pub fn normalize_symbol(raw: &str) -> String {
    const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD", "BTC", "ETH", "BNB"];
    let upper: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();

    for suffix in QUOTE_SUFFIXES {
        if upper.len() > suffix.len() && upper.ends_with(suffix) {
            return upper[..upper.len() - suffix.len()].to_string();
        }
    }
    upper
}

/// Exchange-independent identity of a symbol+event pair: `normalize(symbol)
/// | lower(event_type)`. Used to reconcile a fingerprint that is exchange-
/// qualified (§3.2) with a cross-source report that carries no exchange at
/// all (alpha-intel/social/news/chain sources) so the two can still fuse
/// into one aggregation window (see `crate::aggregate`).
pub fn symbol_event_key(symbol: &str, event_type: &str) -> String {
    format!("{}|{}", normalize_symbol(symbol), event_type.to_ascii_lowercase())
}

/// `fingerprint = hash16(lower(exchange) | normalize(symbol) | lower(event_type))`.
///
/// Uses SHA-256 rather than `std`'s `DefaultHasher` because the latter is
/// seeded per process and would not satisfy the "stable across processes"
/// requirement.
pub fn fingerprint(exchange: &str, symbol: &str, event_type: &str) -> String {
    let key = format!(
        "{}|{}|{}",
        exchange.to_ascii_lowercase(),
        normalize_symbol(symbol),
        event_type.to_ascii_lowercase()
    );
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_timestamp_text_and_sidecars() {
        let fp1 = fingerprint("Binance", "ABCUSDT", "listing");
        let fp2 = fingerprint("binance", "abc", "listing");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let a = fingerprint("binance", "ABCUSDT", "listing");
        let b = fingerprint("binance", "ABCUSDT", "listing");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn normalize_strips_quote_suffix() {
        assert_eq!(normalize_symbol("ABCUSDT"), "ABC");
        assert_eq!(normalize_symbol("abc-usd"), "ABC");
        assert_eq!(normalize_symbol("XYZ"), "XYZ");
    }

    #[test]
    fn final_score_matches_formula() {
        let bd = ScoreBreakdown {
            source: 65.0,
            multi_source: 0.0,
            timeliness: 20.0,
            exchange: 15.0,
        };
        assert!((bd.final_score() - 22.25).abs() < 1e-9);
    }

    #[test]
    fn unknown_wire_event_type_decodes_to_announcement() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("event_id".to_string(), "fused_1_abc".to_string());
        fields.insert("symbol".to_string(), "ABC".to_string());
        fields.insert("score".to_string(), "60.0".to_string());
        fields.insert("first_seen_at".to_string(), "1000".to_string());
        fields.insert("created_at".to_string(), "1000".to_string());
        fields.insert("event_type".to_string(), "some_future_event_type".to_string());

        let fused = wire::parse_fused_event(&fields).unwrap();
        assert_eq!(fused.event_type, EventType::Announcement);
    }
}
