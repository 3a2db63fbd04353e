//! Ingestion normalizer (C2, §4.2).
//!
//! Collectors post a loosely-typed payload; `normalize` validates and
//! canonicalizes it into the crate's [`RawEvent`], or rejects it.

use crate::model::{normalize_symbol, EventType, RawEvent, RejectReason, SourceType};
use crate::scoring::classify_event_type;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

/// Maximum allowed skew between `detected_at` and wall clock (§3.1 invariant).
pub const DEFAULT_SANITY_WINDOW: Duration = Duration::from_secs(3600);

pub const MAX_RAW_TEXT_LEN: usize = 10_000;

/// The wire shape collectors publish — all-string fields plus optional
/// JSON-string sidecars, matching §6.2.
#[derive(Debug, Clone, Default)]
pub struct RawPayload {
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub event: Option<String>,
    pub raw_text: Option<String>,
    pub url: Option<String>,
    pub detected_at: Option<i64>,
    pub node_id: Option<String>,
    pub sidecars: HashMap<String, String>,
}

fn parse_source_type(s: &str) -> Option<SourceType> {
    match s {
        "websocket" => Some(SourceType::Websocket),
        "market" => Some(SourceType::Market),
        "social" => Some(SourceType::Social),
        "chain" => Some(SourceType::Chain),
        "news" => Some(SourceType::News),
        _ => None,
    }
}

fn parse_event_type(s: &str) -> Option<EventType> {
    match s {
        "listing" => Some(EventType::Listing),
        "delisting" => Some(EventType::Delisting),
        "trading_open" => Some(EventType::TradingOpen),
        "deposit_open" => Some(EventType::DepositOpen),
        "withdraw_open" => Some(EventType::WithdrawOpen),
        "futures_launch" => Some(EventType::FuturesLaunch),
        "airdrop" => Some(EventType::Airdrop),
        "pair_created" => Some(EventType::PairCreated),
        "liquidity_add" => Some(EventType::LiquidityAdd),
        "announcement" => Some(EventType::Announcement),
        "price_alert" => Some(EventType::PriceAlert),
        "oi_alert" => Some(EventType::OiAlert),
        _ => None,
    }
}

/// `normalize(raw_payload) -> RawEvent | Reject(reason)` (§4.2).
pub fn normalize(payload: RawPayload) -> Result<RawEvent, RejectReason> {
    let source = payload
        .source
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RejectReason::SchemaInvalid("missing source".into()))?;
    let source_type_raw = payload
        .source_type
        .ok_or_else(|| RejectReason::SchemaInvalid("missing source_type".into()))?;
    let source_type = parse_source_type(&source_type_raw)
        .ok_or_else(|| RejectReason::SchemaInvalid(format!("unknown source_type {source_type_raw}")))?;
    let mut raw_text = payload
        .raw_text
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RejectReason::SchemaInvalid("missing raw_text".into()))?;
    let detected_at = payload
        .detected_at
        .ok_or_else(|| RejectReason::SchemaInvalid("missing detected_at".into()))?;
    let node_id = payload
        .node_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RejectReason::SchemaInvalid("missing node_id".into()))?;

    let now_ms = Utc::now().timestamp_millis();
    let skew = (now_ms - detected_at).abs();
    if skew as u128 > DEFAULT_SANITY_WINDOW.as_millis() {
        return Err(RejectReason::StaleOrSkewed {
            detected_at_ms: detected_at,
            now_ms,
        });
    }

    if raw_text.chars().count() > MAX_RAW_TEXT_LEN {
        raw_text = raw_text.chars().take(MAX_RAW_TEXT_LEN).collect();
    }

    let event = match payload.event.as_deref().and_then(parse_event_type) {
        Some(e) => e,
        None => classify_event_type(&raw_text),
    };

    let exchange = payload.exchange.map(|e| e.to_ascii_lowercase());
    let canonical_symbol = payload.symbol.as_deref().map(normalize_symbol);

    let sidecars = payload
        .sidecars
        .into_iter()
        .filter_map(|(k, v)| serde_json::from_str::<serde_json::Value>(&v).ok().map(|val| (k, val)))
        .collect();

    Ok(RawEvent {
        source,
        source_type,
        exchange,
        symbol: payload.symbol,
        canonical_symbol,
        event,
        raw_text,
        url: payload.url,
        detected_at,
        node_id,
        sidecars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> RawPayload {
        RawPayload {
            source: Some("ws_binance".to_string()),
            source_type: Some("websocket".to_string()),
            exchange: Some("Binance".to_string()),
            symbol: Some("ABCUSDT".to_string()),
            event: Some("listing".to_string()),
            raw_text: Some("ABC will be listed on Binance".to_string()),
            url: None,
            detected_at: Some(Utc::now().timestamp_millis()),
            node_id: Some("collector-1".to_string()),
            sidecars: HashMap::new(),
        }
    }

    #[test]
    fn valid_payload_normalizes() {
        let event = normalize(valid_payload()).unwrap();
        assert_eq!(event.exchange.as_deref(), Some("binance"));
        assert_eq!(event.canonical_symbol.as_deref(), Some("ABC"));
        assert_eq!(event.event, EventType::Listing);
    }

    #[test]
    fn missing_source_is_rejected() {
        let mut payload = valid_payload();
        payload.source = None;
        assert!(matches!(normalize(payload), Err(RejectReason::SchemaInvalid(_))));
    }

    #[test]
    fn stale_detected_at_is_rejected() {
        let mut payload = valid_payload();
        payload.detected_at = Some(Utc::now().timestamp_millis() - 2 * 3600 * 1000);
        assert!(matches!(normalize(payload), Err(RejectReason::StaleOrSkewed { .. })));
    }

    #[test]
    fn missing_event_falls_back_to_classifier() {
        let mut payload = valid_payload();
        payload.event = None;
        payload.raw_text = Some("Binance trading open for ABC".to_string());
        let event = normalize(payload).unwrap();
        assert_eq!(event.event, EventType::TradingOpen);
    }

    #[test]
    fn oversized_raw_text_is_truncated() {
        let mut payload = valid_payload();
        payload.raw_text = Some("x".repeat(MAX_RAW_TEXT_LEN + 500));
        let event = normalize(payload).unwrap();
        assert_eq!(event.raw_text.chars().count(), MAX_RAW_TEXT_LEN);
    }

    #[test]
    fn oversized_multi_byte_raw_text_truncates_by_char_without_panicking() {
        // Multi-language collector content (§4.3.5) — these are 3-byte UTF-8
        // characters, so a byte-index truncation would land mid-character.
        let mut payload = valid_payload();
        payload.raw_text = Some("公".repeat(MAX_RAW_TEXT_LEN + 500));
        let event = normalize(payload).unwrap();
        assert_eq!(event.raw_text.chars().count(), MAX_RAW_TEXT_LEN);
    }
}
