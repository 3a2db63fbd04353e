//! Deterministic, pure scoring engine (C3, §4.3).
//!
//! Every table here is data, not a switch on identifiers, per the design
//! note against dynamic dispatch over source tiers: new sources and
//! venues are added by editing [`ScoringConfig`], never by adding a match
//! arm.

use crate::model::{EventType, ScoreBreakdown, SourceGroup, TimelinessCategory};
use std::collections::{BTreeSet, HashMap};

/// One row of the source tier table (§4.3.1): an identifier, its base
/// score, which independent group it belongs to, and whether it's a
/// high-trust socket source eligible for the wider 10s aggregation
/// window (§4.4.1 step 4).
#[derive(Debug, Clone)]
pub struct SourceTierEntry {
    pub base_score: f64,
    pub group: SourceGroup,
    pub trusted_socket: bool,
}

/// Immutable, startup-built scoring configuration. All components that
/// need scoring hold a `&ScoringConfig` (or an `Arc<ScoringConfig>`);
/// hot-reload is explicitly not required (§9).
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub source_table: HashMap<String, SourceTierEntry>,
    pub exchange_multipliers: HashMap<String, f64>,
    pub min_score: f64,
    pub cex_route_min: f64,
    pub hl_route_min: f64,
    pub notify_min: f64,
    pub super_event_min_score: f64,
    /// Sources granted the 10s trusted aggregation window by operator
    /// configuration (§6.6 `aggregation.trusted_sources[]`), in addition to
    /// whatever `source_table` entries already carry `trusted_socket: true`.
    pub trusted_source_overrides: std::collections::BTreeSet<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            source_table: default_source_table(),
            exchange_multipliers: default_exchange_multipliers(),
            min_score: 28.0,
            cex_route_min: 50.0,
            hl_route_min: 40.0,
            notify_min: 28.0,
            super_event_min_score: 50.0,
            trusted_source_overrides: std::collections::BTreeSet::new(),
        }
    }
}

impl ScoringConfig {
    /// Overlay override maps from configuration on top of the built-in
    /// defaults (§6.6 `scoring.source_scores{...}` /
    /// `scoring.exchange_multipliers{...}`). Overrides only replace the
    /// base score of an already-known source; unknown identifiers in the
    /// override map are ignored (adding a genuinely new source requires
    /// its group, which the override map does not carry).
    pub fn with_overrides(mut self, source_scores: &HashMap<String, f64>, exchange_multipliers: &HashMap<String, f64>) -> Self {
        for (id, score) in source_scores {
            if let Some(entry) = self.source_table.get_mut(id) {
                entry.base_score = *score;
            }
        }
        for (exchange, mult) in exchange_multipliers {
            self.exchange_multipliers.insert(exchange.to_ascii_lowercase(), *mult);
        }
        self
    }

    pub fn is_trusted_socket(&self, source: &str) -> bool {
        self.source_table.get(source).map(|e| e.trusted_socket).unwrap_or(false)
            || self.trusted_source_overrides.contains(source)
    }

    /// Applies `aggregation.trusted_sources[]` (§6.6) on top of the
    /// built-in trusted-socket flags.
    pub fn with_trusted_sources(mut self, sources: &[String]) -> Self {
        self.trusted_source_overrides.extend(sources.iter().cloned());
        self
    }

    pub fn group_for(&self, source: &str) -> SourceGroup {
        self.source_table
            .get(source)
            .map(|e| e.group)
            .unwrap_or(SourceGroup::News)
    }
}

fn default_source_table() -> HashMap<String, SourceTierEntry> {
    use SourceGroup::*;
    let rows: &[(&str, f64, SourceGroup, bool)] = &[
        // Tier S — first-party exchange sockets / official announcement channels.
        ("ws_binance", 65.0, ExchangeOfficial, true),
        ("ws_okx", 64.0, ExchangeOfficial, true),
        ("ws_bybit", 63.0, ExchangeOfficial, true),
        ("exchange_announcement", 58.0, ExchangeOfficial, false),
        ("tg_alpha_intel", 57.0, AlphaIntel, false),
        // Tier A — tier-1 exchange REST, regional-market REST, official social.
        ("rest_binance", 45.0, ExchangeOfficial, false),
        ("rest_regional", 44.0, ExchangeOfficial, false),
        ("official_social", 45.0, Social, false),
        // Tier B — generic REST poll, tier-2 socket, chain events.
        ("rest_poll_generic", 30.0, ExchangeOfficial, false),
        ("ws_tier2", 28.0, ExchangeOfficial, false),
        ("chain_factory_event", 24.0, Chain, false),
        ("chain_log", 20.0, Chain, false),
        // Tier C — news / unknown.
        ("news_rss", 2.0, News, false),
    ];
    rows.iter()
        .map(|(id, score, group, trusted)| {
            (
                id.to_string(),
                SourceTierEntry {
                    base_score: *score,
                    group: *group,
                    trusted_socket: *trusted,
                },
            )
        })
        .collect()
}

fn default_exchange_multipliers() -> HashMap<String, f64> {
    [
        ("binance", 1.5),
        ("okx", 1.45),
        ("coinbase", 1.4),
        ("bybit", 1.35),
        ("kucoin", 1.2),
        ("gate", 1.2),
        ("bitget", 1.15),
        ("mexc", 1.1),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// §4.3.2 — `clamp(10 * multiplier, 0, 15)`; unknown exchange multiplies by 1.0.
pub fn exchange_score(exchange: Option<&str>, cfg: &ScoringConfig) -> f64 {
    let multiplier = exchange
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| cfg.exchange_multipliers.get(&e).copied())
        .unwrap_or(1.0);
    (10.0 * multiplier).clamp(0.0, 15.0)
}

/// §4.3.3 — categorize `detected_at - first_seen_at_ms`.
pub fn timeliness_score(delta_ms: i64) -> (f64, TimelinessCategory) {
    match delta_ms {
        d if d <= 0 => (20.0, TimelinessCategory::FirstSeen),
        d if d <= 5_000 => (18.0, TimelinessCategory::Within5s),
        d if d <= 30_000 => (12.0, TimelinessCategory::Within30s),
        d if d <= 60_000 => (8.0, TimelinessCategory::Within1min),
        d if d <= 300_000 => (4.0, TimelinessCategory::Within5min),
        _ => (0.0, TimelinessCategory::Older),
    }
}

/// §4.3.4 — bonus from the count of independent source groups, not raw
/// source identifiers.
pub fn multi_source_score(groups: &BTreeSet<SourceGroup>) -> f64 {
    match groups.len() {
        0 | 1 => 0.0,
        2 => 20.0,
        3 => 32.0,
        _ => 40.0,
    }
}

/// §4.3.5 — pattern-based event-type classifier, used only when the
/// collector did not supply `event`. Checked in enum priority order.
pub fn classify_event_type(raw_text: &str) -> EventType {
    let text = raw_text.to_ascii_lowercase();
    const PATTERNS: &[(&str, EventType)] = &[
        ("trading open", EventType::TradingOpen),
        ("trading will open", EventType::TradingOpen),
        ("will list", EventType::Listing),
        ("lists ", EventType::Listing),
        ("listing", EventType::Listing),
        ("futures launch", EventType::FuturesLaunch),
        ("perpetual contract", EventType::FuturesLaunch),
        ("deposit", EventType::DepositOpen),
        ("airdrop", EventType::Airdrop),
        ("price alert", EventType::PriceAlert),
        ("open interest", EventType::OiAlert),
    ];
    for (pattern, event_type) in PATTERNS {
        if text.contains(pattern) {
            return *event_type;
        }
    }
    EventType::Announcement
}

/// Scores a single source against the aggregated state of its
/// fingerprint window (§4.3.6). `source` is the best (highest
/// `base_score`) source seen so far for this window.
pub fn score(
    best_source: &str,
    exchange: Option<&str>,
    timeliness_delta_ms: i64,
    groups: &BTreeSet<SourceGroup>,
    cfg: &ScoringConfig,
) -> (ScoreBreakdown, TimelinessCategory) {
    let source_score = cfg
        .source_table
        .get(best_source)
        .map(|e| e.base_score)
        .unwrap_or(0.0);
    let (timeliness, category) = timeliness_score(timeliness_delta_ms);

    let breakdown = ScoreBreakdown {
        source: source_score,
        multi_source: multi_source_score(groups),
        timeliness,
        exchange: exchange_score(exchange, cfg),
    };
    (breakdown, category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_first_seen_scores_as_in_scenario_s1() {
        let cfg = ScoringConfig::default();
        let mut groups = BTreeSet::new();
        groups.insert(SourceGroup::ExchangeOfficial);
        let (bd, category) = score("ws_binance", Some("binance"), 0, &groups, &cfg);
        assert_eq!(category, TimelinessCategory::FirstSeen);
        assert!((bd.final_score() - 22.25).abs() < 1e-9);
        assert!(bd.final_score() < cfg.min_score);
    }

    #[test]
    fn dual_source_confirmation_crosses_super_threshold() {
        let cfg = ScoringConfig::default();
        let mut groups = BTreeSet::new();
        groups.insert(SourceGroup::ExchangeOfficial);
        groups.insert(SourceGroup::AlphaIntel);
        let (bd, _) = score("ws_binance", Some("binance"), 0, &groups, &cfg);
        assert_eq!(bd.multi_source, 20.0);
        assert!(bd.final_score() >= cfg.super_event_min_score - 25.0);
    }

    #[test]
    fn operator_configured_trusted_source_widens_window_eligibility() {
        let cfg = ScoringConfig::default();
        assert!(!cfg.is_trusted_socket("rest_poll_generic"));
        let cfg = cfg.with_trusted_sources(&["rest_poll_generic".to_string()]);
        assert!(cfg.is_trusted_socket("rest_poll_generic"));
        assert!(cfg.is_trusted_socket("ws_binance"), "built-in trusted sockets stay trusted");
    }

    #[test]
    fn unknown_exchange_gets_neutral_multiplier() {
        let cfg = ScoringConfig::default();
        assert_eq!(exchange_score(Some("some_new_dex"), &cfg), 10.0);
        assert_eq!(exchange_score(None, &cfg), 10.0);
    }

    #[test]
    fn classifier_prefers_trading_open_over_listing() {
        assert_eq!(
            classify_event_type("Binance trading open for ABC, which was previously listed"),
            EventType::TradingOpen
        );
    }
}
