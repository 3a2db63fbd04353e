//! Aggregator / first-seen tracker (C4, §4.4).
//!
//! Aggregation windows live in process memory for latency; only the
//! first-seen ledger is persisted to the bus (§9 design note — windows
//! are short enough that losing them on crash is acceptable, since the
//! bus's pending-entries list will redeliver the underlying raw events).

use crate::bus::Bus;
use crate::error::Result;
use crate::model::{self, keys, EventType, FusedEvent, RawEvent, ScoreBreakdown, SourceGroup, TimelinessCategory};
use crate::scoring::{self, ScoringConfig};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Merged into (or opened) an aggregation window.
    Merged,
    /// Same source already present in this fingerprint's open window;
    /// suppressed per §4.4.1 step 5.
    SameSourceDuplicate,
}

struct Window {
    fingerprint: String,
    symbol_event_key: String,
    symbol: String,
    symbols: BTreeSet<String>,
    exchange: Option<String>,
    exchanges: BTreeSet<String>,
    sources: BTreeSet<String>,
    source_groups: BTreeSet<SourceGroup>,
    urls: Vec<String>,
    raw_texts: Vec<String>,
    source_events: Vec<String>,
    event_type: EventType,
    window_first_seen_at: i64,
    global_first_seen_at: i64,
    is_first_seen: bool,
    last_seen_at: i64,
    window_ms: i64,
    best_breakdown: ScoreBreakdown,
    best_category: TimelinessCategory,
}

impl Window {
    fn recompute_score(&mut self, cfg: &ScoringConfig) {
        let best_source = self
            .sources
            .iter()
            .max_by(|a, b| {
                let sa = cfg.source_table.get(*a).map(|e| e.base_score).unwrap_or(0.0);
                let sb = cfg.source_table.get(*b).map(|e| e.base_score).unwrap_or(0.0);
                sa.partial_cmp(&sb).unwrap()
            })
            .cloned()
            .unwrap_or_default();
        let delta = self.window_first_seen_at - self.global_first_seen_at;
        let (breakdown, category) = scoring::score(
            &best_source,
            self.exchange.as_deref(),
            delta,
            &self.source_groups,
            cfg,
        );
        self.best_breakdown = breakdown;
        self.best_category = category;
    }

    fn is_super_event(&self, cfg: &ScoringConfig) -> bool {
        self.source_groups.len() >= 2
            && (self.best_breakdown.final_score() >= cfg.super_event_min_score || self.is_first_seen)
    }

    fn into_fused_event(self, created_at_ms: i64) -> FusedEvent {
        let score = self.best_breakdown.final_score();
        let confidence = self.best_breakdown.confidence();
        FusedEvent {
            event_id: FusedEvent::make_event_id(self.window_first_seen_at, &self.fingerprint),
            symbol: self.symbol,
            symbols: self.symbols,
            exchange: self.exchange,
            exchanges: self.exchanges,
            event_type: self.event_type,
            source_count: self.sources.len(),
            sources: self.sources,
            source_events: self.source_events,
            first_seen_at: self.window_first_seen_at,
            last_seen_at: self.last_seen_at,
            aggregation_window_ms: self.window_ms,
            score,
            is_super_event: false, // overwritten by caller with cfg in hand
            confidence,
            score_breakdown: self.best_breakdown,
            is_first_seen: self.is_first_seen,
            timeliness_category: self.best_category,
            raw_text: self.raw_texts.join(" | "),
            urls: self.urls,
            created_at: created_at_ms,
        }
    }
}

/// In-process windows plus the exchange-independent symbol+event index
/// used to reconcile exchange-qualified and exchange-absent fingerprints
/// (see `crate::model::symbol_event_key`). Both live behind one lock so an
/// `add()` call always sees them in sync.
#[derive(Default)]
struct State {
    windows: HashMap<String, Window>,
    by_symbol_event: HashMap<String, BTreeSet<String>>,
}

impl State {
    /// Resolves the fingerprint `event` should be merged under. An
    /// exchange-qualified fingerprint that already has an open window
    /// always wins. Otherwise, if an open window exists for the same
    /// `symbol_event_key` and is "exchange-compatible" (either side's
    /// exchange is unset, or both match), reuse it — this is what lets a
    /// no-exchange alpha-intel/social/news/chain report fuse with an
    /// exchange-bearing report for the same token (§4.5, P6, scenario S2)
    /// even though their §3.2 fingerprints differ. A genuinely conflicting
    /// exchange (two different known venues) never merges.
    fn resolve_fingerprint(&self, event: &RawEvent, own_fp: &str) -> String {
        if self.windows.contains_key(own_fp) {
            return own_fp.to_string();
        }
        let sek = model::symbol_event_key(
            event.canonical_symbol.as_deref().or(event.symbol.as_deref()).unwrap_or(""),
            event.event.as_str(),
        );
        if let Some(candidates) = self.by_symbol_event.get(&sek) {
            for fp in candidates {
                if let Some(window) = self.windows.get(fp) {
                    let compatible = event.exchange.is_none()
                        || window.exchange.is_none()
                        || window.exchange.as_deref() == event.exchange.as_deref();
                    if compatible {
                        return fp.clone();
                    }
                }
            }
        }
        own_fp.to_string()
    }
}

/// Per-fingerprint windowed state plus the bus-backed first-seen ledger.
pub struct Aggregator {
    bus: Arc<dyn Bus>,
    scoring: Arc<ScoringConfig>,
    default_window_ms: i64,
    trusted_window_ms: i64,
    first_seen_ttl_sec: u64,
    state: Mutex<State>,
}

impl Aggregator {
    pub fn new(
        bus: Arc<dyn Bus>,
        scoring: Arc<ScoringConfig>,
        default_window_ms: i64,
        trusted_window_ms: i64,
        first_seen_ttl_sec: u64,
    ) -> Self {
        Self {
            bus,
            scoring,
            default_window_ms,
            trusted_window_ms,
            first_seen_ttl_sec,
            state: Mutex::new(State::default()),
        }
    }

    /// §4.4.1 `add(RawEvent e)`.
    pub async fn add(&self, event: &RawEvent, bus_id: &str) -> Result<AddOutcome> {
        let own_fp = event.fingerprint();
        let sek = model::symbol_event_key(
            event.canonical_symbol.as_deref().or(event.symbol.as_deref()).unwrap_or(""),
            event.event.as_str(),
        );

        let target_fp = {
            let state = self.state.lock();
            state.resolve_fingerprint(event, &own_fp)
        };

        let fs_key = keys::first_seen(&target_fp);
        let set_first = self
            .bus
            .set_if_absent(&fs_key, &event.detected_at.to_string(), self.first_seen_ttl_sec)
            .await?;
        let global_first_seen_at = if set_first {
            event.detected_at
        } else {
            self.bus
                .get(&fs_key)
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(event.detected_at)
        };

        let mut state = self.state.lock();

        if let Some(window) = state.windows.get(&target_fp) {
            if window.sources.contains(&event.source) {
                return Ok(AddOutcome::SameSourceDuplicate);
            }
        }

        let window_ms = if self.scoring.is_trusted_socket(&event.source) {
            self.trusted_window_ms
        } else {
            self.default_window_ms
        };

        let window = state.windows.entry(target_fp.clone()).or_insert_with(|| Window {
            fingerprint: target_fp.clone(),
            symbol_event_key: sek.clone(),
            symbol: event
                .canonical_symbol
                .clone()
                .or_else(|| event.symbol.clone())
                .unwrap_or_default(),
            symbols: BTreeSet::new(),
            exchange: event.exchange.clone(),
            exchanges: BTreeSet::new(),
            sources: BTreeSet::new(),
            source_groups: BTreeSet::new(),
            urls: Vec::new(),
            raw_texts: Vec::new(),
            source_events: Vec::new(),
            event_type: event.event,
            window_first_seen_at: event.detected_at,
            global_first_seen_at,
            is_first_seen: set_first,
            last_seen_at: event.detected_at,
            window_ms,
            best_breakdown: ScoreBreakdown::default(),
            best_category: TimelinessCategory::Older,
        });

        if let Some(symbol) = event.canonical_symbol.clone().or_else(|| event.symbol.clone()) {
            window.symbols.insert(symbol);
        }
        if window.exchange.is_none() {
            window.exchange = event.exchange.clone();
        }
        if let Some(exchange) = &event.exchange {
            window.exchanges.insert(exchange.clone());
        }
        window.sources.insert(event.source.clone());
        window.source_groups.insert(self.scoring.group_for(&event.source));
        if let Some(url) = &event.url {
            if !window.urls.contains(url) {
                window.urls.push(url.clone());
            }
        }
        window.raw_texts.push(event.raw_text.clone());
        window.source_events.push(bus_id.to_string());
        window.last_seen_at = window.last_seen_at.max(event.detected_at);

        window.recompute_score(&self.scoring);

        state
            .by_symbol_event
            .entry(sek)
            .or_default()
            .insert(target_fp);

        Ok(AddOutcome::Merged)
    }

    /// Removes `fp` from the symbol+event index after its window is flushed.
    fn forget(state: &mut State, fp: &str, sek: &str) {
        if let Some(set) = state.by_symbol_event.get_mut(sek) {
            set.remove(fp);
            if set.is_empty() {
                state.by_symbol_event.remove(sek);
            }
        }
    }

    /// §4.4.2 — flush every window idle for at least its `window_ms`.
    /// Windows scoring below `min_score` are discarded silently.
    pub fn flush_expired(&self, now_ms: i64) -> Vec<FusedEvent> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .windows
            .iter()
            .filter(|(_, w)| now_ms - w.last_seen_at >= w.window_ms)
            .map(|(fp, _)| fp.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for fp in expired {
            if let Some(window) = state.windows.remove(&fp) {
                Self::forget(&mut state, &fp, &window.symbol_event_key);
                if window.best_breakdown.final_score() < self.scoring.min_score {
                    continue;
                }
                let is_super = window.is_super_event(&self.scoring);
                let mut fused = window.into_fused_event(now_ms);
                fused.is_super_event = is_super;
                out.push(fused);
            }
        }
        out
    }

    /// Flush every open window regardless of remaining window time, for
    /// graceful shutdown (§5 Cancellation & shutdown).
    pub fn flush_all(&self) -> Vec<FusedEvent> {
        let mut state = self.state.lock();
        let all: Vec<String> = state.windows.keys().cloned().collect();
        let mut out = Vec::with_capacity(all.len());
        let now_ms = state.windows.values().map(|w| w.last_seen_at).max().unwrap_or(0);
        for fp in all {
            if let Some(window) = state.windows.remove(&fp) {
                Self::forget(&mut state, &fp, &window.symbol_event_key);
                if window.best_breakdown.final_score() < self.scoring.min_score {
                    continue;
                }
                let is_super = window.is_super_event(&self.scoring);
                let mut fused = window.into_fused_event(now_ms);
                fused.is_super_event = is_super;
                out.push(fused);
            }
        }
        out
    }

    pub fn open_window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Sources already aggregated for `event`'s window, used by the dedup
    /// filter's same-source check (§4.5). Resolves the same
    /// exchange-reconciled fingerprint `add()` would use, so a no-exchange
    /// report is checked against the exchange-bearing window it would
    /// actually merge into. Once a window is flushed this returns an empty
    /// set — see `dedup` module doc comment for the resulting
    /// approximation.
    pub fn sources_for(&self, event: &RawEvent) -> BTreeSet<String> {
        let state = self.state.lock();
        let own_fp = event.fingerprint();
        let target_fp = state.resolve_fingerprint(event, &own_fp);
        state
            .windows
            .get(&target_fp)
            .map(|w| w.sources.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::model::SourceType;

    fn raw(source: &str, exchange: &str, symbol: &str, detected_at: i64) -> RawEvent {
        raw_opt_exchange(source, Some(exchange), symbol, detected_at)
    }

    /// Like `raw`, but lets the exchange be omitted entirely — the shape a
    /// cross-source report (alpha-intel, social, chain, news) actually has
    /// on the wire, with no `exchange` field at all.
    fn raw_opt_exchange(source: &str, exchange: Option<&str>, symbol: &str, detected_at: i64) -> RawEvent {
        RawEvent {
            source: source.to_string(),
            source_type: SourceType::Websocket,
            exchange: exchange.map(|e| e.to_string()),
            symbol: Some(symbol.to_string()),
            canonical_symbol: Some(model::normalize_symbol(symbol)),
            event: EventType::Listing,
            raw_text: format!("{symbol} listing"),
            url: None,
            detected_at,
            node_id: "node-1".to_string(),
            sidecars: Default::default(),
        }
    }

    #[tokio::test]
    async fn single_source_first_seen_falls_below_min_score() {
        // Mirrors scenario S1: a lone tier-S socket report scores ~22.25,
        // below the default min_score of 28, so nothing reaches the fused stream.
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring.clone(), 5_000, 10_000, 3_600);

        agg.add(&raw("ws_binance", "binance", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();

        let fused = agg.flush_expired(1_000 + 5_000);
        assert!(fused.is_empty());
    }

    #[tokio::test]
    async fn dual_source_confirmation_promotes_to_super() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw("ws_binance", "binance", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();
        let outcome = agg
            .add(&raw("tg_alpha_intel", "binance", "ABCUSDT", 3_000), "1-1")
            .await
            .unwrap();
        assert_eq!(outcome, AddOutcome::Merged);

        let fused = agg.flush_expired(3_000 + 5_000);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source_count, 2);
        assert!(fused[0].is_super_event);
        assert!(fused[0].is_first_seen);
    }

    #[tokio::test]
    async fn no_exchange_cross_source_report_still_promotes_to_super() {
        // Scenario S2's literal inputs: an exchange websocket report followed
        // by an alpha-intel report that carries no `exchange` field at all.
        // Their §3.2 fingerprints differ (one has an exchange component, one
        // doesn't), so this only fuses into one window via the
        // symbol_event_key reconciliation in `State::resolve_fingerprint`.
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw("ws_binance", "binance", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();
        let outcome = agg
            .add(&raw_opt_exchange("tg_alpha_intel", None, "ABCUSDT", 3_000), "1-1")
            .await
            .unwrap();
        assert_eq!(outcome, AddOutcome::Merged);
        assert_eq!(agg.open_window_count(), 1);

        let fused = agg.flush_expired(3_000 + 5_000);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source_count, 2);
        assert!(fused[0].is_super_event);
        assert_eq!(fused[0].exchange.as_deref(), Some("binance"));
    }

    #[tokio::test]
    async fn no_exchange_report_arriving_first_still_fuses_with_later_exchange_report() {
        // Reverse arrival order from S2: the exchange-less report opens the
        // window first, and the exchange-bearing report must still find it
        // via symbol_event_key rather than opening a second window.
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw_opt_exchange("tg_alpha_intel", None, "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();
        let outcome = agg
            .add(&raw("ws_binance", "binance", "ABCUSDT", 3_000), "1-1")
            .await
            .unwrap();
        assert_eq!(outcome, AddOutcome::Merged);
        assert_eq!(agg.open_window_count(), 1);
    }

    #[tokio::test]
    async fn conflicting_exchanges_do_not_merge_into_one_window() {
        // Two different *known* exchanges for the same symbol+event are a
        // genuine conflict, not a reconciliation case — they must stay in
        // separate windows.
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw("ws_binance", "binance", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();
        agg.add(&raw("ws_okx", "okx", "ABCUSDT", 1_500), "1-1")
            .await
            .unwrap();
        assert_eq!(agg.open_window_count(), 2);
    }

    #[tokio::test]
    async fn same_source_repeat_is_suppressed_in_window() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw("ws_binance", "binance", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();
        let outcome = agg
            .add(&raw("ws_binance", "binance", "ABCUSDT", 1_500), "1-1")
            .await
            .unwrap();
        assert_eq!(outcome, AddOutcome::SameSourceDuplicate);
        assert_eq!(agg.open_window_count(), 1);
    }

    #[tokio::test]
    async fn low_score_window_is_discarded_on_flush() {
        let bus = Arc::new(MockBus::new());
        let scoring = Arc::new(ScoringConfig::default());
        let agg = Aggregator::new(bus, scoring, 5_000, 10_000, 3_600);

        agg.add(&raw("news_rss", "unknown_dex", "ABCUSDT", 1_000), "1-0")
            .await
            .unwrap();

        let fused = agg.flush_expired(1_000 + 5_000);
        assert!(fused.is_empty());
    }
}
