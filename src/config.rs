//! Configuration management (§6.6).

use crate::scoring::ScoringConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bus: BusConfig,
    #[serde(default)]
    pub scoring: ScoringOverrides,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub node_id: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub endpoint: String,
    /// Optional auth token, appended as the URL's userinfo when present.
    pub auth: Option<String>,
}

/// Overrides for the scoring tables (§4.3.1/§4.3.2) and thresholds
/// (§4.3.6). Any field left unset falls back to [`ScoringConfig::default`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScoringOverrides {
    #[serde(default)]
    pub source_scores: HashMap<String, f64>,
    #[serde(default)]
    pub exchange_multipliers: HashMap<String, f64>,
    pub min_score: Option<f64>,
    pub cex_route_min: Option<f64>,
    pub hl_route_min: Option<f64>,
    pub notify_min: Option<f64>,
    pub super_event_min_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_window_ms")]
    pub default_window_ms: i64,
    #[serde(default = "default_trusted_window_ms")]
    pub trusted_window_ms: i64,
    #[serde(default)]
    pub trusted_sources: Vec<String>,
}

fn default_window_ms() -> i64 {
    5_000
}

fn default_trusted_window_ms() -> i64 {
    10_000
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            default_window_ms: default_window_ms(),
            trusted_window_ms: default_trusted_window_ms(),
            trusted_sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_ttl")]
    pub ttl_sec: u64,
    #[serde(default = "default_first_seen_ttl")]
    pub first_seen_ttl_sec: u64,
    #[serde(default = "default_cooldown_ttl")]
    pub cooldown_ttl_sec: u64,
}

fn default_dedup_ttl() -> u64 {
    300
}

fn default_first_seen_ttl() -> u64 {
    3_600
}

fn default_cooldown_ttl() -> u64 {
    30
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_sec: default_dedup_ttl(),
            first_seen_ttl_sec: default_first_seen_ttl(),
            cooldown_ttl_sec: default_cooldown_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_cex_priority")]
    pub cex_priority: Vec<String>,
    #[serde(default = "default_blacklist")]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub hl_market_map: HashMap<String, String>,
}

fn default_cex_priority() -> Vec<String> {
    vec!["gate".to_string(), "mexc".to_string(), "bitget".to_string()]
}

fn default_blacklist() -> Vec<String> {
    [
        "USDT", "USDC", "BUSD", "DAI", "BTC", "ETH", "BNB", "WBTC", "WETH", "WBNB",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cex_priority: default_cex_priority(),
            blacklist: default_blacklist(),
            hl_market_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_sec: u64,
    #[serde(default = "default_notify_retries")]
    pub retries: u32,
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_notify_retries() -> u32 {
    3
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_sec: default_notify_timeout(),
            retries: default_notify_retries(),
        }
    }
}

impl Config {
    /// Load configuration from file, overlaid by `FUSION_*` environment
    /// variables.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.as_ref().to_str().unwrap()))
            .add_source(config::Environment::with_prefix("FUSION").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Load from the first of a few conventional locations.
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = ["config.toml", "config.yaml", "~/.config/listing-fusion-core/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        anyhow::bail!("No configuration file found")
    }

    /// Build the immutable, startup-resolved scoring configuration by
    /// overlaying this config's overrides on the built-in defaults.
    pub fn scoring_config(&self) -> ScoringConfig {
        let mut cfg = ScoringConfig::default()
            .with_overrides(&self.scoring.source_scores, &self.scoring.exchange_multipliers);
        if let Some(v) = self.scoring.min_score {
            cfg.min_score = v;
        }
        if let Some(v) = self.scoring.cex_route_min {
            cfg.cex_route_min = v;
        }
        if let Some(v) = self.scoring.hl_route_min {
            cfg.hl_route_min = v;
        }
        if let Some(v) = self.scoring.notify_min {
            cfg.notify_min = v;
        }
        if let Some(v) = self.scoring.super_event_min_score {
            cfg.super_event_min_score = v;
        }
        cfg.with_trusted_sources(&self.aggregation.trusted_sources)
    }
}
