//! Trader Configuration
//!
//! Layered: built-in defaults, then an optional file, then environment
//! variables prefixed `PATTERN_TRADER__` (e.g.
//! `PATTERN_TRADER__STRATEGY__ENTRY_THRESHOLD=4`).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::candle::Timeframe;
use crate::error::{Result, TraderError};
use crate::levels::PriceSide;

/// Default config file looked up when `PATTERN_TRADER_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "pattern-trader.yaml";

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "PATTERN_TRADER";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TraderConfig {
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            assets: default_assets(),
            timeframes: default_timeframes(),
            strategy: StrategyConfig::default(),
            predictor: PredictorConfig::default(),
            runner: RunnerConfig::default(),
            paper: PaperConfig::default(),
            feed: FeedConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Entry, DCA and exit parameters of the trading state machine
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StrategyConfig {
    /// LONG level needed to open a position
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: u32,
    /// Highest SHORT level that still allows an entry
    #[serde(default)]
    pub short_veto_threshold: u32,
    /// Fraction of portfolio value spent on the initial buy (0.005 = 0.5%)
    #[serde(default = "default_start_allocation_fraction")]
    pub start_allocation_fraction: Decimal,
    /// Each DCA buy is this multiple of the previous buy
    #[serde(default = "default_dca_multiplier")]
    pub dca_multiplier: Decimal,
    /// Drawdown from entry price (percent) that triggers DCA 1, 2, ...
    #[serde(default = "default_dca_drawdown_tiers_pct")]
    pub dca_drawdown_tiers_pct: Vec<Decimal>,
    #[serde(default = "default_max_dca_per_24h")]
    pub max_dca_per_24h: usize,
    #[serde(default = "default_profit_margin_no_dca_pct")]
    pub profit_margin_no_dca_pct: Decimal,
    #[serde(default = "default_profit_margin_with_dca_pct")]
    pub profit_margin_with_dca_pct: Decimal,
    #[serde(default = "default_trailing_gap_pct")]
    pub trailing_gap_pct: Decimal,
    /// Let a level-based DCA jump straight to the current LONG level
    #[serde(default)]
    pub dca_level_skipping: bool,
    /// Price used for SHORT level evaluation (LONG always uses ask)
    #[serde(default)]
    pub short_price_side: PriceSide,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            entry_threshold: default_entry_threshold(),
            short_veto_threshold: 0,
            start_allocation_fraction: default_start_allocation_fraction(),
            dca_multiplier: default_dca_multiplier(),
            dca_drawdown_tiers_pct: default_dca_drawdown_tiers_pct(),
            max_dca_per_24h: default_max_dca_per_24h(),
            profit_margin_no_dca_pct: default_profit_margin_no_dca_pct(),
            profit_margin_with_dca_pct: default_profit_margin_with_dca_pct(),
            trailing_gap_pct: default_trailing_gap_pct(),
            dca_level_skipping: false,
            short_price_side: PriceSide::default(),
        }
    }
}

/// Pattern memory and predictor parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PredictorConfig {
    /// Closed candles per pattern window
    #[serde(default = "default_window_len")]
    pub window_len: usize,
    /// Distance (RMS percent) at which similarity halves
    #[serde(default = "default_kernel_scale")]
    pub kernel_scale: f64,
    /// Combining weights below this are dropped
    #[serde(default = "default_min_combining_weight")]
    pub min_combining_weight: f64,
    /// Keep only the N largest combining weights (all when unset)
    #[serde(default)]
    pub max_neighbors: Option<usize>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Instance error (percent of reference) at which the update is neutral
    #[serde(default = "default_error_tolerance_pct")]
    pub error_tolerance_pct: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Candles requested per timeframe when training
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window_len: default_window_len(),
            kernel_scale: default_kernel_scale(),
            min_combining_weight: default_min_combining_weight(),
            max_neighbors: None,
            learning_rate: default_learning_rate(),
            error_tolerance_pct: default_error_tolerance_pct(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            history_limit: default_history_limit(),
        }
    }
}

/// Polling loop parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Quotes older than this skip the cycle
    #[serde(default = "default_max_quote_age_secs")]
    pub max_quote_age_secs: u64,
    /// Cycles a submitted order may stay unconfirmed before it is cancelled
    #[serde(default = "default_pending_order_max_cycles")]
    pub pending_order_max_cycles: u32,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            feed_timeout_secs: default_feed_timeout_secs(),
            order_timeout_secs: default_order_timeout_secs(),
            max_quote_age_secs: default_max_quote_age_secs(),
            pending_order_max_cycles: default_pending_order_max_cycles(),
            state_dir: default_state_dir(),
        }
    }
}

/// Paper trading account parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PaperConfig {
    #[serde(default = "default_starting_cash")]
    pub starting_cash: Decimal,
    /// Fee per fill as a fraction of notional (0.001 = 0.1%)
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Chance that an order stays pending for one poll
    #[serde(default)]
    pub pending_probability: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_cash: default_starting_cash(),
            commission_rate: default_commission_rate(),
            pending_probability: 0.0,
            seed: default_seed(),
        }
    }
}

/// Market data service
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_feed_base_url")]
    pub base_url: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_base_url(),
        }
    }
}

impl TraderConfig {
    /// Load defaults, then `path` (if it exists), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(format!("{}_CONFIG", ENV_PREFIX)).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TraderConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let s = &self.strategy;
        let p = &self.predictor;

        if self.assets.is_empty() {
            errors.push("at least one asset is required".to_string());
        }
        if self.timeframes.is_empty() {
            errors.push("at least one timeframe is required".to_string());
        }
        let mut unique = self.timeframes.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.timeframes.len() {
            errors.push("timeframes must not repeat".to_string());
        }
        if s.entry_threshold == 0 || s.entry_threshold as usize > self.timeframes.len() {
            errors.push(format!(
                "entry_threshold must be between 1 and the number of timeframes ({})",
                self.timeframes.len()
            ));
        }
        if s.start_allocation_fraction <= Decimal::ZERO || s.start_allocation_fraction > Decimal::ONE {
            errors.push("start_allocation_fraction must be in (0, 1]".to_string());
        }
        if s.dca_multiplier <= Decimal::ZERO {
            errors.push("dca_multiplier must be positive".to_string());
        }
        if s
            .dca_drawdown_tiers_pct
            .iter()
            .any(|t| *t <= Decimal::ZERO || *t >= Decimal::ONE_HUNDRED)
        {
            errors.push("dca_drawdown_tiers_pct entries must be in (0, 100)".to_string());
        }
        if s.profit_margin_no_dca_pct <= Decimal::ZERO || s.profit_margin_with_dca_pct <= Decimal::ZERO {
            errors.push("profit margins must be positive".to_string());
        }
        if s.trailing_gap_pct <= Decimal::ZERO || s.trailing_gap_pct >= Decimal::ONE_HUNDRED {
            errors.push("trailing_gap_pct must be in (0, 100)".to_string());
        }
        if p.window_len == 0 {
            errors.push("window_len must be at least 1".to_string());
        }
        if !(p.kernel_scale > 0.0) {
            errors.push("kernel_scale must be positive".to_string());
        }
        if !(p.min_weight > 0.0) || !(p.max_weight > p.min_weight) {
            errors.push("weight clamp needs 0 < min_weight < max_weight".to_string());
        }
        if !(p.learning_rate > 0.0 && p.learning_rate < 1.0) {
            errors.push("learning_rate must be in (0, 1)".to_string());
        }
        if !(p.error_tolerance_pct > 0.0) {
            errors.push("error_tolerance_pct must be positive".to_string());
        }
        if p.max_neighbors == Some(0) {
            errors.push("max_neighbors must be at least 1 when set".to_string());
        }
        if p.history_limit <= p.window_len {
            errors.push("history_limit must exceed window_len".to_string());
        }
        if self.runner.poll_interval_secs == 0 {
            errors.push("poll_interval_secs must be at least 1".to_string());
        }
        if self.runner.max_quote_age_secs == 0 {
            errors.push("max_quote_age_secs must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.paper.pending_probability) {
            errors.push("pending_probability must be in [0, 1]".to_string());
        }
        if self.paper.commission_rate < Decimal::ZERO || self.paper.commission_rate >= Decimal::ONE {
            errors.push("commission_rate must be in [0, 1)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TraderError::Config(errors.join("; ")))
        }
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn default_assets() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}
fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_entry_threshold() -> u32 { 3 }
fn default_start_allocation_fraction() -> Decimal { Decimal::new(5, 3) }
fn default_dca_multiplier() -> Decimal { Decimal::TWO }
fn default_dca_drawdown_tiers_pct() -> Vec<Decimal> {
    vec![
        Decimal::new(25, 1),
        Decimal::from(5),
        Decimal::from(10),
        Decimal::from(20),
        Decimal::from(30),
        Decimal::from(40),
        Decimal::from(50),
    ]
}
fn default_max_dca_per_24h() -> usize { 2 }
fn default_profit_margin_no_dca_pct() -> Decimal { Decimal::from(5) }
fn default_profit_margin_with_dca_pct() -> Decimal { Decimal::new(25, 1) }
fn default_trailing_gap_pct() -> Decimal { Decimal::new(5, 1) }
fn default_window_len() -> usize { 8 }
fn default_kernel_scale() -> f64 { 1.0 }
fn default_min_combining_weight() -> f64 { 1e-9 }
fn default_learning_rate() -> f64 { 0.1 }
fn default_error_tolerance_pct() -> f64 { 1.0 }
fn default_min_weight() -> f64 { 0.05 }
fn default_max_weight() -> f64 { 10.0 }
fn default_history_limit() -> usize { 1000 }
fn default_poll_interval_secs() -> u64 { 5 }
fn default_feed_timeout_secs() -> u64 { 10 }
fn default_order_timeout_secs() -> u64 { 10 }
fn default_max_quote_age_secs() -> u64 { 60 }
fn default_pending_order_max_cycles() -> u32 { 3 }
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".pattern-trader")
}
fn default_starting_cash() -> Decimal { Decimal::from(10_000) }
fn default_commission_rate() -> Decimal { Decimal::new(1, 3) }
fn default_seed() -> u64 { 42 }
fn default_feed_base_url() -> String {
    "http://localhost:8080".to_string()
}
