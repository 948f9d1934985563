//! Error types for the trading core

use crate::candle::Timeframe;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("Insufficient history for {asset} {timeframe}: have {have} candles, need {need}")]
    InsufficientHistory {
        asset: String,
        timeframe: Timeframe,
        have: usize,
        need: usize,
    },

    #[error("Feed unavailable: {0}")]
    FeedUnavailable(#[from] FeedError),

    #[error("Order execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Fatal for the asset until it is reset manually
    #[error("Invariant violated for {asset}: {detail}")]
    InvariantViolation { asset: String, detail: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TraderError {
    pub fn invariant(asset: &str, detail: impl Into<String>) -> Self {
        TraderError::InvariantViolation {
            asset: asset.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, TraderError::InvariantViolation { .. })
    }
}

impl From<serde_json::Error> for TraderError {
    fn from(e: serde_json::Error) -> Self {
        TraderError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for TraderError {
    fn from(e: serde_yaml::Error) -> Self {
        TraderError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for TraderError {
    fn from(e: config::ConfigError) -> Self {
        TraderError::Config(e.to_string())
    }
}

/// Errors reported by the order-execution collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Order timed out after {0}s")]
    Timeout(u64),

    #[error("Partial fill: {filled} of {requested}")]
    PartialFill { filled: String, requested: String },

    #[error("Insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: String, available: String },

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors reported by the market-data collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("Feed timed out after {0}s")]
    Timeout(u64),

    #[error("No fresh data for {0}")]
    Stale(String),

    #[error("Invalid market data: {0}")]
    InvalidData(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FeedError::Timeout(0)
        } else {
            FeedError::Transport(e.to_string())
        }
    }
}

/// Result type for trading core operations
pub type Result<T> = std::result::Result<T, TraderError>;
