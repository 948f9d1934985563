//! Pattern Trader Library
//!
//! Nearest-pattern range prediction per (asset, timeframe), LONG/SHORT level
//! aggregation, and the entry/DCA/trailing-exit state machine built on them.

pub mod candle;
pub mod config;
pub mod error;
pub mod executor;
pub mod feed;
pub mod intent;
pub mod levels;
pub mod memory;
pub mod portfolio;
pub mod position;
pub mod predictor;
pub mod runner;
pub mod state;
pub mod strategy;

// Re-export main types for convenience
pub use candle::{Candle, CandleSeries, CandleStore, CandleUpdate, Timeframe};
pub use config::{PaperConfig, PredictorConfig, RunnerConfig, StrategyConfig, TraderConfig};
pub use error::{ExecutionError, FeedError, Result, TraderError};
pub use executor::{Amount, Fill, OrderExecutor, OrderIntent, OrderStatus, PaperExecutor, Side};
pub use feed::{HttpFeed, MarketFeed, MarketSnapshot, Quote, ReplayFeed};
pub use intent::{IntentRegistry, IntentState};
pub use levels::{compute_levels, PredictedBounds, PriceSide, SignalLevels};
pub use memory::{PatternInstance, PatternMemory};
pub use portfolio::{Account, AccountSnapshot};
pub use position::{Position, PositionState};
pub use predictor::{PredictionRecord, Predictor};
pub use runner::{AssetWorker, CycleOutcome, Runner, TradingContext};
pub use state::{AssetSnapshot, NowState, StateManager};
pub use strategy::{ClosedTrade, OrderAction, OrderRequest, TradingStateMachine};
