//! State Management - read-only projections written to disk for observability
//!
//! `state/now.json` is rewritten after every cycle; closed trades are
//! appended to `journal/trades.jsonl`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::candle::Timeframe;
use crate::config::TraderConfig;
use crate::levels::SignalLevels;
use crate::portfolio::AccountSnapshot;
use crate::position::Position;
use crate::strategy::{ClosedTrade, DcaOutlook};

/// Predicted bounds of one timeframe, for charting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLine {
    pub timeframe: Timeframe,
    pub target_start: DateTime<Utc>,
    pub predicted_high: Decimal,
    pub predicted_low: Decimal,
    pub contributors: usize,
}

/// Everything observable about one asset after a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub asset: String,
    pub updated_at: DateTime<Utc>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub levels: SignalLevels,
    pub predictions: Vec<PredictionLine>,
    pub position: Option<Position>,
    pub avg_cost: Option<Decimal>,
    pub dca_outlook: Option<DcaOutlook>,
    pub pending_order: Option<String>,
    pub consecutive_failures: u32,
    /// Set while the asset is halted by an invariant violation
    pub halted: Option<String>,
    /// Why the last cycle did nothing, if it was skipped
    pub skipped: Option<String>,
}

/// Current status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub assets: BTreeMap<String, AssetSnapshot>,
    pub account: AccountSnapshot,
}

/// Manages state files for observability
pub struct StateManager {
    state_dir: PathBuf,
    journal_dir: PathBuf,
}

impl StateManager {
    pub fn new(base: &Path) -> Self {
        Self {
            state_dir: base.join("state"),
            journal_dir: base.join("journal"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.journal_dir).await?;
        Ok(())
    }

    pub fn now_path(&self) -> PathBuf {
        self.state_dir.join("now.json")
    }

    pub fn trades_path(&self) -> PathBuf {
        self.journal_dir.join("trades.jsonl")
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let path = self.now_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    pub async fn append_trade(&self, trade: &ClosedTrade) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(trade)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trades_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Journaled {} trade", trade.asset);
        Ok(())
    }

    /// Render the effective configuration for auditing
    pub async fn write_config(&self, config: &TraderConfig) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(config)?;
        fs::write(self.state_dir.join("config.yaml"), yaml).await?;
        Ok(())
    }

    pub async fn read_trades(&self) -> anyhow::Result<Vec<ClosedTrade>> {
        let path = self.trades_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
            .collect()
    }
}
