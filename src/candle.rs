//! Candle model and per-asset candle store
//!
//! Every (asset, timeframe) pair owns an append-only series of closed candles
//! plus at most one in-progress candle. Closed candles are immutable.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Result, TraderError};

/// Supported timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// Default timeframe set, shortest first
    pub const ALL: [Timeframe; 7] = [
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            Timeframe::H1 => 3600,
            Timeframe::H2 => 7200,
            Timeframe::H4 => 14400,
            Timeframe::H8 => 28800,
            Timeframe::H12 => 43200,
            Timeframe::D1 => 86400,
            Timeframe::W1 => 604800,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.to_seconds())
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TraderError::Config(format!("Unknown timeframe: {}", s)))
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub start_time: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub closed: bool,
}

impl Candle {
    /// Check OHLC consistency (positive prices, high/low enclose open/close)
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.low <= Decimal::ZERO {
            return Err(format!("non-positive low {} at {}", self.low, self.start_time));
        }
        if self.high < self.low {
            return Err(format!(
                "high {} below low {} at {}",
                self.high, self.low, self.start_time
            ));
        }
        if self.open > self.high || self.open < self.low || self.close > self.high || self.close < self.low {
            return Err(format!("open/close outside high/low range at {}", self.start_time));
        }
        if self.volume < Decimal::ZERO {
            return Err(format!("negative volume at {}", self.start_time));
        }
        Ok(())
    }

    /// OHLC as floating point, for feature extraction
    pub fn ohlc_f64(&self) -> Option<[f64; 4]> {
        Some([
            self.open.to_f64()?,
            self.high.to_f64()?,
            self.low.to_f64()?,
            self.close.to_f64()?,
        ])
    }
}

/// What the feed reports for one (asset, timeframe) in one poll
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleUpdate {
    /// Candles that closed since the previous poll (may repeat the last known one)
    pub closed: Vec<Candle>,
    /// Running OHLC of the current candle
    pub in_progress: Option<Candle>,
}

/// Append-only candle series for one timeframe
#[derive(Debug, Clone)]
pub struct CandleSeries {
    timeframe: Timeframe,
    closed: Vec<Candle>,
    in_progress: Option<Candle>,
}

impl CandleSeries {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            closed: Vec::new(),
            in_progress: None,
        }
    }

    /// Build a series from a history fetch (closed candles, optionally ending
    /// with the in-progress one)
    pub fn from_history(asset: &str, timeframe: Timeframe, mut candles: Vec<Candle>) -> Result<Self> {
        let in_progress = match candles.last() {
            Some(c) if !c.closed => candles.pop(),
            _ => None,
        };

        let mut series = Self::new(timeframe);
        series.ingest(
            asset,
            CandleUpdate {
                closed: candles,
                in_progress,
            },
        )?;
        Ok(series)
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn closed(&self) -> &[Candle] {
        &self.closed
    }

    pub fn last_closed(&self) -> Option<&Candle> {
        self.closed.last()
    }

    pub fn in_progress(&self) -> Option<&Candle> {
        self.in_progress.as_ref()
    }

    pub fn len(&self) -> usize {
        self.closed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
    }

    /// Apply a feed update. Everything is validated before anything is
    /// committed; on error the series is unchanged.
    ///
    /// Returns the candles that closed with this update, oldest first.
    pub fn ingest(&mut self, asset: &str, update: CandleUpdate) -> Result<Vec<Candle>> {
        let mut last_start = self.closed.last().map(|c| c.start_time);
        let mut staged: Vec<Candle> = Vec::new();

        for candle in update.closed {
            self.check_candle(asset, &candle, true)?;

            if let Some(last) = last_start {
                if candle.start_time <= last {
                    // Feeds may resend candles we already hold; they must not differ
                    let existing = self
                        .closed
                        .iter()
                        .chain(staged.iter())
                        .find(|c| c.start_time == candle.start_time);
                    match existing {
                        Some(c) if *c == candle => {
                            debug!("{} {}: ignoring repeated closed candle {}", asset, self.timeframe, candle.start_time);
                            continue;
                        }
                        Some(_) => {
                            return Err(TraderError::invariant(
                                asset,
                                format!(
                                    "{} closed candle at {} changed after close",
                                    self.timeframe, candle.start_time
                                ),
                            ));
                        }
                        None => {
                            return Err(TraderError::invariant(
                                asset,
                                format!(
                                    "{} closed candle at {} arrived out of order",
                                    self.timeframe, candle.start_time
                                ),
                            ));
                        }
                    }
                }
            }

            last_start = Some(candle.start_time);
            staged.push(candle);
        }

        let in_progress = match update.in_progress {
            Some(candle) => {
                self.check_candle(asset, &candle, false)?;
                if let Some(last) = last_start {
                    if candle.start_time <= last {
                        return Err(TraderError::invariant(
                            asset,
                            format!(
                                "{} in-progress candle at {} is not after last closed {}",
                                self.timeframe, candle.start_time, last
                            ),
                        ));
                    }
                }
                Some(candle)
            }
            // Keep the running candle unless it has since been closed
            None => self
                .in_progress
                .take()
                .filter(|c| last_start.map_or(true, |last| c.start_time > last)),
        };

        self.closed.extend(staged.iter().cloned());
        self.in_progress = in_progress;
        Ok(staged)
    }

    fn check_candle(&self, asset: &str, candle: &Candle, expect_closed: bool) -> Result<()> {
        if candle.timeframe != self.timeframe {
            return Err(TraderError::invariant(
                asset,
                format!("{} candle delivered to {} series", candle.timeframe, self.timeframe),
            ));
        }
        if candle.closed != expect_closed {
            return Err(TraderError::invariant(
                asset,
                format!(
                    "{} candle at {} has closed={} where closed={} was expected",
                    self.timeframe, candle.start_time, candle.closed, expect_closed
                ),
            ));
        }
        candle
            .validate()
            .map_err(|e| TraderError::invariant(asset, format!("{} {}", self.timeframe, e)))
    }
}

/// All candle series of a single asset
#[derive(Debug, Clone)]
pub struct CandleStore {
    asset: String,
    series: BTreeMap<Timeframe, CandleSeries>,
}

impl CandleStore {
    pub fn new(asset: &str, timeframes: &[Timeframe]) -> Self {
        Self {
            asset: asset.to_string(),
            series: timeframes
                .iter()
                .map(|tf| (*tf, CandleSeries::new(*tf)))
                .collect(),
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.series.keys().copied()
    }

    pub fn series(&self, timeframe: Timeframe) -> Option<&CandleSeries> {
        self.series.get(&timeframe)
    }

    /// Replace a series with freshly fetched history
    pub fn load_history(&mut self, timeframe: Timeframe, candles: Vec<Candle>) -> Result<()> {
        let series = CandleSeries::from_history(&self.asset, timeframe, candles)?;
        self.series.insert(timeframe, series);
        Ok(())
    }

    /// Apply one poll's updates across timeframes. All updates are checked
    /// against clones first so the store is unchanged if any of them fails.
    pub fn ingest(&mut self, updates: Vec<(Timeframe, CandleUpdate)>) -> Result<Vec<(Timeframe, Vec<Candle>)>> {
        let mut staged = Vec::with_capacity(updates.len());
        for (timeframe, update) in updates {
            let mut series = match self.series.get(&timeframe) {
                Some(s) => s.clone(),
                None => {
                    debug!("{}: ignoring update for unconfigured timeframe {}", self.asset, timeframe);
                    continue;
                }
            };
            let newly_closed = series.ingest(&self.asset, update)?;
            staged.push((timeframe, series, newly_closed));
        }

        let mut closed = Vec::with_capacity(staged.len());
        for (timeframe, series, newly_closed) in staged {
            self.series.insert(timeframe, series);
            closed.push((timeframe, newly_closed));
        }
        Ok(closed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn candle(tf: Timeframe, index: i64, o: f64, h: f64, l: f64, c: f64, closed: bool) -> Candle {
        Candle {
            open: Decimal::try_from(o).unwrap(),
            high: Decimal::try_from(h).unwrap(),
            low: Decimal::try_from(l).unwrap(),
            close: Decimal::try_from(c).unwrap(),
            volume: Decimal::from(10),
            start_time: Utc.timestamp_opt(1_700_000_000 + index * tf.to_seconds(), 0).unwrap(),
            timeframe: tf,
            closed,
        }
    }

    #[test]
    fn test_timeframe_parse_and_display() {
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert_eq!("1W".parse::<Timeframe>().unwrap(), Timeframe::W1);
        assert!("3h".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::D1.to_string(), "1d");
        assert_eq!(serde_json::to_string(&Timeframe::H12).unwrap(), "\"12h\"");
    }

    #[test]
    fn test_ingest_appends_and_reports_closed() {
        let tf = Timeframe::H1;
        let mut series = CandleSeries::new(tf);
        let closed = series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: Some(candle(tf, 1, 100.5, 100.8, 100.2, 100.6, false)),
                },
            )
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(series.len(), 1);
        assert!(series.in_progress().is_some());

        // Repeating the same closed candle is harmless
        let closed = series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: None,
                },
            )
            .unwrap();
        assert!(closed.is_empty());
        assert!(series.in_progress().is_some());
    }

    #[test]
    fn test_ingest_rejects_mutated_closed_candle() {
        let tf = Timeframe::H1;
        let mut series = CandleSeries::new(tf);
        series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: None,
                },
            )
            .unwrap();

        let err = series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 0, 100.0, 102.0, 99.0, 100.5, true)],
                    in_progress: None,
                },
            )
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(series.closed()[0].high, Decimal::from(101));
    }

    #[test]
    fn test_ingest_is_all_or_nothing() {
        let tf = Timeframe::H1;
        let mut series = CandleSeries::new(tf);
        let err = series.ingest(
            "BTC",
            CandleUpdate {
                closed: vec![
                    candle(tf, 0, 100.0, 101.0, 99.0, 100.5, true),
                    // high below low
                    candle(tf, 1, 100.0, 98.0, 99.0, 100.0, true),
                ],
                in_progress: None,
            },
        );
        assert!(err.is_err());
        assert!(series.is_empty());
    }

    #[test]
    fn test_in_progress_dropped_once_closed() {
        let tf = Timeframe::H1;
        let mut series = CandleSeries::new(tf);
        series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: Some(candle(tf, 1, 100.5, 100.8, 100.2, 100.6, false)),
                },
            )
            .unwrap();
        series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candle(tf, 1, 100.5, 101.2, 100.1, 101.0, true)],
                    in_progress: None,
                },
            )
            .unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.in_progress().is_none());
    }

    #[test]
    fn test_from_history_splits_in_progress() {
        let tf = Timeframe::H4;
        let series = CandleSeries::from_history(
            "ETH",
            tf,
            vec![
                candle(tf, 0, 10.0, 11.0, 9.0, 10.5, true),
                candle(tf, 1, 10.5, 11.5, 10.0, 11.0, true),
                candle(tf, 2, 11.0, 11.2, 10.8, 11.1, false),
            ],
        )
        .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.in_progress().unwrap().close, Decimal::try_from(11.1).unwrap());
    }

    #[test]
    fn test_store_ingest_unchanged_on_error() {
        let mut store = CandleStore::new("BTC", &[Timeframe::H1, Timeframe::H2]);
        let result = store.ingest(vec![
            (
                Timeframe::H1,
                CandleUpdate {
                    closed: vec![candle(Timeframe::H1, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: None,
                },
            ),
            (
                Timeframe::H2,
                CandleUpdate {
                    // wrong timeframe for this series
                    closed: vec![candle(Timeframe::H1, 0, 100.0, 101.0, 99.0, 100.5, true)],
                    in_progress: None,
                },
            ),
        ]);
        assert!(result.is_err());
        assert!(store.series(Timeframe::H1).unwrap().is_empty());
    }
}
