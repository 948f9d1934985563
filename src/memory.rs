//! Pattern memory - the instance library behind the predictor
//!
//! One memory exists per (asset, timeframe). Each instance pairs the shape of a
//! window of closed candles with what the following candle actually did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candle::{Candle, Timeframe};

/// Instance identifier; the insertion sequence number within one memory
pub type InstanceId = u64;

/// High/low of the candle after a pattern, in percent of the reference close
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub high_pct: f64,
    pub low_pct: f64,
}

/// One historical (context -> outcome) example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternInstance {
    pub id: InstanceId,
    pub features: Vec<f64>,
    pub outcome: Outcome,
    /// Starts at 1.0; only the reliability update changes it
    pub reliability_weight: f64,
    /// Start time of the last candle in the window
    pub window_end: DateTime<Utc>,
}

/// Feature vector for the window of `window` candles ending at `end`
/// (inclusive), plus the reference close it was normalized against.
///
/// Each candle contributes (open, high, low, close) as percent offsets from
/// the reference close.
pub fn feature_vector(candles: &[Candle], end: usize, window: usize) -> Option<(Vec<f64>, f64)> {
    if window == 0 || end >= candles.len() || end + 1 < window {
        return None;
    }

    let reference = candles[end].ohlc_f64()?[3];
    if reference <= 0.0 {
        return None;
    }

    let mut features = Vec::with_capacity(window * 4);
    for candle in &candles[end + 1 - window..=end] {
        for value in candle.ohlc_f64()? {
            features.push((value / reference - 1.0) * 100.0);
        }
    }
    Some((features, reference))
}

/// Outcome of the pattern ending at `index`: the next candle's high and low
/// relative to the close at `index`
pub fn outcome(candles: &[Candle], index: usize) -> Option<Outcome> {
    let reference = candles.get(index)?.ohlc_f64()?[3];
    let next = candles.get(index + 1)?.ohlc_f64()?;
    if reference <= 0.0 {
        return None;
    }
    Some(Outcome {
        high_pct: (next[1] / reference - 1.0) * 100.0,
        low_pct: (next[2] / reference - 1.0) * 100.0,
    })
}

/// Growing instance library for one (asset, timeframe)
#[derive(Debug, Clone)]
pub struct PatternMemory {
    asset: String,
    timeframe: Timeframe,
    window_len: usize,
    instances: Vec<PatternInstance>,
    /// Start time of the newest candle already used as an outcome
    trained_through: Option<DateTime<Utc>>,
}

impl PatternMemory {
    pub fn new(asset: &str, timeframe: Timeframe, window_len: usize) -> Self {
        Self {
            asset: asset.to_string(),
            timeframe,
            window_len,
            instances: Vec::new(),
            trained_through: None,
        }
    }

    /// Batch training over a full closed-candle history.
    ///
    /// Deterministic: the same history always yields the same ids, vectors,
    /// outcomes and weights.
    pub fn train(asset: &str, timeframe: Timeframe, window_len: usize, closed: &[Candle]) -> Self {
        let mut memory = Self::new(asset, timeframe, window_len);
        let added = memory.extend(closed);
        debug!(
            "Trained {} {} memory: {} instances from {} candles",
            asset,
            timeframe,
            added,
            closed.len()
        );
        memory
    }

    /// Add every instance whose outcome candle is newer than what the memory
    /// has already seen. Returns the number of instances added.
    pub fn extend(&mut self, closed: &[Candle]) -> usize {
        if self.window_len == 0 || closed.len() < self.window_len + 1 {
            return 0;
        }

        let mut added = 0;
        for index in (self.window_len - 1)..(closed.len() - 1) {
            let outcome_start = closed[index + 1].start_time;
            if self.trained_through.map_or(false, |t| outcome_start <= t) {
                continue;
            }

            let (features, outcome) = match (
                feature_vector(closed, index, self.window_len),
                outcome(closed, index),
            ) {
                (Some((features, _)), Some(outcome)) => (features, outcome),
                _ => continue,
            };

            let id = self.instances.len() as InstanceId;
            self.instances.push(PatternInstance {
                id,
                features,
                outcome,
                reliability_weight: 1.0,
                window_end: closed[index].start_time,
            });
            self.trained_through = Some(outcome_start);
            added += 1;
        }
        added
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn instances(&self) -> &[PatternInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<&PatternInstance> {
        usize::try_from(id).ok().and_then(|i| self.instances.get(i))
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut PatternInstance> {
        usize::try_from(id).ok().and_then(move |i| self.instances.get_mut(i))
    }

    pub fn trained_through(&self) -> Option<DateTime<Utc>> {
        self.trained_through
    }
}
