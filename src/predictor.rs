//! Predictor - weighted nearest-pattern estimate of the in-progress candle's range
//!
//! Inference combines every stored outcome with weight
//! `similarity(distance) x reliability`. When the predicted candle closes, the
//! instances that contributed are rewarded or penalized by how close their
//! own outcome came to what actually happened.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candle::{Candle, CandleSeries, Timeframe};
use crate::config::PredictorConfig;
use crate::error::{Result, TraderError};
use crate::levels::PredictedBounds;
use crate::memory::{feature_vector, InstanceId, Outcome, PatternMemory};

/// Similarity kernel: `1 / (1 + d / scale)` over the RMS distance `d`.
///
/// Strictly positive, 1.0 for identical vectors, strictly decreasing in
/// distance.
pub fn similarity(a: &[f64], b: &[f64], scale: f64) -> f64 {
    let dim = a.len().max(1) as f64;
    let sum_sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    let distance = (sum_sq / dim).sqrt();
    1.0 / (1.0 + distance / scale)
}

/// Prediction for one in-progress candle, kept until that candle closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timeframe: Timeframe,
    /// Start time of the candle being predicted
    pub target_start: DateTime<Utc>,
    /// Close of the last closed candle; outcomes are relative to it
    pub reference_price: f64,
    pub predicted_high: Decimal,
    pub predicted_low: Decimal,
    pub contributing_instance_ids: Vec<InstanceId>,
    /// Combining weight (similarity x reliability) of each contributor
    pub contributing_similarity_weights: Vec<f64>,
}

impl PredictionRecord {
    pub fn bounds(&self) -> PredictedBounds {
        PredictedBounds {
            timeframe: self.timeframe,
            predicted_high: self.predicted_high,
            predicted_low: self.predicted_low,
        }
    }
}

/// Summary of one reliability update
#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityUpdate {
    pub timeframe: Timeframe,
    pub candle_start: DateTime<Utc>,
    /// Mean absolute error of the combined prediction, percent of reference
    pub prediction_error_pct: f64,
    pub instances_adjusted: usize,
}

/// Per-(asset, timeframe) predictor owning its pattern memory
#[derive(Debug, Clone)]
pub struct Predictor {
    memory: PatternMemory,
    params: PredictorConfig,
    /// Record for the candle currently in progress
    pending: Option<PredictionRecord>,
}

impl Predictor {
    pub fn new(memory: PatternMemory, params: PredictorConfig) -> Self {
        Self {
            memory,
            params,
            pending: None,
        }
    }

    /// Train from the series' closed history
    pub fn train(asset: &str, series: &CandleSeries, params: PredictorConfig) -> Self {
        let memory = PatternMemory::train(asset, series.timeframe(), params.window_len, series.closed());
        Self::new(memory, params)
    }

    pub fn memory(&self) -> &PatternMemory {
        &self.memory
    }

    pub fn timeframe(&self) -> Timeframe {
        self.memory.timeframe()
    }

    pub fn pending(&self) -> Option<&PredictionRecord> {
        self.pending.as_ref()
    }

    /// Whether the series has enough history to predict at all
    pub fn check_history(&self, series: &CandleSeries) -> Result<()> {
        let need = self.params.window_len + 1;
        if series.len() < need || self.memory.is_empty() {
            return Err(TraderError::InsufficientHistory {
                asset: self.memory.asset().to_string(),
                timeframe: series.timeframe(),
                have: series.len(),
                need,
            });
        }
        Ok(())
    }

    /// Predict the range of the candle following the last closed one.
    ///
    /// Returns `None` when history is insufficient or no instance carries
    /// weight. The record is reused until the candle closes, since neither the
    /// window nor the weights change before then.
    pub fn predict(&mut self, series: &CandleSeries) -> Option<&PredictionRecord> {
        if let Err(e) = self.check_history(series) {
            debug!("{}", e);
            self.pending = None;
            return None;
        }

        let last = series.last_closed()?;
        let target_start = match series.in_progress() {
            Some(c) => c.start_time,
            None => last.start_time + series.timeframe().duration(),
        };

        let cached = self
            .pending
            .as_ref()
            .map_or(false, |r| r.target_start == target_start);
        if !cached {
            self.pending = self.infer(series.closed(), target_start);
        }
        self.pending.as_ref()
    }

    /// Run the kernel over the whole memory for the window ending at the last
    /// closed candle
    fn infer(&self, closed: &[Candle], target_start: DateTime<Utc>) -> Option<PredictionRecord> {
        let end = closed.len().checked_sub(1)?;
        let (query, reference) = feature_vector(closed, end, self.params.window_len)?;

        let mut contributors: Vec<(InstanceId, f64)> = self
            .memory
            .instances()
            .iter()
            .map(|inst| {
                let weight = similarity(&query, &inst.features, self.params.kernel_scale) * inst.reliability_weight;
                (inst.id, weight)
            })
            .filter(|(_, w)| *w >= self.params.min_combining_weight)
            .collect();

        if let Some(k) = self.params.max_neighbors {
            contributors.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            contributors.truncate(k);
        }

        let total: f64 = contributors.iter().map(|(_, w)| w).sum();
        if contributors.is_empty() || !(total > 0.0) {
            return None;
        }

        let mut high_pct = 0.0;
        let mut low_pct = 0.0;
        for (id, w) in &contributors {
            let outcome = self.memory.get(*id)?.outcome;
            high_pct += outcome.high_pct * w;
            low_pct += outcome.low_pct * w;
        }
        high_pct /= total;
        low_pct /= total;

        let predicted_high = Decimal::from_f64(reference * (1.0 + high_pct / 100.0))?.round_dp(8);
        let predicted_low = Decimal::from_f64(reference * (1.0 + low_pct / 100.0))?.round_dp(8);

        Some(PredictionRecord {
            timeframe: self.memory.timeframe(),
            target_start,
            reference_price: reference,
            predicted_high,
            predicted_low,
            contributing_instance_ids: contributors.iter().map(|(id, _)| *id).collect(),
            contributing_similarity_weights: contributors.iter().map(|(_, w)| *w).collect(),
        })
    }

    /// Feed candles that just closed (oldest first), then grow the memory
    /// from the updated series.
    ///
    /// The pending record is consumed by the candle it predicted; a record
    /// for any other candle is discarded untouched.
    pub fn on_candles_closed(&mut self, newly_closed: &[Candle], series: &CandleSeries) -> Result<Vec<ReliabilityUpdate>> {
        let mut updates = Vec::new();
        for candle in newly_closed {
            let record = match self.pending.take() {
                Some(r) if r.target_start == candle.start_time => r,
                Some(r) if r.target_start > candle.start_time => {
                    // Prediction is for a later candle; keep it
                    self.pending = Some(r);
                    continue;
                }
                Some(r) => {
                    debug!(
                        "{} {}: discarding stale prediction for {}",
                        self.memory.asset(),
                        self.memory.timeframe(),
                        r.target_start
                    );
                    continue;
                }
                None => continue,
            };
            updates.push(self.apply_reliability_update(&record, candle)?);
        }

        let added = self.memory.extend(series.closed());
        if added > 0 {
            debug!(
                "{} {}: memory grew by {} to {}",
                self.memory.asset(),
                self.memory.timeframe(),
                added,
                self.memory.len()
            );
        }
        Ok(updates)
    }

    /// Adjust the weights of the instances behind `record` against the
    /// closed candle. Only those instances are touched; every weight stays in
    /// `[min_weight, max_weight]`.
    pub fn apply_reliability_update(&mut self, record: &PredictionRecord, actual: &Candle) -> Result<ReliabilityUpdate> {
        let asset = self.memory.asset().to_string();
        let reference = record.reference_price;
        let actual_high = actual.high.to_f64().unwrap_or(f64::NAN);
        let actual_low = actual.low.to_f64().unwrap_or(f64::NAN);
        if !(reference > 0.0) || !actual_high.is_finite() || !actual_low.is_finite() {
            return Err(TraderError::invariant(
                &asset,
                format!("{} reliability update with unusable prices", record.timeframe),
            ));
        }

        let actual_outcome = Outcome {
            high_pct: (actual_high / reference - 1.0) * 100.0,
            low_pct: (actual_low / reference - 1.0) * 100.0,
        };

        // Resolve every id first so a bad record changes nothing
        for id in &record.contributing_instance_ids {
            if self.memory.get(*id).is_none() {
                return Err(TraderError::invariant(
                    &asset,
                    format!("{} prediction references unknown instance {}", record.timeframe, id),
                ));
            }
        }

        let tolerance = self.params.error_tolerance_pct;
        for id in &record.contributing_instance_ids {
            if let Some(instance) = self.memory.get_mut(*id) {
                let error = outcome_error(&instance.outcome, &actual_outcome);
                let score = (1.0 - error / tolerance).clamp(-1.0, 1.0);
                let updated = instance.reliability_weight * (1.0 + self.params.learning_rate * score);
                instance.reliability_weight = updated.clamp(self.params.min_weight, self.params.max_weight);
            }
        }

        let predicted = Outcome {
            high_pct: (record.predicted_high.to_f64().unwrap_or(reference) / reference - 1.0) * 100.0,
            low_pct: (record.predicted_low.to_f64().unwrap_or(reference) / reference - 1.0) * 100.0,
        };
        let prediction_error_pct = outcome_error(&predicted, &actual_outcome);
        if prediction_error_pct > tolerance * 5.0 {
            warn!(
                "{} {}: prediction for {} missed by {:.2}%",
                asset, record.timeframe, record.target_start, prediction_error_pct
            );
        }

        Ok(ReliabilityUpdate {
            timeframe: record.timeframe,
            candle_start: actual.start_time,
            prediction_error_pct,
            instances_adjusted: record.contributing_instance_ids.len(),
        })
    }
}

/// Mean absolute high/low error between two outcomes, in percent
fn outcome_error(a: &Outcome, b: &Outcome) -> f64 {
    ((a.high_pct - b.high_pct).abs() + (a.low_pct - b.low_pct).abs()) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::tests::candle;
    use crate::candle::CandleUpdate;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn params() -> PredictorConfig {
        PredictorConfig {
            window_len: 4,
            ..PredictorConfig::default()
        }
    }

    fn random_walk(n: i64, seed: u64) -> Vec<Candle> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price: f64 = 100.0;
        (0..n)
            .map(|i| {
                let open = price;
                let close = open * (1.0 + rng.gen_range(-0.02..0.02));
                let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
                let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
                price = close;
                candle(Timeframe::H1, i, open, high, low, close, true)
            })
            .collect()
    }

    fn series_from(candles: &[Candle]) -> CandleSeries {
        CandleSeries::from_history("BTC", Timeframe::H1, candles.to_vec()).unwrap()
    }

    #[test]
    fn test_similarity_kernel_properties() {
        let a = vec![0.0, 1.0, 2.0];
        assert_eq!(similarity(&a, &a, 1.0), 1.0);
        let near = similarity(&a, &[0.1, 1.1, 2.1], 1.0);
        let far = similarity(&a, &[5.0, 6.0, 7.0], 1.0);
        assert!(near > far);
        assert!(far > 0.0);
        assert!(similarity(&a, &[1e12, 1e12, 1e12], 1.0) > 0.0);
    }

    #[test]
    fn test_insufficient_history_is_absent() {
        let candles = random_walk(4, 1);
        let series = series_from(&candles);
        let mut predictor = Predictor::train("BTC", &series, params());
        match predictor.check_history(&series) {
            Err(TraderError::InsufficientHistory { have, need, .. }) => {
                assert_eq!(have, 4);
                assert_eq!(need, 5);
            }
            other => panic!("expected insufficient history, got {:?}", other),
        }
        assert!(predictor.predict(&series).is_none());

        // One more candle is enough for a single instance and a prediction
        let candles = random_walk(5, 1);
        let series = series_from(&candles);
        let mut predictor = Predictor::train("BTC", &series, params());
        assert!(predictor.check_history(&series).is_ok());
        assert!(predictor.predict(&series).is_some());
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let candles = random_walk(200, 7);
        let series = series_from(&candles);
        let mut a = Predictor::train("BTC", &series, params());
        let mut b = Predictor::train("BTC", &series, params());
        assert_eq!(a.memory().instances(), b.memory().instances());
        let ra = a.predict(&series).cloned().unwrap();
        let rb = b.predict(&series).cloned().unwrap();
        assert_eq!(ra, rb);
        assert!(ra.predicted_high >= ra.predicted_low);
        assert_eq!(ra.contributing_instance_ids.len(), ra.contributing_similarity_weights.len());
    }

    #[test]
    fn test_weighted_average_of_single_instance() {
        // Two identical windows: the only instance's outcome is the prediction
        let candles = random_walk(5, 3);
        let series = series_from(&candles);
        let mut predictor = Predictor::train("BTC", &series, params());
        assert_eq!(predictor.memory().len(), 1);
        let outcome = predictor.memory().instances()[0].outcome;
        let record = predictor.predict(&series).cloned().unwrap();
        let expected_high = record.reference_price * (1.0 + outcome.high_pct / 100.0);
        assert!((record.predicted_high.to_f64().unwrap() - expected_high).abs() < 1e-6);
    }

    #[test]
    fn test_max_neighbors_limits_contributors() {
        let candles = random_walk(120, 11);
        let series = series_from(&candles);
        let mut predictor = Predictor::train(
            "BTC",
            &series,
            PredictorConfig {
                max_neighbors: Some(5),
                ..params()
            },
        );
        let record = predictor.predict(&series).unwrap();
        assert_eq!(record.contributing_instance_ids.len(), 5);
        let w = &record.contributing_similarity_weights;
        assert!(w.windows(2).all(|p| p[0] >= p[1]));
    }

    #[test]
    fn test_record_consumed_once_and_weights_updated_locally() {
        let candles = random_walk(60, 5);
        let mut series = series_from(&candles[..50]);
        let mut predictor = Predictor::train(
            "BTC",
            &series,
            PredictorConfig {
                max_neighbors: Some(3),
                ..params()
            },
        );
        let record = predictor.predict(&series).cloned().unwrap();
        assert_eq!(record.target_start, candles[50].start_time);

        let before: Vec<f64> = predictor.memory().instances().iter().map(|i| i.reliability_weight).collect();
        let closed = series
            .ingest(
                "BTC",
                CandleUpdate {
                    closed: vec![candles[50].clone()],
                    in_progress: None,
                },
            )
            .unwrap();
        let updates = predictor.on_candles_closed(&closed, &series).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].instances_adjusted, 3);
        assert!(predictor.pending().is_none());

        for (i, w) in before.iter().enumerate() {
            let now = predictor.memory().instances()[i].reliability_weight;
            if !record.contributing_instance_ids.contains(&(i as u64)) {
                assert_eq!(*w, now, "instance {} was not a contributor", i);
            }
        }
        // One new instance from the closed candle
        assert_eq!(predictor.memory().len(), before.len() + 1);
    }

    #[test]
    fn test_weights_stay_clamped() {
        let candles = random_walk(300, 9);
        let p = PredictorConfig {
            learning_rate: 0.9,
            ..params()
        };
        let mut series = series_from(&candles[..40]);
        let mut predictor = Predictor::train("BTC", &series, p.clone());
        for candle in &candles[40..] {
            predictor.predict(&series);
            let closed = series
                .ingest(
                    "BTC",
                    CandleUpdate {
                        closed: vec![candle.clone()],
                        in_progress: None,
                    },
                )
                .unwrap();
            predictor.on_candles_closed(&closed, &series).unwrap();
        }
        for inst in predictor.memory().instances() {
            assert!(inst.reliability_weight >= p.min_weight);
            assert!(inst.reliability_weight <= p.max_weight);
        }
    }

    #[test]
    fn test_unknown_instance_is_invariant_violation() {
        let candles = random_walk(30, 2);
        let series = series_from(&candles);
        let mut predictor = Predictor::train("BTC", &series, params());
        let mut record = predictor.predict(&series).cloned().unwrap();
        record.contributing_instance_ids.push(10_000);
        let before: Vec<f64> = predictor.memory().instances().iter().map(|i| i.reliability_weight).collect();

        let err = predictor.apply_reliability_update(&record, &candles[29]).unwrap_err();
        assert!(err.is_invariant_violation());
        let after: Vec<f64> = predictor.memory().instances().iter().map(|i| i.reliability_weight).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_accurate_instance_gains_weight() {
        let candles = random_walk(30, 4);
        let series = series_from(&candles);
        let mut predictor = Predictor::train("BTC", &series, params());
        let record = predictor.predict(&series).cloned().unwrap();
        let id = record.contributing_instance_ids[0];
        let outcome = predictor.memory().get(id).unwrap().outcome;

        // A candle that landed exactly on this instance's outcome
        let reference = record.reference_price;
        let high = reference * (1.0 + outcome.high_pct / 100.0);
        let low = reference * (1.0 + outcome.low_pct / 100.0);
        let mut actual = candle(Timeframe::H1, 30, low, high, low, low, true);
        actual.high = Decimal::from_f64(high).unwrap();
        actual.low = Decimal::from_f64(low).unwrap();

        predictor.apply_reliability_update(&record, &actual).unwrap();
        assert!(predictor.memory().get(id).unwrap().reliability_weight > 1.0);
    }
}
