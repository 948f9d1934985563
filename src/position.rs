//! Open position of one asset and its DCA rolling log

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TraderError};

/// Lifecycle stage of an open position. Idle and Closed are represented by
/// the absence of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "dca")]
pub enum PositionState {
    Entered,
    Dca(u32),
    Trailing,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionState::Entered => write!(f, "Entered"),
            PositionState::Dca(n) => write!(f, "Dca{}", n),
            PositionState::Trailing => write!(f, "Trailing"),
        }
    }
}

/// Window over which DCA buys are rate limited
pub fn dca_window() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub state: PositionState,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub dca_count: u32,
    /// Times of DCA buys still inside the rolling window
    pub dca_timestamps: Vec<DateTime<Utc>>,
    /// Share of portfolio value spent on the initial buy
    pub allocation_fraction: Decimal,
    pub trailing_trigger_price: Option<Decimal>,
    /// Best bid seen since trailing started
    pub peak_price: Option<Decimal>,
    pub quantity: Decimal,
    /// Total paid for the units held, fees included
    pub cost_basis: Decimal,
    pub last_buy_notional: Decimal,
    /// LONG levels already used by the entry and previous DCAs
    pub consumed_level: u32,
}

impl Position {
    /// Volume-weighted average cost per unit, fees included
    pub fn avg_cost(&self) -> Option<Decimal> {
        if self.quantity > Decimal::ZERO {
            Some(self.cost_basis / self.quantity)
        } else {
            None
        }
    }

    /// Gain of `price` over the average cost, in percent
    pub fn gain_pct(&self, price: Decimal) -> Option<Decimal> {
        let avg = self.avg_cost()?;
        Some((price / avg - Decimal::ONE) * Decimal::ONE_HUNDRED)
    }

    /// Drop DCA timestamps that have aged out of the window, then check the
    /// log against the counter.
    pub fn prune_dca_log(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.dca_timestamps.retain(|ts| now - *ts < dca_window());
        self.check_dca_log(now)
    }

    /// DCA buys counted toward the limit at `now`
    pub fn recent_dca_count(&self, now: DateTime<Utc>) -> usize {
        self.dca_timestamps
            .iter()
            .filter(|ts| now - **ts < dca_window())
            .count()
    }

    fn check_dca_log(&self, now: DateTime<Utc>) -> Result<()> {
        if self.dca_timestamps.len() > self.dca_count as usize {
            return Err(TraderError::invariant(
                &self.asset,
                format!(
                    "{} DCA timestamps in window but dca_count is {}",
                    self.dca_timestamps.len(),
                    self.dca_count
                ),
            ));
        }
        if let Some(ts) = self.dca_timestamps.iter().find(|ts| **ts > now) {
            return Err(TraderError::invariant(
                &self.asset,
                format!("DCA timestamp {} is in the future", ts),
            ));
        }
        if !self.dca_timestamps.windows(2).all(|w| w[0] <= w[1]) {
            return Err(TraderError::invariant(&self.asset, "DCA timestamps out of order"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position() -> Position {
        Position {
            asset: "BTC".to_string(),
            state: PositionState::Entered,
            entry_price: Decimal::from(100),
            entry_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            dca_count: 0,
            dca_timestamps: Vec::new(),
            allocation_fraction: Decimal::new(5, 3),
            trailing_trigger_price: None,
            peak_price: None,
            quantity: Decimal::from(2),
            cost_basis: Decimal::from(210),
            last_buy_notional: Decimal::from(210),
            consumed_level: 3,
        }
    }

    #[test]
    fn test_avg_cost_and_gain() {
        let p = position();
        assert_eq!(p.avg_cost(), Some(Decimal::from(105)));
        assert_eq!(p.gain_pct(Decimal::new(11025, 2)), Some(Decimal::from(5)));
    }

    #[test]
    fn test_prune_drops_only_aged_entries() {
        let mut p = position();
        let t0 = p.entry_time;
        p.dca_count = 2;
        p.dca_timestamps = vec![t0, t0 + Duration::hours(10)];

        p.prune_dca_log(t0 + Duration::hours(23)).unwrap();
        assert_eq!(p.dca_timestamps.len(), 2);
        // Exactly 24h old no longer counts
        p.prune_dca_log(t0 + Duration::hours(24)).unwrap();
        assert_eq!(p.dca_timestamps.len(), 1);
        assert_eq!(p.recent_dca_count(t0 + Duration::hours(34)), 0);
    }

    #[test]
    fn test_inconsistent_log_is_invariant_violation() {
        let mut p = position();
        let t0 = p.entry_time;
        p.dca_count = 1;
        p.dca_timestamps = vec![t0, t0 + Duration::hours(1)];
        assert!(p.prune_dca_log(t0 + Duration::hours(2)).unwrap_err().is_invariant_violation());

        let mut p = position();
        p.dca_count = 1;
        p.dca_timestamps = vec![t0 + Duration::hours(5)];
        assert!(p.prune_dca_log(t0).unwrap_err().is_invariant_violation());
    }
}
