//! Level aggregation - turns per-timeframe predicted bounds into LONG/SHORT levels
//!
//! Pure functions of the current price and the current prediction set; nothing
//! here keeps state between cycles.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::candle::Timeframe;
use crate::feed::Quote;

/// Price used for SHORT evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSide {
    #[default]
    Bid,
    Last,
}

impl PriceSide {
    pub fn price(&self, quote: &Quote) -> Decimal {
        match self {
            PriceSide::Bid => quote.bid,
            PriceSide::Last => quote.last,
        }
    }
}

/// Predicted bounds of one timeframe's in-progress candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedBounds {
    pub timeframe: Timeframe,
    pub predicted_high: Decimal,
    pub predicted_low: Decimal,
}

/// Signal levels of one asset for the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalLevels {
    pub asset: String,
    /// Predicted lows the ask has fallen below
    pub long_level: u32,
    /// Predicted highs the price has risen above
    pub short_level: u32,
    /// Timeframes that had a prediction this cycle (the reachable maximum)
    pub available_timeframes: u32,
}

impl SignalLevels {
    pub fn none(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            long_level: 0,
            short_level: 0,
            available_timeframes: 0,
        }
    }
}

/// Count crossed bounds. Timeframes without a prediction are simply absent
/// from `bounds`, so they count toward neither level.
pub fn compute_levels(
    asset: &str,
    long_price: Decimal,
    short_price: Decimal,
    bounds: &[PredictedBounds],
) -> SignalLevels {
    let long_level = bounds.iter().filter(|b| b.predicted_low > long_price).count();
    let short_level = bounds.iter().filter(|b| b.predicted_high < short_price).count();

    SignalLevels {
        asset: asset.to_string(),
        long_level: long_level as u32,
        short_level: short_level as u32,
        available_timeframes: bounds.len() as u32,
    }
}

/// Levels for a live quote: ask for LONG, the configured side for SHORT
pub fn levels_for_quote(asset: &str, quote: &Quote, short_side: PriceSide, bounds: &[PredictedBounds]) -> SignalLevels {
    compute_levels(asset, quote.ask, short_side.price(quote), bounds)
}

/// Predicted lows ordered from highest to lowest: the price crosses them in
/// this order as it falls, so entry n of the ladder is LONG level n + 1
pub fn low_ladder(bounds: &[PredictedBounds]) -> Vec<Decimal> {
    let mut lows: Vec<Decimal> = bounds.iter().map(|b| b.predicted_low).collect();
    lows.sort_by(|a, b| b.cmp(a));
    lows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bounds(pairs: &[(f64, f64)]) -> Vec<PredictedBounds> {
        pairs
            .iter()
            .zip(Timeframe::ALL.iter())
            .map(|((low, high), tf)| PredictedBounds {
                timeframe: *tf,
                predicted_high: Decimal::try_from(*high).unwrap(),
                predicted_low: Decimal::try_from(*low).unwrap(),
            })
            .collect()
    }

    fn default_bounds() -> Vec<PredictedBounds> {
        bounds(&[
            (99.0, 101.0),
            (98.0, 102.0),
            (97.0, 103.0),
            (96.0, 104.0),
            (95.0, 105.0),
            (94.0, 106.0),
            (93.0, 107.0),
        ])
    }

    #[test]
    fn test_counts_strict_crossings() {
        let b = default_bounds();
        let levels = compute_levels("BTC", Decimal::from(97), Decimal::from(97), &b);
        // 99 and 98 are strictly above 97; 97 itself is not
        assert_eq!(levels.long_level, 2);
        assert_eq!(levels.short_level, 0);
        assert_eq!(levels.available_timeframes, 7);

        let levels = compute_levels("BTC", Decimal::from(104), Decimal::from(104), &b);
        assert_eq!(levels.long_level, 0);
        assert_eq!(levels.short_level, 3);
    }

    #[test]
    fn test_missing_timeframes_lower_the_maximum() {
        let b = bounds(&[(99.0, 101.0), (98.0, 102.0)]);
        let levels = compute_levels("BTC", Decimal::from(50), Decimal::from(50), &b);
        assert_eq!(levels.long_level, 2);
        assert_eq!(levels.available_timeframes, 2);

        let empty = compute_levels("BTC", Decimal::from(50), Decimal::from(50), &[]);
        assert_eq!(empty, SignalLevels::none("BTC"));
    }

    #[test]
    fn test_levels_monotonic_in_price() {
        let b = default_bounds();
        let mut last_long = 0;
        let mut last_short = u32::MAX;
        // Walk price downward: LONG never decreases, SHORT never increases
        for step in 0..200 {
            let price = Decimal::from(110) - Decimal::new(step, 1);
            let levels = compute_levels("BTC", price, price, &b);
            assert!(levels.long_level >= last_long);
            assert!(levels.short_level <= last_short);
            last_long = levels.long_level;
            last_short = levels.short_level;
        }
        assert_eq!(last_long, 7);
        assert_eq!(last_short, 0);
    }

    #[test]
    fn test_quote_sides() {
        let b = default_bounds();
        let quote = Quote {
            bid: Decimal::from(101),
            ask: Decimal::from(102),
            last: Decimal::from(103),
            time: Utc::now(),
        };
        let bid = levels_for_quote("BTC", &quote, PriceSide::Bid, &b);
        let last = levels_for_quote("BTC", &quote, PriceSide::Last, &b);
        assert_eq!(bid.short_level, 0);
        assert_eq!(last.short_level, 2);
    }

    #[test]
    fn test_low_ladder_descending() {
        let b = bounds(&[(95.0, 101.0), (99.0, 102.0), (97.0, 103.0)]);
        assert_eq!(
            low_ladder(&b),
            vec![Decimal::from(99), Decimal::from(97), Decimal::from(95)]
        );
    }
}
