//! Trading state machine - entry, DCA and trailing exit for one asset
//!
//! `evaluate` decides and returns at most one order request; the position is
//! only changed by money-moving transitions in `apply_fill`. A failed order
//! leaves everything where it was, so the same condition is simply seen
//! again on the next cycle.
//!
//! There is no stop-loss: a position that never reaches its profit margin
//! stays open.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StrategyConfig;
use crate::error::{ExecutionError, Result, TraderError};
use crate::executor::{Amount, Fill, OrderIntent, Side};
use crate::feed::Quote;
use crate::levels::{low_ladder, PredictedBounds, PriceSide, SignalLevels};
use crate::position::{dca_window, Position, PositionState};

/// Which DCA predicate fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaTrigger {
    /// LONG level above the levels already consumed
    Level,
    /// Ask fell through the configured drawdown tier
    Drawdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum OrderAction {
    Enter { long_level: u32 },
    Dca { number: u32, trigger: DcaTrigger, consumed_level: u32 },
    Exit,
}

/// Order the state machine wants executed, with the transition it stands for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub action: OrderAction,
    pub intent: OrderIntent,
}

/// A finished round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub asset: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub avg_cost: Decimal,
    pub quantity: Decimal,
    pub dca_count: u32,
    pub cost_basis: Decimal,
    pub proceeds: Decimal,
    pub exit_fee: Decimal,
    pub realized_pnl: Decimal,
}

/// Prices at which the next DCA would fire, for charting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaOutlook {
    pub next_level_price: Option<Decimal>,
    pub next_drawdown_price: Option<Decimal>,
    pub dca_in_window: usize,
    pub dca_allowed: bool,
}

pub struct TradingStateMachine {
    asset: String,
    config: StrategyConfig,
    position: Option<Position>,
    /// DCA buys of this asset inside the rolling window, across positions
    dca_history: Vec<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl TradingStateMachine {
    pub fn new(asset: &str, config: StrategyConfig) -> Self {
        Self {
            asset: asset.to_string(),
            config,
            position: None,
            dca_history: Vec::new(),
            consecutive_failures: 0,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn short_price_side(&self) -> PriceSide {
        self.config.short_price_side
    }

    /// DCA buys counted toward the 24h limit at `now`
    pub fn recent_dca_count(&self, now: DateTime<Utc>) -> usize {
        self.dca_history.iter().filter(|ts| now - **ts < dca_window()).count()
    }

    fn gap_factor(&self) -> Decimal {
        Decimal::ONE - self.config.trailing_gap_pct / Decimal::ONE_HUNDRED
    }

    /// Decide what to do this cycle.
    ///
    /// Checked in order: entry when flat; ratchet or exit while trailing;
    /// start trailing once the margin is exceeded; otherwise DCA.
    pub fn evaluate(
        &mut self,
        quote: &Quote,
        levels: &SignalLevels,
        portfolio_value: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderRequest>> {
        self.dca_history.retain(|ts| now - *ts < dca_window());
        if self.position.is_none() {
            return Ok(self.evaluate_entry(quote, levels, portfolio_value, now));
        }

        let gap_factor = self.gap_factor();
        let asset = self.asset.clone();
        let (margin_no_dca, margin_with_dca) = (
            self.config.profit_margin_no_dca_pct,
            self.config.profit_margin_with_dca_pct,
        );
        let position = match self.position.as_mut() {
            Some(p) => p,
            None => return Ok(None),
        };
        position.prune_dca_log(now)?;

        let bid = quote.bid;
        if position.state == PositionState::Trailing {
            let trigger = match (position.peak_price, position.trailing_trigger_price) {
                (Some(peak), Some(trigger)) => {
                    let mut trigger = trigger;
                    if bid > peak {
                        position.peak_price = Some(bid);
                        trigger = trigger.max(bid * gap_factor);
                        if Some(trigger) != position.trailing_trigger_price {
                            debug!("{} trailing trigger raised to {}", asset, trigger);
                        }
                        position.trailing_trigger_price = Some(trigger);
                    }
                    trigger
                }
                _ => {
                    return Err(TraderError::invariant(&asset, "trailing position without peak or trigger"));
                }
            };

            if bid <= trigger {
                info!("{} bid {} hit trailing trigger {}, exiting", asset, bid, trigger);
                let intent = OrderIntent::market(&asset, Side::Sell, Amount::Quantity(position.quantity), bid, now);
                return Ok(Some(OrderRequest {
                    action: OrderAction::Exit,
                    intent,
                }));
            }
            return Ok(None);
        }

        let margin = if position.dca_count == 0 {
            margin_no_dca
        } else {
            margin_with_dca
        };
        let gain = position
            .gain_pct(bid)
            .ok_or_else(|| TraderError::invariant(&asset, "open position with zero quantity"))?;
        if gain > margin {
            let trigger = bid * gap_factor;
            info!(
                "{} {} -> Trailing: gain {}% over {}% margin, trigger {}",
                asset,
                position.state,
                gain.round_dp(3),
                margin,
                trigger
            );
            position.state = PositionState::Trailing;
            position.peak_price = Some(bid);
            position.trailing_trigger_price = Some(trigger);
            return Ok(None);
        }

        Ok(self.evaluate_dca(quote, levels, now))
    }

    fn evaluate_entry(
        &self,
        quote: &Quote,
        levels: &SignalLevels,
        portfolio_value: Decimal,
        now: DateTime<Utc>,
    ) -> Option<OrderRequest> {
        if levels.long_level < self.config.entry_threshold || levels.short_level > self.config.short_veto_threshold {
            return None;
        }

        let notional = (portfolio_value * self.config.start_allocation_fraction).round_dp(8);
        if notional <= Decimal::ZERO {
            warn!("{} entry signal but portfolio value is {}", self.asset, portfolio_value);
            return None;
        }

        info!(
            "{} entry signal: LONG {} SHORT {} at ask {}, buying {}",
            self.asset, levels.long_level, levels.short_level, quote.ask, notional
        );
        Some(OrderRequest {
            action: OrderAction::Enter {
                long_level: levels.long_level,
            },
            intent: OrderIntent::market(&self.asset, Side::Buy, Amount::Notional(notional), quote.ask, now),
        })
    }

    /// Two independent predicates; whichever is true first fires
    fn evaluate_dca(&self, quote: &Quote, levels: &SignalLevels, now: DateTime<Utc>) -> Option<OrderRequest> {
        let position = self.position.as_ref()?;

        let in_window = self.recent_dca_count(now).max(position.recent_dca_count(now));
        if in_window >= self.config.max_dca_per_24h {
            return None;
        }

        let level_hit = self.level_predicate(position, levels);
        let drawdown_hit = self.drawdown_predicate(position, quote.ask);
        let trigger = match (level_hit, drawdown_hit) {
            (true, _) => DcaTrigger::Level,
            (false, true) => DcaTrigger::Drawdown,
            (false, false) => return None,
        };

        let consumed_level = if trigger == DcaTrigger::Level && self.config.dca_level_skipping {
            levels.long_level
        } else {
            position.consumed_level + 1
        };
        let number = position.dca_count + 1;
        let notional = (position.last_buy_notional * self.config.dca_multiplier).round_dp(8);

        info!(
            "{} DCA {} signal ({:?}): LONG {} consumed {} ask {}, buying {}",
            self.asset, number, trigger, levels.long_level, position.consumed_level, quote.ask, notional
        );
        Some(OrderRequest {
            action: OrderAction::Dca {
                number,
                trigger,
                consumed_level,
            },
            intent: OrderIntent::market(&self.asset, Side::Buy, Amount::Notional(notional), quote.ask, now),
        })
    }

    fn level_predicate(&self, position: &Position, levels: &SignalLevels) -> bool {
        levels.long_level > position.consumed_level
    }

    /// False once the configured tiers are used up
    fn drawdown_predicate(&self, position: &Position, ask: Decimal) -> bool {
        match self.config.dca_drawdown_tiers_pct.get(position.dca_count as usize) {
            Some(tier) => ask <= self.drawdown_price(position.entry_price, *tier),
            None => false,
        }
    }

    fn drawdown_price(&self, entry_price: Decimal, tier_pct: Decimal) -> Decimal {
        entry_price * (Decimal::ONE - tier_pct / Decimal::ONE_HUNDRED)
    }

    /// Prices of the next level-based and drawdown-based DCA triggers
    pub fn dca_outlook(&self, bounds: &[PredictedBounds], now: DateTime<Utc>) -> Option<DcaOutlook> {
        let position = self.position.as_ref()?;
        if position.state == PositionState::Trailing {
            return None;
        }
        let ladder = low_ladder(bounds);
        let dca_in_window = self.recent_dca_count(now);
        Some(DcaOutlook {
            next_level_price: ladder.get(position.consumed_level as usize).copied(),
            next_drawdown_price: self
                .config
                .dca_drawdown_tiers_pct
                .get(position.dca_count as usize)
                .map(|tier| self.drawdown_price(position.entry_price, *tier)),
            dca_in_window,
            dca_allowed: dca_in_window < self.config.max_dca_per_24h,
        })
    }

    /// Reject fills that do not cover the request; they count as failures
    pub fn check_fill(&self, request: &OrderRequest, fill: &Fill) -> std::result::Result<(), ExecutionError> {
        let short = match request.intent.amount {
            Amount::Notional(n) => fill.notional < n,
            Amount::Quantity(q) => fill.quantity < q,
        };
        if short || fill.side != request.intent.side || fill.quantity <= Decimal::ZERO {
            let requested = match request.intent.amount {
                Amount::Notional(n) => n,
                Amount::Quantity(q) => q,
            };
            return Err(ExecutionError::PartialFill {
                filled: fill.quantity.to_string(),
                requested: requested.to_string(),
            });
        }
        Ok(())
    }

    /// Apply the transition a confirmed fill stands for. Returns the closed
    /// trade when the fill was an exit.
    pub fn apply_fill(&mut self, request: &OrderRequest, fill: &Fill, now: DateTime<Utc>) -> Result<Option<ClosedTrade>> {
        let cost = fill.notional + fill.fee;

        let closed = match request.action {
            OrderAction::Enter { long_level } => {
                if self.position.is_some() {
                    return Err(TraderError::invariant(&self.asset, "entry fill while a position is open"));
                }
                self.position = Some(Position {
                    asset: self.asset.clone(),
                    state: PositionState::Entered,
                    entry_price: request.intent.reference_price,
                    entry_time: now,
                    dca_count: 0,
                    dca_timestamps: Vec::new(),
                    allocation_fraction: self.config.start_allocation_fraction,
                    trailing_trigger_price: None,
                    peak_price: None,
                    quantity: fill.quantity,
                    cost_basis: cost,
                    last_buy_notional: fill.notional,
                    consumed_level: long_level,
                });
                info!(
                    "{} Idle -> Entered: {} @ {} (LONG {})",
                    self.asset,
                    fill.quantity.round_dp(8),
                    request.intent.reference_price,
                    long_level
                );
                None
            }
            OrderAction::Dca {
                number,
                consumed_level,
                trigger,
            } => {
                let asset = self.asset.clone();
                let position = self
                    .position
                    .as_mut()
                    .ok_or_else(|| TraderError::invariant(&asset, "DCA fill without an open position"))?;
                if position.state == PositionState::Trailing || position.dca_count + 1 != number {
                    return Err(TraderError::invariant(
                        &asset,
                        format!("DCA {} fill does not follow {}", number, position.state),
                    ));
                }
                let from = position.state;
                position.dca_count = number;
                position.dca_timestamps.push(now);
                self.dca_history.push(now);
                position.state = PositionState::Dca(number);
                position.quantity += fill.quantity;
                position.cost_basis += cost;
                position.last_buy_notional = fill.notional;
                position.consumed_level = consumed_level;
                info!(
                    "{} {} -> {} ({:?}): +{} @ {}, avg cost {}",
                    asset,
                    from,
                    position.state,
                    trigger,
                    fill.quantity.round_dp(8),
                    fill.price,
                    position.avg_cost().unwrap_or_default().round_dp(8)
                );
                None
            }
            OrderAction::Exit => {
                let position = self
                    .position
                    .take()
                    .ok_or_else(|| TraderError::invariant(&self.asset, "exit fill without an open position"))?;
                let realized_pnl = fill.notional - fill.fee - position.cost_basis;
                info!(
                    "{} Trailing -> Closed: sold {} @ {}, realized {}",
                    self.asset,
                    fill.quantity.round_dp(8),
                    fill.price,
                    realized_pnl.round_dp(2)
                );
                Some(ClosedTrade {
                    asset: self.asset.clone(),
                    entry_time: position.entry_time,
                    exit_time: now,
                    entry_price: position.entry_price,
                    exit_price: fill.price,
                    avg_cost: position.avg_cost().unwrap_or_default(),
                    quantity: fill.quantity,
                    dca_count: position.dca_count,
                    cost_basis: position.cost_basis,
                    proceeds: fill.notional,
                    exit_fee: fill.fee,
                    realized_pnl,
                })
            }
        };

        self.consecutive_failures = 0;
        Ok(closed)
    }

    /// Record a failed order. Nothing else changes; returns the number of
    /// failures in a row.
    pub fn apply_failure(&mut self, request: &OrderRequest, error: &ExecutionError) -> u32 {
        self.consecutive_failures += 1;
        warn!(
            "{} {:?} order failed ({} in a row): {}",
            self.asset, request.action, self.consecutive_failures, error
        );
        self.consecutive_failures
    }
}
