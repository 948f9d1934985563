//! Portfolio tracking - the account balance shared by all asset workers
//!
//! Every read-modify-write goes through one mutex. Buys reserve their cash
//! before submission so two assets entering at once cannot spend the same
//! balance twice.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::executor::Fill;

/// Units held of one asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub quantity: Decimal,
    /// Total paid including buy fees
    pub cost_basis: Decimal,
    pub last_price: Decimal,
}

#[derive(Debug)]
struct Balance {
    cash: Decimal,
    /// Cash set aside for submitted buys, by order id
    reservations: HashMap<Uuid, Decimal>,
    holdings: HashMap<String, Holding>,
    realized_pnl: Decimal,
    trade_count: u64,
    winning_trades: u64,
    fees_paid: Decimal,
}

impl Balance {
    fn reserved(&self) -> Decimal {
        self.reservations.values().copied().sum()
    }

    fn holdings_value(&self) -> Decimal {
        self.holdings.values().map(|h| h.quantity * h.last_price).sum()
    }
}

/// Account snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub reserved: Decimal,
    pub holdings: Vec<HoldingSnapshot>,
    pub total_equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub trade_count: u64,
    pub winning_trades: u64,
    pub fees_paid: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub asset: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Shared account balance
pub struct Account {
    /// Extra cash held back per reservation to cover the buy fee
    fee_buffer_rate: Decimal,
    inner: Mutex<Balance>,
}

impl Account {
    pub fn new(starting_cash: Decimal, fee_buffer_rate: Decimal) -> Self {
        info!("Account opened with {} cash", starting_cash);
        Self {
            fee_buffer_rate,
            inner: Mutex::new(Balance {
                cash: starting_cash,
                reservations: HashMap::new(),
                holdings: HashMap::new(),
                realized_pnl: Decimal::ZERO,
                trade_count: 0,
                winning_trades: 0,
                fees_paid: Decimal::ZERO,
            }),
        }
    }

    /// Cash + reserved + holdings marked at their latest price
    pub async fn portfolio_value(&self) -> Decimal {
        let balance = self.inner.lock().await;
        balance.cash + balance.reserved() + balance.holdings_value()
    }

    pub async fn cash(&self) -> Decimal {
        self.inner.lock().await.cash
    }

    pub async fn reserved(&self) -> Decimal {
        self.inner.lock().await.reserved()
    }

    /// Set aside cash for a buy. Fails without changing anything when the
    /// free cash does not cover it.
    pub async fn reserve(&self, order_id: Uuid, notional: Decimal) -> Result<Decimal, ExecutionError> {
        let amount = notional * (Decimal::ONE + self.fee_buffer_rate);
        let mut balance = self.inner.lock().await;
        if amount > balance.cash {
            return Err(ExecutionError::InsufficientFunds {
                needed: amount.round_dp(2).to_string(),
                available: balance.cash.round_dp(2).to_string(),
            });
        }
        balance.cash -= amount;
        balance.reservations.insert(order_id, amount);
        debug!("Reserved {} for order {}", amount.round_dp(2), order_id);
        Ok(amount)
    }

    /// Return a reservation to free cash (order failed or was cancelled)
    pub async fn release(&self, order_id: Uuid) -> Decimal {
        let mut balance = self.inner.lock().await;
        match balance.reservations.remove(&order_id) {
            Some(amount) => {
                balance.cash += amount;
                debug!("Released {} from order {}", amount.round_dp(2), order_id);
                amount
            }
            None => Decimal::ZERO,
        }
    }

    /// Book a buy fill against its reservation
    pub async fn settle_buy(&self, fill: &Fill) {
        let mut balance = self.inner.lock().await;
        let reserved = balance.reservations.remove(&fill.order_id).unwrap_or(Decimal::ZERO);
        let cost = fill.notional + fill.fee;
        balance.cash += reserved - cost;
        balance.fees_paid += fill.fee;

        let holding = balance.holdings.entry(fill.asset.clone()).or_insert(Holding {
            quantity: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            last_price: fill.price,
        });
        holding.quantity += fill.quantity;
        holding.cost_basis += cost;
        holding.last_price = fill.price;
    }

    /// Book a sell fill; returns realized P&L against `cost_basis` of the
    /// units sold
    pub async fn settle_sell(&self, fill: &Fill, cost_basis: Decimal) -> Decimal {
        let mut balance = self.inner.lock().await;
        let proceeds = fill.notional - fill.fee;
        let pnl = proceeds - cost_basis;

        balance.cash += proceeds;
        balance.fees_paid += fill.fee;
        balance.realized_pnl += pnl;
        balance.trade_count += 1;
        if pnl > Decimal::ZERO {
            balance.winning_trades += 1;
        }

        let emptied = match balance.holdings.get_mut(&fill.asset) {
            Some(holding) => {
                holding.quantity -= fill.quantity;
                holding.cost_basis -= cost_basis;
                holding.last_price = fill.price;
                holding.quantity <= Decimal::ZERO
            }
            None => false,
        };
        if emptied {
            balance.holdings.remove(&fill.asset);
        }

        info!("{} closed | Realized PnL: {}", fill.asset, pnl.round_dp(2));
        pnl
    }

    /// Update the mark price of a holding
    pub async fn mark(&self, asset: &str, price: Decimal) {
        if let Some(holding) = self.inner.lock().await.holdings.get_mut(asset) {
            holding.last_price = price;
        }
    }

    pub async fn snapshot(&self) -> AccountSnapshot {
        let balance = self.inner.lock().await;

        let mut holdings: Vec<HoldingSnapshot> = balance
            .holdings
            .iter()
            .map(|(asset, h)| {
                let market_value = h.quantity * h.last_price;
                let avg_cost = if h.quantity > Decimal::ZERO {
                    h.cost_basis / h.quantity
                } else {
                    Decimal::ZERO
                };
                HoldingSnapshot {
                    asset: asset.clone(),
                    quantity: h.quantity,
                    avg_cost,
                    current_price: h.last_price,
                    market_value,
                    unrealized_pnl: market_value - h.cost_basis,
                }
            })
            .collect();
        holdings.sort_by(|a, b| a.asset.cmp(&b.asset));

        let reserved = balance.reserved();
        let holdings_value = balance.holdings_value();
        AccountSnapshot {
            cash: balance.cash,
            reserved,
            unrealized_pnl: holdings.iter().map(|h| h.unrealized_pnl).sum(),
            holdings,
            total_equity: balance.cash + reserved + holdings_value,
            realized_pnl: balance.realized_pnl,
            trade_count: balance.trade_count,
            winning_trades: balance.winning_trades,
            fees_paid: balance.fees_paid,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Side;
    use std::sync::Arc;

    fn fill(order_id: Uuid, side: Side, quantity: i64, price: i64, fee: Decimal) -> Fill {
        Fill {
            order_id,
            asset: "BTC".to_string(),
            side,
            quantity: Decimal::from(quantity),
            price: Decimal::from(price),
            notional: Decimal::from(quantity * price),
            fee,
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_settle_buy() {
        let account = Account::new(Decimal::from(10_000), Decimal::new(1, 3));
        let id = Uuid::new_v4();
        let reserved = account.reserve(id, Decimal::from(1000)).await.unwrap();
        assert_eq!(reserved, Decimal::from(1001));
        assert_eq!(account.cash().await, Decimal::from(8999));
        // Reserved cash still counts toward portfolio value
        assert_eq!(account.portfolio_value().await, Decimal::from(10_000));

        account.settle_buy(&fill(id, Side::Buy, 10, 100, Decimal::ONE)).await;
        assert_eq!(account.cash().await, Decimal::from(8999));
        assert_eq!(account.reserved().await, Decimal::ZERO);
        assert_eq!(account.portfolio_value().await, Decimal::from(9999));
    }

    #[tokio::test]
    async fn test_reserve_fails_without_mutation() {
        let account = Account::new(Decimal::from(100), Decimal::ZERO);
        let err = account.reserve(Uuid::new_v4(), Decimal::from(150)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InsufficientFunds { .. }));
        assert_eq!(account.cash().await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_release_returns_cash() {
        let account = Account::new(Decimal::from(100), Decimal::ZERO);
        let id = Uuid::new_v4();
        account.reserve(id, Decimal::from(60)).await.unwrap();
        assert_eq!(account.release(id).await, Decimal::from(60));
        assert_eq!(account.cash().await, Decimal::from(100));
        assert_eq!(account.release(id).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_sell_realizes_pnl_and_counts_wins() {
        let account = Account::new(Decimal::from(1000), Decimal::ZERO);
        let buy_id = Uuid::new_v4();
        account.reserve(buy_id, Decimal::from(500)).await.unwrap();
        account.settle_buy(&fill(buy_id, Side::Buy, 5, 100, Decimal::ZERO)).await;

        account.mark("BTC", Decimal::from(110)).await;
        let snapshot = account.snapshot().await;
        assert_eq!(snapshot.holdings[0].unrealized_pnl, Decimal::from(50));

        let pnl = account
            .settle_sell(&fill(Uuid::new_v4(), Side::Sell, 5, 110, Decimal::ONE), Decimal::from(500))
            .await;
        assert_eq!(pnl, Decimal::from(49));

        let snapshot = account.snapshot().await;
        assert!(snapshot.holdings.is_empty());
        assert_eq!(snapshot.cash, Decimal::from(1049));
        assert_eq!(snapshot.trade_count, 1);
        assert_eq!(snapshot.winning_trades, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overcommit() {
        let account = Arc::new(Account::new(Decimal::from(1000), Decimal::ZERO));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                account.reserve(Uuid::new_v4(), Decimal::from(100)).await.is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(account.cash().await, Decimal::ZERO);
    }
}
