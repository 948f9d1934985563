//! Order execution collaborator - intents, fills and the paper executor

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PaperConfig;
use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order size: buys are sized in quote currency, sells in units held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Amount {
    Notional(Decimal),
    Quantity(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
}

/// What the state machine asks the executor to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub asset: String,
    pub side: Side,
    pub amount: Amount,
    pub order_type: OrderType,
    /// Price the decision was made at (ask for buys, bid for sells)
    pub reference_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn market(asset: &str, side: Side, amount: Amount, reference_price: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset: asset.to_string(),
            side,
            amount,
            order_type: OrderType::Market,
            reference_price,
            created_at: now,
        }
    }

    /// Quote-currency size the order is expected to move
    pub fn expected_notional(&self) -> Decimal {
        match self.amount {
            Amount::Notional(n) => n,
            Amount::Quantity(q) => q * self.reference_price,
        }
    }
}

/// Confirmed execution of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub asset: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// quantity x price, fee excluded
    pub notional: Decimal,
    pub fee: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Filled(Fill),
    /// Accepted, confirmation expected on a later poll
    Pending,
}

/// Accepts order intents and reports fills or errors
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderStatus, ExecutionError>;

    async fn poll(&self, order_id: Uuid) -> Result<OrderStatus, ExecutionError>;

    async fn cancel(&self, order_id: Uuid) -> Result<(), ExecutionError>;
}

struct PaperBook {
    rng: StdRng,
    /// Units held per asset, to reject oversells
    holdings: HashMap<String, Decimal>,
    pending: HashMap<Uuid, OrderIntent>,
}

/// Simulated exchange: market orders fill at the intent's reference price
/// with a proportional commission
pub struct PaperExecutor {
    commission_rate: Decimal,
    pending_probability: f64,
    book: Mutex<PaperBook>,
}

impl PaperExecutor {
    pub fn new(config: &PaperConfig) -> Self {
        Self {
            commission_rate: config.commission_rate,
            pending_probability: config.pending_probability,
            book: Mutex::new(PaperBook {
                rng: StdRng::seed_from_u64(config.seed),
                holdings: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    pub async fn holding(&self, asset: &str) -> Decimal {
        self.book
            .lock()
            .await
            .holdings
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn fill(&self, book: &mut PaperBook, intent: &OrderIntent) -> Result<Fill, ExecutionError> {
        let price = intent.reference_price;
        if price <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!("invalid price {}", price)));
        }

        let (quantity, notional) = match intent.amount {
            Amount::Notional(n) => (n / price, n),
            Amount::Quantity(q) => (q, q * price),
        };
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!("non-positive quantity {}", quantity)));
        }

        let held = book.holdings.entry(intent.asset.clone()).or_insert(Decimal::ZERO);
        match intent.side {
            Side::Buy => *held += quantity,
            Side::Sell => {
                if quantity > *held {
                    return Err(ExecutionError::Rejected(format!(
                        "sell of {} {} exceeds holding {}",
                        quantity, intent.asset, held
                    )));
                }
                *held -= quantity;
            }
        }

        let fee = (notional * self.commission_rate).round_dp(8);
        info!(
            "Paper {} {} {} @ {} (fee {})",
            intent.side,
            quantity.round_dp(8),
            intent.asset,
            price,
            fee
        );

        Ok(Fill {
            order_id: intent.id,
            asset: intent.asset.clone(),
            side: intent.side,
            quantity,
            price,
            notional,
            fee,
            time: Utc::now(),
        })
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderStatus, ExecutionError> {
        let mut book = self.book.lock().await;

        if self.pending_probability > 0.0 && book.rng.gen_bool(self.pending_probability) {
            debug!("Paper order {} left pending", intent.id);
            book.pending.insert(intent.id, intent.clone());
            return Ok(OrderStatus::Pending);
        }

        let fill = self.fill(&mut book, intent)?;
        Ok(OrderStatus::Filled(fill))
    }

    async fn poll(&self, order_id: Uuid) -> Result<OrderStatus, ExecutionError> {
        let mut book = self.book.lock().await;
        let intent = book
            .pending
            .remove(&order_id)
            .ok_or_else(|| ExecutionError::UnknownOrder(order_id.to_string()))?;
        let fill = self.fill(&mut book, &intent)?;
        Ok(OrderStatus::Filled(fill))
    }

    async fn cancel(&self, order_id: Uuid) -> Result<(), ExecutionError> {
        let mut book = self.book.lock().await;
        match book.pending.remove(&order_id) {
            Some(_) => Ok(()),
            None => {
                warn!("Cancel for unknown paper order {}", order_id);
                Err(ExecutionError::UnknownOrder(order_id.to_string()))
            }
        }
    }
}
