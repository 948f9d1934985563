//! Runner - per-asset polling workers and the loop that drives them
//!
//! One cycle for one asset: poll the feed, ingest candles, update reliability
//! for candles that closed, predict, compute levels, settle any pending
//! order, evaluate, submit. Workers never share anything but the account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::candle::{CandleStore, Timeframe};
use crate::config::{PredictorConfig, RunnerConfig, TraderConfig};
use crate::error::{ExecutionError, FeedError, Result, TraderError};
use crate::executor::{Fill, OrderExecutor, OrderStatus, Side};
use crate::feed::{MarketFeed, Quote};
use crate::intent::{IntentRegistry, IntentState};
use crate::levels::{levels_for_quote, PredictedBounds, SignalLevels};
use crate::memory::PatternMemory;
use crate::portfolio::Account;
use crate::predictor::Predictor;
use crate::state::{AssetSnapshot, NowState, PredictionLine, StateManager};
use crate::strategy::{ClosedTrade, OrderRequest, TradingStateMachine};

/// Collaborators shared by every worker
#[derive(Clone)]
pub struct TradingContext {
    pub feed: Arc<dyn MarketFeed>,
    pub executor: Arc<dyn OrderExecutor>,
    pub account: Arc<Account>,
}

/// Result of one worker cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub snapshot: AssetSnapshot,
    pub closed_trade: Option<ClosedTrade>,
}

/// Everything private to one asset
pub struct AssetWorker {
    asset: String,
    timeframes: Vec<Timeframe>,
    predictor_config: PredictorConfig,
    runner_config: RunnerConfig,
    store: CandleStore,
    predictors: BTreeMap<Timeframe, Predictor>,
    machine: TradingStateMachine,
    intents: IntentRegistry,
    halted: Option<String>,
    last_quote: Option<Quote>,
    last_levels: SignalLevels,
    last_predictions: Vec<PredictionLine>,
    last_bounds: Vec<PredictedBounds>,
}

impl AssetWorker {
    pub fn new(asset: &str, config: &TraderConfig) -> Self {
        let store = CandleStore::new(asset, &config.timeframes);
        let predictors = config
            .timeframes
            .iter()
            .map(|tf| {
                let memory = PatternMemory::new(asset, *tf, config.predictor.window_len);
                (*tf, Predictor::new(memory, config.predictor.clone()))
            })
            .collect();

        Self {
            asset: asset.to_string(),
            timeframes: config.timeframes.clone(),
            predictor_config: config.predictor.clone(),
            runner_config: config.runner.clone(),
            store,
            predictors,
            machine: TradingStateMachine::new(asset, config.strategy.clone()),
            intents: IntentRegistry::new(config.runner.pending_order_max_cycles),
            halted: None,
            last_quote: None,
            last_levels: SignalLevels::none(asset),
            last_predictions: Vec::new(),
            last_bounds: Vec::new(),
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn machine(&self) -> &TradingStateMachine {
        &self.machine
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    pub fn predictor(&self, timeframe: Timeframe) -> Option<&Predictor> {
        self.predictors.get(&timeframe)
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Clear a halt after the cause has been dealt with
    pub fn reset(&mut self) {
        if let Some(reason) = self.halted.take() {
            info!("{} reset after halt: {}", self.asset, reason);
        }
    }

    fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_config.feed_timeout_secs)
    }

    fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_config.order_timeout_secs)
    }

    /// Fetch history for every timeframe and train the predictors.
    ///
    /// A timeframe whose history cannot be fetched starts empty and builds
    /// up from live candles.
    pub async fn bootstrap(&mut self, ctx: &TradingContext) -> Result<()> {
        let limit = self.predictor_config.history_limit;
        for tf in self.timeframes.clone() {
            let fetched = timeout(self.feed_timeout(), ctx.feed.history(&self.asset, tf, limit)).await;
            let candles = match fetched {
                Ok(Ok(candles)) => candles,
                Ok(Err(e)) => {
                    warn!("{} {} history unavailable: {}", self.asset, tf, e);
                    continue;
                }
                Err(_) => {
                    warn!("{} {} history timed out", self.asset, tf);
                    continue;
                }
            };

            self.store.load_history(tf, candles)?;
            if let Some(series) = self.store.series(tf) {
                let predictor = Predictor::train(&self.asset, series, self.predictor_config.clone());
                info!(
                    "{} {}: {} candles, {} pattern instances",
                    self.asset,
                    tf,
                    series.len(),
                    predictor.memory().len()
                );
                self.predictors.insert(tf, predictor);
            }
        }
        Ok(())
    }

    /// Run one cycle. Errors never escape: they are logged and reflected in
    /// the snapshot.
    pub async fn run_cycle(&mut self, ctx: &TradingContext, now: DateTime<Utc>) -> CycleOutcome {
        if let Some(reason) = &self.halted {
            debug!("{} halted, skipping cycle: {}", self.asset, reason);
            return CycleOutcome {
                snapshot: self.snapshot(now, None),
                closed_trade: None,
            };
        }
        let (closed_trade, skipped) = match self.cycle(ctx, now).await {
            Ok(trade) => (trade, None),
            Err(e) if e.is_invariant_violation() => {
                error!("{} HALTED: {}", self.asset, e);
                self.halted = Some(e.to_string());
                (None, None)
            }
            Err(e @ TraderError::FeedUnavailable(_)) => {
                warn!("{} skipped this cycle: {}", self.asset, e);
                (None, Some(e.to_string()))
            }
            Err(e) => {
                warn!("{} cycle error: {}", self.asset, e);
                (None, Some(e.to_string()))
            }
        };

        self.intents.cleanup(now);
        CycleOutcome {
            snapshot: self.snapshot(now, skipped),
            closed_trade,
        }
    }

    async fn cycle(&mut self, ctx: &TradingContext, now: DateTime<Utc>) -> Result<Option<ClosedTrade>> {
        let snapshot = match timeout(self.feed_timeout(), ctx.feed.poll(&self.asset, &self.timeframes)).await {
            Ok(result) => result?,
            Err(_) => return Err(FeedError::Timeout(self.runner_config.feed_timeout_secs).into()),
        };
        snapshot.quote.validate()?;
        let quote = snapshot.quote;
        let age = now - quote.time;
        if age > chrono::Duration::seconds(self.runner_config.max_quote_age_secs as i64) {
            return Err(FeedError::Stale(format!("{} quote is {}s old", self.asset, age.num_seconds())).into());
        }

        // Candles and predictions
        let closed = self.store.ingest(snapshot.candles)?;
        for (tf, newly_closed) in closed {
            if newly_closed.is_empty() {
                continue;
            }
            if let (Some(predictor), Some(series)) = (self.predictors.get_mut(&tf), self.store.series(tf)) {
                for update in predictor.on_candles_closed(&newly_closed, series)? {
                    debug!(
                        "{} {} candle {} closed, prediction error {:.3}%, {} instances adjusted",
                        self.asset, tf, update.candle_start, update.prediction_error_pct, update.instances_adjusted
                    );
                }
            }
        }
        self.refresh_predictions();

        let levels = levels_for_quote(&self.asset, &quote, self.machine.short_price_side(), &self.last_bounds);
        debug!(
            "{} LONG {} SHORT {} of {} (bid {} ask {})",
            self.asset, levels.long_level, levels.short_level, levels.available_timeframes, quote.bid, quote.ask
        );
        self.last_levels = levels.clone();
        self.last_quote = Some(quote.clone());
        ctx.account.mark(&self.asset, quote.bid).await;

        // An order still in flight is settled before anything new is decided
        if let Some(tracked) = self.intents.pending() {
            let request = tracked.request.clone();
            return self.resolve_pending(ctx, request, now).await;
        }

        let portfolio_value = ctx.account.portfolio_value().await;
        match self.machine.evaluate(&quote, &levels, portfolio_value, now)? {
            Some(request) => self.submit(ctx, request, now).await,
            None => Ok(None),
        }
    }

    fn refresh_predictions(&mut self) {
        let mut bounds = Vec::new();
        let mut lines = Vec::new();
        for tf in &self.timeframes {
            let (predictor, series) = match (self.predictors.get_mut(tf), self.store.series(*tf)) {
                (Some(p), Some(s)) => (p, s),
                _ => continue,
            };
            if let Some(record) = predictor.predict(series) {
                bounds.push(record.bounds());
                lines.push(PredictionLine {
                    timeframe: *tf,
                    target_start: record.target_start,
                    predicted_high: record.predicted_high,
                    predicted_low: record.predicted_low,
                    contributors: record.contributing_instance_ids.len(),
                });
            }
        }
        self.last_bounds = bounds;
        self.last_predictions = lines;
    }

    async fn submit(&mut self, ctx: &TradingContext, request: OrderRequest, now: DateTime<Utc>) -> Result<Option<ClosedTrade>> {
        let id = request.intent.id;
        if request.intent.side == Side::Buy {
            if let Err(e) = ctx.account.reserve(id, request.intent.expected_notional()).await {
                self.machine.apply_failure(&request, &e);
                return Ok(None);
            }
        }

        info!(
            "{} submitting {} {:?} ({:?})",
            self.asset, request.intent.side, request.intent.amount, request.action
        );
        let status = match timeout(self.order_timeout(), ctx.executor.submit(&request.intent)).await {
            Ok(result) => result,
            Err(_) => {
                // Outcome unknown: the venue may still hold the order
                warn!("{} order {} submit timed out, awaiting confirmation", self.asset, id);
                Ok(OrderStatus::Pending)
            }
        };

        match status {
            Ok(OrderStatus::Filled(fill)) => self.settle(ctx, &request, fill, now).await,
            Ok(OrderStatus::Pending) => {
                info!("{} order {} pending confirmation", self.asset, id);
                self.intents.track_pending(request, now);
                Ok(None)
            }
            Err(e) => {
                self.fail(ctx, &request, &e).await;
                Ok(None)
            }
        }
    }

    async fn resolve_pending(&mut self, ctx: &TradingContext, request: OrderRequest, now: DateTime<Utc>) -> Result<Option<ClosedTrade>> {
        let id = request.intent.id;
        let status = match timeout(self.order_timeout(), ctx.executor.poll(id)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.runner_config.order_timeout_secs)),
        };

        match status {
            Ok(OrderStatus::Filled(fill)) => {
                self.intents.finalize(id, IntentState::Filled, now);
                self.settle(ctx, &request, fill, now).await
            }
            Ok(OrderStatus::Pending) => {
                if self.intents.tick(id, now) {
                    warn!("{} order {} unconfirmed too long, cancelling", self.asset, id);
                    let err = ExecutionError::Timeout(self.runner_config.order_timeout_secs);
                    let state = IntentState::Cancelled {
                        reason: "confirmation timeout".to_string(),
                    };
                    self.cancel_pending(ctx, &request, err, state, now).await;
                }
                Ok(None)
            }
            Err(e) => {
                let state = IntentState::Failed { error: e.to_string() };
                self.cancel_pending(ctx, &request, e, state, now).await;
                Ok(None)
            }
        }
    }

    /// Withdraw a pending order. Only a confirmed cancel releases its cash;
    /// otherwise the order stays pending and is polled again next cycle.
    async fn cancel_pending(
        &mut self,
        ctx: &TradingContext,
        request: &OrderRequest,
        cause: ExecutionError,
        state: IntentState,
        now: DateTime<Utc>,
    ) {
        let id = request.intent.id;
        match timeout(self.order_timeout(), ctx.executor.cancel(id)).await {
            Ok(Ok(())) => {
                self.intents.finalize(id, state, now);
                self.fail(ctx, request, &cause).await;
            }
            Ok(Err(e)) => {
                error!("{} cancel of order {} failed, keeping it pending: {}", self.asset, id, e);
            }
            Err(_) => {
                error!("{} cancel of order {} timed out, keeping it pending", self.asset, id);
            }
        }
    }

    async fn settle(&mut self, ctx: &TradingContext, request: &OrderRequest, fill: Fill, now: DateTime<Utc>) -> Result<Option<ClosedTrade>> {
        if let Err(e) = self.machine.check_fill(request, &fill) {
            self.fail(ctx, request, &e).await;
            return Ok(None);
        }

        let cost_basis = self.machine.position().map_or(Decimal::ZERO, |p| p.cost_basis);
        let applied = self.machine.apply_fill(request, &fill, now);

        // The executor moved the money either way; book it before any halt
        match fill.side {
            Side::Buy => ctx.account.settle_buy(&fill).await,
            Side::Sell => {
                ctx.account.settle_sell(&fill, cost_basis).await;
            }
        }

        let closed = applied?;
        if fill.side == Side::Sell && closed.is_none() {
            return Err(TraderError::invariant(&self.asset, "sell fill did not close the position"));
        }
        Ok(closed)
    }

    async fn fail(&mut self, ctx: &TradingContext, request: &OrderRequest, error: &ExecutionError) {
        if request.intent.side == Side::Buy {
            ctx.account.release(request.intent.id).await;
        }
        self.machine.apply_failure(request, error);
    }

    fn snapshot(&self, now: DateTime<Utc>, skipped: Option<String>) -> AssetSnapshot {
        let position = self.machine.position().cloned();
        AssetSnapshot {
            asset: self.asset.clone(),
            updated_at: now,
            bid: self.last_quote.as_ref().map(|q| q.bid),
            ask: self.last_quote.as_ref().map(|q| q.ask),
            levels: self.last_levels.clone(),
            predictions: self.last_predictions.clone(),
            avg_cost: position.as_ref().and_then(|p| p.avg_cost()),
            position,
            dca_outlook: self.machine.dca_outlook(&self.last_bounds, now),
            pending_order: self.intents.pending().map(|i| i.request.intent.id.to_string()),
            consecutive_failures: self.machine.consecutive_failures(),
            halted: self.halted.clone(),
            skipped,
        }
    }
}

/// Drives one worker per asset and writes the observability projections
pub struct Runner {
    config: TraderConfig,
    ctx: TradingContext,
    state: StateManager,
}

impl Runner {
    pub fn new(config: TraderConfig, ctx: TradingContext, state: StateManager) -> Self {
        Self { config, ctx, state }
    }

    /// Run until `shutdown` flips to true. Workers stop between cycles.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.state.init().await?;
        self.state.write_config(&self.config).await?;

        let (tx, mut rx) = mpsc::channel::<CycleOutcome>(64);
        let mut handles = Vec::new();

        for asset in &self.config.assets {
            let mut worker = AssetWorker::new(asset, &self.config);
            let ctx = self.ctx.clone();
            let tx = tx.clone();
            let mut shutdown = shutdown.clone();
            let period = Duration::from_secs(self.config.runner.poll_interval_secs);

            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.bootstrap(&ctx).await {
                    error!("{} bootstrap failed: {}", worker.asset(), e);
                    return;
                }

                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = ticker.tick() => {
                            let outcome = worker.run_cycle(&ctx, Utc::now()).await;
                            if tx.send(outcome).await.is_err() {
                                break;
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                info!("{} worker stopped", worker.asset());
            }));
        }
        drop(tx);

        info!("Runner started for {} assets", self.config.assets.len());
        let mut assets: BTreeMap<String, AssetSnapshot> = BTreeMap::new();
        while let Some(outcome) = rx.recv().await {
            if let Some(trade) = &outcome.closed_trade {
                if let Err(e) = self.state.append_trade(trade).await {
                    error!("Failed to journal trade: {}", e);
                }
            }
            assets.insert(outcome.snapshot.asset.clone(), outcome.snapshot);

            let stopping = *shutdown.borrow();
            let now = NowState {
                timestamp: Utc::now(),
                status: if stopping { "stopping" } else { "running" }.to_string(),
                assets: assets.clone(),
                account: self.ctx.account.snapshot().await,
            };
            if let Err(e) = self.state.write_now(&now).await {
                error!("Failed to write state: {}", e);
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        let account = self.ctx.account.snapshot().await;
        info!(
            "Runner stopped | equity {} | realized {} | trades {} ({} winning)",
            account.total_equity.round_dp(2),
            account.realized_pnl.round_dp(2),
            account.trade_count,
            account.winning_trades
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaperConfig, StrategyConfig};
    use crate::executor::{Amount, OrderIntent, PaperExecutor};
    use crate::feed::ReplayFeed;
    use crate::strategy::{DcaTrigger, OrderAction};

    fn context() -> TradingContext {
        TradingContext {
            feed: Arc::new(ReplayFeed::new()),
            executor: Arc::new(PaperExecutor::new(&PaperConfig::default())),
            account: Arc::new(Account::new(Decimal::from(1000), Decimal::new(1, 3))),
        }
    }

    fn worker() -> AssetWorker {
        let config = TraderConfig {
            timeframes: vec![Timeframe::H1],
            strategy: StrategyConfig {
                entry_threshold: 1,
                ..StrategyConfig::default()
            },
            ..TraderConfig::default()
        };
        AssetWorker::new("BTC", &config)
    }

    #[tokio::test]
    async fn test_rejected_transition_still_books_fill() {
        let ctx = context();
        let mut worker = worker();
        let now = Utc::now();

        // DCA 2 with no open position
        let request = OrderRequest {
            action: OrderAction::Dca {
                number: 2,
                trigger: DcaTrigger::Level,
                consumed_level: 2,
            },
            intent: OrderIntent::market("BTC", Side::Buy, Amount::Notional(Decimal::from(100)), Decimal::from(50), now),
        };
        ctx.account.reserve(request.intent.id, Decimal::from(100)).await.unwrap();
        let fill = match ctx.executor.submit(&request.intent).await.unwrap() {
            OrderStatus::Filled(fill) => fill,
            OrderStatus::Pending => panic!("paper executor should fill immediately"),
        };

        let err = worker.settle(&ctx, &request, fill, now).await.unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(worker.machine().position().is_none());

        let account = ctx.account.snapshot().await;
        assert_eq!(account.reserved, Decimal::ZERO);
        // 1000 - 100 notional - 0.1 commission
        assert_eq!(account.cash, Decimal::new(8999, 1));
        assert_eq!(account.holdings.len(), 1);
        assert_eq!(account.holdings[0].quantity, Decimal::from(2));
    }
}
