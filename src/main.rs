//! Pattern Trader - polling agent
//!
//! 1. Loads layered configuration (defaults, file, environment)
//! 2. Trains per-timeframe pattern memories from the data-retrieval service
//! 3. Runs one worker per asset against a paper account
//! 4. Writes state/now.json and the trade journal every cycle

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use pattern_trader::{Account, HttpFeed, PaperExecutor, Runner, StateManager, TraderConfig, TradingContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TraderConfig::load(config_path.as_deref())?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    print_banner(&config);

    let feed = HttpFeed::new(&config.feed.base_url, config.runner.feed_timeout_secs)?;
    let executor = PaperExecutor::new(&config.paper);
    let account = Account::new(config.paper.starting_cash, config.paper.commission_rate);

    let ctx = TradingContext {
        feed: Arc::new(feed),
        executor: Arc::new(executor),
        account: Arc::new(account),
    };
    let state = StateManager::new(&config.runner.state_dir);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing current cycles...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    Runner::new(config, ctx, state).run(shutdown_rx).await
}

fn print_banner(config: &TraderConfig) {
    let timeframes: Vec<&str> = config.timeframes.iter().map(|tf| tf.as_str()).collect();
    info!("Starting Pattern Trader (paper trading)");
    info!("Assets: {} | Timeframes: {}", config.assets.join(", "), timeframes.join(", "));
    info!(
        "Entry at LONG >= {} with SHORT <= {} | start allocation {} | max {} DCA per 24h",
        config.strategy.entry_threshold,
        config.strategy.short_veto_threshold,
        config.strategy.start_allocation_fraction,
        config.strategy.max_dca_per_24h
    );
    info!(
        "Trailing gap {}% | margins {}% / {}% (no DCA / with DCA)",
        config.strategy.trailing_gap_pct,
        config.strategy.profit_margin_no_dca_pct,
        config.strategy.profit_margin_with_dca_pct
    );
    info!(
        "Data: {} | State: {} | Poll every {}s",
        config.feed.base_url,
        config.runner.state_dir.display(),
        config.runner.poll_interval_secs
    );
}
