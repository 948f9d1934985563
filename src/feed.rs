//! Market data collaborator - quotes and candle updates per asset

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::candle::{Candle, CandleUpdate, Timeframe};
use crate::error::FeedError;

/// Best bid/ask and last trade for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub time: DateTime<Utc>,
}

impl Quote {
    /// Same price on every side
    pub fn flat(price: Decimal, time: DateTime<Utc>) -> Self {
        Self {
            bid: price,
            ask: price,
            last: price,
            time,
        }
    }

    /// A crossed or non-positive quote cannot be traded on
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO || self.last <= Decimal::ZERO {
            return Err(FeedError::InvalidData(format!(
                "non-positive quote bid={} ask={} last={}",
                self.bid, self.ask, self.last
            )));
        }
        if self.bid > self.ask {
            return Err(FeedError::InvalidData(format!(
                "crossed quote bid={} > ask={}",
                self.bid, self.ask
            )));
        }
        Ok(())
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Everything fetched for one asset in one poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub quote: Quote,
    pub candles: Vec<(Timeframe, CandleUpdate)>,
}

/// Source of history and live updates
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Up to `limit` most recent candles, oldest first. A trailing candle
    /// with `closed == false` is the one in progress.
    async fn history(&self, asset: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, FeedError>;

    /// Current quote plus candle updates for the requested timeframes
    async fn poll(&self, asset: &str, timeframes: &[Timeframe]) -> Result<MarketSnapshot, FeedError>;
}

/// Scripted feed: fixed history and a queue of snapshots per asset
#[derive(Default)]
pub struct ReplayFeed {
    history: HashMap<(String, Timeframe), Vec<Candle>>,
    snapshots: Mutex<HashMap<String, VecDeque<MarketSnapshot>>>,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, asset: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        self.history.insert((asset.to_string(), timeframe), candles);
        self
    }

    /// Queue a snapshot to be returned by a later `poll`
    pub async fn push(&self, asset: &str, snapshot: MarketSnapshot) {
        self.snapshots
            .lock()
            .await
            .entry(asset.to_string())
            .or_default()
            .push_back(snapshot);
    }

    pub async fn remaining(&self, asset: &str) -> usize {
        self.snapshots.lock().await.get(asset).map_or(0, |q| q.len())
    }
}

#[async_trait]
impl MarketFeed for ReplayFeed {
    async fn history(&self, asset: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, FeedError> {
        let candles = self
            .history
            .get(&(asset.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn poll(&self, asset: &str, timeframes: &[Timeframe]) -> Result<MarketSnapshot, FeedError> {
        let mut snapshots = self.snapshots.lock().await;
        let mut snapshot = snapshots
            .get_mut(asset)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| FeedError::Stale(asset.to_string()))?;
        snapshot.candles.retain(|(tf, _)| timeframes.contains(tf));
        Ok(snapshot)
    }
}

/// Client for the data-retrieval service
pub struct HttpFeed {
    client: Client,
    base_url: String,
}

/// Candles requested per timeframe on each poll; covers a missed close
const POLL_CANDLES: usize = 3;

impl HttpFeed {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_quote(&self, asset: &str) -> Result<Quote, FeedError> {
        let url = format!("{}/prices/{}", self.base_url, asset);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::Transport(format!(
                "price fetch for {} failed: {}",
                asset,
                response.status()
            )));
        }

        let data: PriceResponse = response.json().await?;
        let quote = Quote {
            bid: data.bid.unwrap_or(data.price),
            ask: data.ask.unwrap_or(data.price),
            last: data.price,
            time: data.timestamp,
        };
        quote.validate()?;
        Ok(quote)
    }

    async fn fetch_candles(&self, asset: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, FeedError> {
        let url = format!("{}/candles/{}", self.base_url, asset);
        let response = self
            .client
            .get(&url)
            .query(&[("timeframe", timeframe.as_str().to_string()), ("limit", limit.to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::Transport(format!(
                "candle fetch for {} {} failed: {}",
                asset,
                timeframe,
                response.status()
            )));
        }

        let rows: Vec<CandleResponse> = response.json().await?;
        let now = Utc::now();
        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| row.into_candle(timeframe, now))
            .collect();
        candles.sort_by_key(|c| c.start_time);
        Ok(candles)
    }
}

#[async_trait]
impl MarketFeed for HttpFeed {
    async fn history(&self, asset: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, FeedError> {
        let candles = self.fetch_candles(asset, timeframe, limit).await?;
        debug!("Fetched {} {} candles for {}", candles.len(), timeframe, asset);
        Ok(candles)
    }

    async fn poll(&self, asset: &str, timeframes: &[Timeframe]) -> Result<MarketSnapshot, FeedError> {
        let quote = self.fetch_quote(asset).await?;

        let mut updates = Vec::with_capacity(timeframes.len());
        for timeframe in timeframes {
            let mut candles = self.fetch_candles(asset, *timeframe, POLL_CANDLES).await?;
            let in_progress = match candles.last() {
                Some(c) if !c.closed => candles.pop(),
                _ => None,
            };
            updates.push((
                *timeframe,
                CandleUpdate {
                    closed: candles,
                    in_progress,
                },
            ));
        }

        Ok(MarketSnapshot {
            quote,
            candles: updates,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
    #[serde(default)]
    bid: Option<Decimal>,
    #[serde(default)]
    ask: Option<Decimal>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
    timestamp: DateTime<Utc>,
}

impl CandleResponse {
    /// The service does not flag closure; a candle is closed once its
    /// period has fully elapsed
    fn into_candle(self, timeframe: Timeframe, now: DateTime<Utc>) -> Candle {
        Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            start_time: self.timestamp,
            timeframe,
            closed: self.timestamp + timeframe.duration() <= now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::tests::candle;

    fn quote(bid: i64, ask: i64) -> Quote {
        Quote {
            bid: Decimal::from(bid),
            ask: Decimal::from(ask),
            last: Decimal::from(bid),
            time: Utc::now(),
        }
    }

    #[test]
    fn test_quote_validation() {
        assert!(quote(100, 101).validate().is_ok());
        assert!(matches!(quote(102, 101).validate(), Err(FeedError::InvalidData(_))));
        assert!(matches!(quote(0, 101).validate(), Err(FeedError::InvalidData(_))));
        assert_eq!(quote(100, 102).mid(), Decimal::from(101));
    }

    #[tokio::test]
    async fn test_replay_feed_history_and_queue() {
        let history: Vec<Candle> = (0..10)
            .map(|i| candle(Timeframe::H1, i, 100.0, 101.0, 99.0, 100.0, true))
            .collect();
        let feed = ReplayFeed::new().with_history("BTC", Timeframe::H1, history);

        let recent = feed.history("BTC", Timeframe::H1, 4).await.unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].start_time, candle(Timeframe::H1, 6, 1.0, 1.0, 1.0, 1.0, true).start_time);
        assert!(feed.history("ETH", Timeframe::H1, 4).await.unwrap().is_empty());

        feed.push(
            "BTC",
            MarketSnapshot {
                quote: quote(100, 101),
                candles: vec![
                    (Timeframe::H1, CandleUpdate::default()),
                    (Timeframe::H4, CandleUpdate::default()),
                ],
            },
        )
        .await;
        assert_eq!(feed.remaining("BTC").await, 1);

        let snapshot = feed.poll("BTC", &[Timeframe::H1]).await.unwrap();
        assert_eq!(snapshot.candles.len(), 1);
        assert!(matches!(feed.poll("BTC", &[Timeframe::H1]).await, Err(FeedError::Stale(_))));
    }

    #[test]
    fn test_candle_response_closure_by_elapsed_time() {
        let now = Utc::now();
        let row = |start: DateTime<Utc>| CandleResponse {
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ZERO,
            timestamp: start,
        };
        let old = row(now - chrono::Duration::hours(2)).into_candle(Timeframe::H1, now);
        let running = row(now - chrono::Duration::minutes(10)).into_candle(Timeframe::H1, now);
        assert!(old.closed);
        assert!(!running.closed);
    }
}
