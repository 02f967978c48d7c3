//! Market data feed.
//!
//! One long-lived task per instrument keeps the latest [`MarketSnapshot`] in
//! a `watch` channel. The task prefers the adapter's quote push stream and
//! falls back to polling when the stream is unavailable or drops; it retries
//! the stream after `resubscribe_after`. Readers always see a whole snapshot,
//! never a partially updated one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, ExchangeCapabilities};
use crate::regime::{SpreadRegime, SpreadRegimeTracker};
use crate::types::{MarketSnapshot, Quote};
use pairtrade_core::MarketDataConfig;

/// Channels and regime trackers shared between the feed and its tasks.
struct FeedShared {
    channels: HashMap<String, watch::Sender<Option<MarketSnapshot>>>,
    trackers: Mutex<HashMap<String, SpreadRegimeTracker>>,
}

impl FeedShared {
    /// Publishes a quote from the feed task, adding it to the regime window.
    fn publish(&self, quote: Quote) -> Option<MarketSnapshot> {
        let regime = self
            .trackers
            .lock()
            .get_mut(&quote.instrument)
            .map_or(SpreadRegime::Stable, |t| t.observe(&quote));
        self.install(quote, regime)
    }

    /// Publishes an on-demand quote. The regime window belongs to the feed
    /// task, so no sample is added.
    fn publish_refreshed(&self, quote: Quote) -> Option<MarketSnapshot> {
        let regime = self
            .trackers
            .lock()
            .get(&quote.instrument)
            .map_or(SpreadRegime::Stable, SpreadRegimeTracker::regime);
        self.install(quote, regime)
    }

    /// Installs the snapshot unless a newer quote is already published, and
    /// returns whichever snapshot is current.
    fn install(&self, quote: Quote, regime: SpreadRegime) -> Option<MarketSnapshot> {
        let sender = self.channels.get(&quote.instrument)?;
        let snapshot = MarketSnapshot {
            quote: Arc::new(quote),
            regime,
        };
        let mut current = snapshot.clone();
        sender.send_if_modified(|slot| match slot {
            Some(existing) if existing.quote.timestamp > snapshot.quote.timestamp => {
                current = existing.clone();
                false
            }
            _ => {
                *slot = Some(snapshot);
                true
            }
        });
        Some(current)
    }
}

pub struct MarketDataFeed {
    adapter: Arc<dyn ExchangeAdapter>,
    config: MarketDataConfig,
    capabilities: ExchangeCapabilities,
    shared: Arc<FeedShared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketDataFeed {
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        instruments: &[String],
        config: MarketDataConfig,
    ) -> Self {
        let capabilities = adapter.capabilities();
        let channels = instruments
            .iter()
            .map(|i| (i.clone(), watch::channel(None).0))
            .collect();
        let trackers = instruments
            .iter()
            .map(|i| {
                (
                    i.clone(),
                    SpreadRegimeTracker::new(config.regime_window, config.regime_threshold),
                )
            })
            .collect();
        let (shutdown, _) = watch::channel(false);

        Self {
            adapter,
            config,
            capabilities,
            shared: Arc::new(FeedShared {
                channels,
                trackers: Mutex::new(trackers),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connects and starts one feed task per instrument.
    ///
    /// A failed connect is logged and the feed runs on polling alone.
    pub async fn start(&self) {
        let streaming = if self.capabilities.quote_stream {
            match self.adapter.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Exchange connect failed, market data degrades to polling");
                    false
                }
            }
        } else {
            false
        };

        let mut tasks = self.tasks.lock();
        for instrument in self.shared.channels.keys() {
            info!(instrument = %instrument, streaming, "Starting market data feed");
            tasks.push(tokio::spawn(run_feed(
                Arc::clone(&self.adapter),
                Arc::clone(&self.shared),
                instrument.clone(),
                self.config.clone(),
                streaming,
                self.shutdown.subscribe(),
            )));
        }
    }

    /// Stops all feed tasks and disconnects.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.adapter.disconnect().await {
            debug!(error = %e, "Disconnect failed during feed shutdown");
        }
    }

    /// Latest snapshot, if any quote has arrived.
    #[must_use]
    pub fn snapshot(&self, instrument: &str) -> Option<MarketSnapshot> {
        self.shared
            .channels
            .get(instrument)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Receiver that observes every published snapshot.
    #[must_use]
    pub fn subscribe(&self, instrument: &str) -> Option<watch::Receiver<Option<MarketSnapshot>>> {
        self.shared.channels.get(instrument).map(watch::Sender::subscribe)
    }

    #[must_use]
    pub fn regime(&self, instrument: &str) -> SpreadRegime {
        self.shared
            .trackers
            .lock()
            .get(instrument)
            .map_or(SpreadRegime::Stable, SpreadRegimeTracker::regime)
    }

    /// Pulls a fresh quote from the exchange and publishes it, unless the
    /// feed task has already published a newer one.
    ///
    /// # Errors
    ///
    /// Returns the adapter error, or `Api` for an instrument this feed does
    /// not track.
    pub async fn refresh(&self, instrument: &str) -> Result<MarketSnapshot, ExchangeError> {
        let quote = fetch_quote(self.adapter.as_ref(), instrument).await?;
        self.shared
            .publish_refreshed(quote)
            .ok_or_else(|| ExchangeError::Api(format!("instrument {instrument} is not tracked")))
    }
}

/// Quote plus depth, tolerating a failed depth query.
async fn fetch_quote(adapter: &dyn ExchangeAdapter, instrument: &str) -> Result<Quote, ExchangeError> {
    let quote = adapter.get_quote(instrument).await?;
    Ok(with_depth(adapter, quote).await)
}

/// Attaches the exchange ladder to a top-of-book quote. Quotes that already
/// carry levels are kept as they are.
async fn with_depth(adapter: &dyn ExchangeAdapter, quote: Quote) -> Quote {
    if !quote.bids.is_empty() || !quote.asks.is_empty() {
        return quote;
    }
    match adapter.get_depth(&quote.instrument).await {
        Ok(depth) => quote.with_depth(depth),
        Err(e) => {
            debug!(instrument = %quote.instrument, error = %e, "Depth unavailable, using top of book");
            quote
        }
    }
}

async fn run_feed(
    adapter: Arc<dyn ExchangeAdapter>,
    shared: Arc<FeedShared>,
    instrument: String,
    config: MarketDataConfig,
    streaming: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream_retry_at = streaming.then(Instant::now);

    loop {
        if *shutdown.borrow() {
            return;
        }

        if stream_retry_at.is_some_and(|at| Instant::now() >= at) {
            match adapter.subscribe_quotes(&instrument).await {
                Ok(mut stream) => {
                    debug!(instrument = %instrument, "Quote stream subscribed");
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            msg = stream.recv() => match msg {
                                Some(quote) => {
                                    shared.publish(with_depth(adapter.as_ref(), quote).await);
                                }
                                None => {
                                    warn!(instrument = %instrument, "Quote stream closed, falling back to polling");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Quote stream unavailable, polling");
                }
            }
            stream_retry_at = Some(Instant::now() + config.resubscribe_after);
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(config.poll_interval) => {
                match fetch_quote(adapter.as_ref(), &instrument).await {
                    Ok(quote) => {
                        shared.publish(quote);
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(instrument = %instrument, error = %e, "Quote poll failed, retrying");
                    }
                    Err(e) => {
                        warn!(instrument = %instrument, error = %e, "Quote poll failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperExchange, PaperExchangeConfig};
    use crate::pricing::PricingEngine;
    use crate::types::{Depth, DepthLevel};
    use chrono::Utc;
    use pairtrade_core::{InstrumentConfig, PricingConfig, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn create_test_config() -> MarketDataConfig {
        MarketDataConfig {
            poll_interval: Duration::from_millis(5),
            resubscribe_after: Duration::from_millis(20),
            ..MarketDataConfig::default()
        }
    }

    fn create_test_feed(config: PaperExchangeConfig) -> (Arc<PaperExchange>, MarketDataFeed) {
        let exchange = Arc::new(PaperExchange::new(config));
        let feed = MarketDataFeed::new(exchange.clone(), &["ETH".to_string()], create_test_config());
        (exchange, feed)
    }

    async fn wait_for_bid(feed: &MarketDataFeed, bid: Decimal) -> bool {
        for _ in 0..200 {
            if feed.snapshot("ETH").is_some_and(|s| s.quote.bid == bid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }

    // ==== Pull Tests ====

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::default());
        assert!(feed.snapshot("ETH").is_none());

        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        let snapshot = feed.refresh("ETH").await.unwrap();

        assert_eq!(snapshot.quote.ask, dec!(101));
        assert_eq!(feed.snapshot("ETH").unwrap().quote.bid, dec!(99));
        assert_eq!(feed.regime("ETH"), SpreadRegime::Stable);
    }

    #[tokio::test]
    async fn test_refresh_leaves_regime_window_to_feed_task() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::default());
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));

        feed.refresh("ETH").await.unwrap();
        feed.refresh("ETH").await.unwrap();

        assert!(feed.shared.trackers.lock()["ETH"].is_empty());
    }

    #[tokio::test]
    async fn test_refresh_never_replaces_newer_snapshot() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::default());
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        feed.refresh("ETH").await.unwrap();

        let older = Utc::now() - chrono::Duration::seconds(5);
        exchange.set_quote(Quote::new("ETH", dec!(90), dec!(101), older));
        let snapshot = feed.refresh("ETH").await.unwrap();

        assert_eq!(snapshot.quote.bid, dec!(99));
        assert_eq!(feed.snapshot("ETH").unwrap().quote.bid, dec!(99));
    }

    #[tokio::test]
    async fn test_refresh_untracked_instrument_fails() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::default());
        exchange.set_quote(Quote::new("BTC", dec!(99), dec!(101), Utc::now()));
        assert!(feed.refresh("BTC").await.is_err());
    }

    // ==== Background Task Tests ====

    #[tokio::test]
    async fn test_polling_feed_tracks_quotes() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::default());
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        feed.start().await;

        assert!(wait_for_bid(&feed, dec!(99)).await);
        exchange.set_quote(Quote::new("ETH", dec!(98), dec!(101), Utc::now()));
        assert!(wait_for_bid(&feed, dec!(98)).await);

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_stream_feed_receives_pushes() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::streaming());
        let mut rx = feed.subscribe("ETH").unwrap();
        feed.start().await;

        // Give the task a moment to subscribe before pushing.
        tokio::time::sleep(Duration::from_millis(10)).await;
        exchange.set_quote(Quote::new("ETH", dec!(97), dec!(101), Utc::now()));

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(wait_for_bid(&feed, dec!(97)).await);
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_pushed_top_of_book_gets_exchange_depth() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::streaming());
        exchange.set_book(
            "ETH",
            Depth {
                bids: vec![DepthLevel::new(dec!(99.9), dec!(100))],
                asks: vec![
                    DepthLevel::new(dec!(100), dec!(1)),
                    DepthLevel::new(dec!(110), dec!(100)),
                ],
            },
        );
        feed.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        exchange.set_quote(Quote::new("ETH", dec!(99.9), dec!(100), Utc::now()));
        assert!(wait_for_bid(&feed, dec!(99.9)).await);

        let snapshot = feed.snapshot("ETH").unwrap();
        assert_eq!(snapshot.quote.asks.len(), 2);

        let priced = PricingEngine::new(PricingConfig::default())
            .price_and_size(
                &InstrumentConfig::new("ETH", dec!(0.01), dec!(0.001)),
                Side::Buy,
                &snapshot,
                dec!(1000),
                Decimal::ZERO,
                Utc::now(),
            )
            .unwrap();
        assert!(priced.clamped);
        assert!(priced.quantity < dec!(2));
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_closed_stream_falls_back_to_polling() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::streaming());
        feed.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        exchange.close_quote_stream("ETH");
        exchange.set_quote(Quote::new("ETH", dec!(96), dec!(101), Utc::now()));

        assert!(wait_for_bid(&feed, dec!(96)).await);
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_failed_connect_degrades_to_polling() {
        let (exchange, feed) = create_test_feed(PaperExchangeConfig::streaming());
        exchange.fail_connect(true);
        exchange.set_quote(Quote::new("ETH", dec!(95), dec!(101), Utc::now()));
        feed.start().await;

        assert!(wait_for_bid(&feed, dec!(95)).await);
        feed.stop().await;
    }
}
