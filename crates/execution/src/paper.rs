//! Paper exchange for dry runs and deterministic tests.
//!
//! `PaperExchange` implements [`ExchangeAdapter`] entirely in memory. Quotes
//! are set by the caller, and each submitted order consumes the next
//! [`FillPlan`] queued for its instrument, so a test can script exactly how
//! every leg behaves.
//!
//! # Features
//!
//! - Scripted fills: full, partial, none, rejected, delayed, transport errors
//! - Seeded random fills for soak runs
//! - Positions maintained from fills, with optional reporting lag
//! - Optional quote and order-update push streams
//! - Complete order and cancel history for assertions

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, ExchangeCapabilities};
use crate::types::{Depth, FillResult, LegStatus, OrderKind, OrderRequest, Quote};
use pairtrade_core::Side;

// =============================================================================
// Configuration
// =============================================================================

/// How the next order for an instrument behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillPlan {
    /// Fills completely on arrival.
    Full,
    /// Fills this fraction on arrival. Maker orders rest with the remainder.
    Partial(Decimal),
    /// Nothing fills. Maker orders rest until cancelled.
    None,
    /// The exchange refuses the order.
    Reject(String),
    /// Rests untouched for `polls` status queries, then fills `ratio`.
    Delayed { polls: u32, ratio: Decimal },
    /// Submission fails with this error and no order is created.
    Fail(ExchangeError),
    /// Draws from the configured fill and partial-fill rates.
    Random,
}

/// Configuration for the paper exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperExchangeConfig {
    /// Whether quote and order-update streams are offered.
    pub quote_stream: bool,
    pub order_stream: bool,

    /// Number of position queries that still see the pre-fill state after
    /// each fill.
    pub position_lag_reads: u32,

    /// Probability that a `Random` plan fills (0.0 to 1.0).
    pub fill_rate: f64,

    /// Probability that a `Random` fill is partial (0.0 to 1.0).
    pub partial_fill_rate: f64,

    /// Simulated latency in milliseconds for order calls.
    pub simulate_latency_ms: u64,

    /// Optional random seed for reproducible runs.
    pub random_seed: Option<u64>,
}

impl Default for PaperExchangeConfig {
    fn default() -> Self {
        Self {
            quote_stream: false,
            order_stream: false,
            position_lag_reads: 0,
            fill_rate: 0.85,
            partial_fill_rate: 0.10,
            simulate_latency_ms: 0,
            random_seed: None,
        }
    }
}

impl PaperExchangeConfig {
    /// Offers both push streams.
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            quote_stream: true,
            order_stream: true,
            ..Default::default()
        }
    }

    /// Creates a config with a specific random seed for reproducible tests.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            random_seed: Some(seed),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_position_lag(mut self, reads: u32) -> Self {
        self.position_lag_reads = reads;
        self
    }

    /// Sets the fill rate.
    #[must_use]
    pub fn fill_rate(mut self, rate: f64) -> Self {
        self.fill_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the simulated latency.
    #[must_use]
    pub const fn latency_ms(mut self, ms: u64) -> Self {
        self.simulate_latency_ms = ms;
        self
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct PaperOrder {
    request: OrderRequest,
    result: FillResult,
    /// Remaining status queries and the ratio to fill afterwards.
    delayed: Option<(u32, Decimal)>,
}

#[derive(Debug)]
struct PaperState {
    quotes: HashMap<String, Quote>,
    /// Book served by `get_depth` when it differs from the quote's own levels.
    books: HashMap<String, Depth>,
    plans: HashMap<String, VecDeque<FillPlan>>,
    default_plan: FillPlan,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<String, Decimal>,
    reported_positions: HashMap<String, Decimal>,
    stale_position_reads: u32,
    submitted: Vec<OrderRequest>,
    cancelled: Vec<String>,
    quote_streams: HashMap<String, mpsc::Sender<Quote>>,
    fail_connect: bool,
    fail_position_reads: u32,
}

impl PaperState {
    fn new() -> Self {
        Self {
            quotes: HashMap::new(),
            books: HashMap::new(),
            plans: HashMap::new(),
            default_plan: FillPlan::Full,
            orders: HashMap::new(),
            positions: HashMap::new(),
            reported_positions: HashMap::new(),
            stale_position_reads: 0,
            submitted: Vec::new(),
            cancelled: Vec::new(),
            quote_streams: HashMap::new(),
            fail_connect: false,
            fail_position_reads: 0,
        }
    }

    fn next_plan(&mut self, instrument: &str) -> FillPlan {
        self.plans
            .get_mut(instrument)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_plan.clone())
    }

    /// Price a fill would execute at: the limit, improved to the touch if the
    /// book is better.
    fn execution_price(&self, request: &OrderRequest) -> Decimal {
        match (self.quotes.get(&request.instrument), request.side) {
            (Some(q), Side::Buy) if q.ask > Decimal::ZERO => request.price.min(q.ask),
            (Some(q), Side::Sell) if q.bid > Decimal::ZERO => request.price.max(q.bid),
            _ => request.price,
        }
    }
}

// =============================================================================
// Paper Exchange
// =============================================================================

/// In-memory exchange adapter with scriptable fills.
///
/// # Thread Safety
///
/// The exchange is thread-safe and can be shared across tasks. Internal
/// state is protected by a read-write lock.
pub struct PaperExchange {
    config: PaperExchangeConfig,
    state: Arc<RwLock<PaperState>>,
    rng: Arc<RwLock<StdRng>>,
    updates: broadcast::Sender<FillResult>,
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperExchange")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PaperExchange {
    #[must_use]
    pub fn new(config: PaperExchangeConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (updates, _) = broadcast::channel(256);

        Self {
            state: Arc::new(RwLock::new(PaperState::new())),
            rng: Arc::new(RwLock::new(rng)),
            updates,
            config,
        }
    }

    /// Replaces the quote for an instrument and pushes it to any subscriber.
    pub fn set_quote(&self, quote: Quote) {
        let mut state = self.state.write();
        if let Some(stream) = state.quote_streams.get(&quote.instrument) {
            if stream.try_send(quote.clone()).is_err() {
                state.quote_streams.remove(&quote.instrument);
            }
        }
        state.quotes.insert(quote.instrument.clone(), quote);
    }

    /// Sets the ladder returned by `get_depth` without touching the quote,
    /// for venues that push top of book only.
    pub fn set_book(&self, instrument: &str, depth: Depth) {
        self.state.write().books.insert(instrument.to_string(), depth);
    }

    /// Ends the push stream for an instrument, as a dropped connection would.
    pub fn close_quote_stream(&self, instrument: &str) {
        self.state.write().quote_streams.remove(instrument);
    }

    /// Queues the behaviour of the next order for `instrument`.
    pub fn push_plan(&self, instrument: &str, plan: FillPlan) {
        self.state
            .write()
            .plans
            .entry(instrument.to_string())
            .or_default()
            .push_back(plan);
    }

    /// Behaviour for orders with no queued plan.
    pub fn set_default_plan(&self, plan: FillPlan) {
        self.state.write().default_plan = plan;
    }

    /// Moves a position outside of any order, as an external trade would.
    pub fn set_position(&self, instrument: &str, quantity: Decimal) {
        let mut state = self.state.write();
        state.positions.insert(instrument.to_string(), quantity);
        state.reported_positions.insert(instrument.to_string(), quantity);
    }

    /// Makes `connect` fail, forcing callers onto polling.
    pub fn fail_connect(&self, fail: bool) {
        self.state.write().fail_connect = fail;
    }

    /// Makes the next `count` position queries fail with a network error.
    pub fn fail_position_reads(&self, count: u32) {
        self.state.write().fail_position_reads = count;
    }

    /// True position, ignoring reporting lag.
    #[must_use]
    pub fn position(&self, instrument: &str) -> Decimal {
        self.state
            .read()
            .positions
            .get(instrument)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Every order submitted, in arrival order.
    #[must_use]
    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.read().submitted.clone()
    }

    /// Order ids that received a cancel request.
    #[must_use]
    pub fn cancelled_orders(&self) -> Vec<String> {
        self.state.read().cancelled.clone()
    }

    /// Orders still able to fill.
    #[must_use]
    pub fn open_order_count(&self) -> usize {
        self.state
            .read()
            .orders
            .values()
            .filter(|o| !o.result.status.is_terminal())
            .count()
    }

    /// Generates a new order ID.
    fn generate_order_id() -> String {
        format!("paper-{}", Uuid::new_v4())
    }

    async fn simulate_latency(&self) {
        if self.config.simulate_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.simulate_latency_ms)).await;
        }
    }

    fn random_ratio(&self) -> Decimal {
        let mut rng = self.rng.write();
        if rng.gen::<f64>() >= self.config.fill_rate {
            return Decimal::ZERO;
        }
        if rng.gen::<f64>() < self.config.partial_fill_rate {
            let pct = rng.gen_range(0.25..=0.95);
            return Decimal::from_f64_retain(pct)
                .unwrap_or(Decimal::new(5, 1))
                .round_dp(2);
        }
        Decimal::ONE
    }

    /// Executes `ratio` of the order's remaining size and returns its new state.
    fn fill(&self, state: &mut PaperState, order_id: &str, ratio: Decimal) -> Option<FillResult> {
        let (request, already) = {
            let order = state.orders.get(order_id)?;
            (order.request.clone(), order.result.filled_qty)
        };
        let quantity = (request.quantity * ratio)
            .round_dp_with_strategy(8, RoundingStrategy::ToZero)
            .min(request.quantity - already);
        let price = state.execution_price(&request);

        if quantity > Decimal::ZERO {
            let position = state.positions.entry(request.instrument.clone()).or_default();
            *position += request.side.sign() * quantity;
            if self.config.position_lag_reads > 0 {
                state.stale_position_reads = self.config.position_lag_reads;
            } else {
                state.reported_positions = state.positions.clone();
            }
        }

        let order = state.orders.get_mut(order_id)?;
        if quantity > Decimal::ZERO {
            let notional = order.result.fill_notional() + quantity * price;
            order.result.filled_qty += quantity;
            order.result.avg_price = Some(notional / order.result.filled_qty);
        }
        order.result.status = if order.result.filled_qty >= request.quantity {
            LegStatus::Filled
        } else if request.kind == OrderKind::ImmediateOrCancel {
            LegStatus::Cancelled
        } else if order.result.has_fills() {
            LegStatus::PartiallyFilled
        } else {
            LegStatus::Open
        };
        Some(order.result.clone())
    }

    fn publish(&self, update: &FillResult) {
        if self.config.order_stream {
            let _ = self.updates.send(update.clone());
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn capabilities(&self) -> ExchangeCapabilities {
        ExchangeCapabilities {
            quote_stream: self.config.quote_stream,
            order_stream: self.config.order_stream,
        }
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        if self.state.read().fail_connect {
            return Err(ExchangeError::Network("paper connect refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        self.state.write().quote_streams.clear();
        Ok(())
    }

    async fn get_quote(&self, instrument: &str) -> Result<Quote, ExchangeError> {
        self.state
            .read()
            .quotes
            .get(instrument)
            .cloned()
            .ok_or_else(|| ExchangeError::Api(format!("no quote for {instrument}")))
    }

    async fn get_depth(&self, instrument: &str) -> Result<Depth, ExchangeError> {
        let state = self.state.read();
        if let Some(book) = state.books.get(instrument) {
            return Ok(book.clone());
        }
        let quote = state
            .quotes
            .get(instrument)
            .ok_or_else(|| ExchangeError::Api(format!("no book for {instrument}")))?;
        Ok(Depth {
            bids: quote.bids.clone(),
            asks: quote.asks.clone(),
        })
    }

    async fn subscribe_quotes(&self, instrument: &str) -> Result<mpsc::Receiver<Quote>, ExchangeError> {
        if !self.config.quote_stream {
            return Err(ExchangeError::Unsupported("quote stream"));
        }
        let (tx, rx) = mpsc::channel(64);
        self.state
            .write()
            .quote_streams
            .insert(instrument.to_string(), tx);
        Ok(rx)
    }

    fn subscribe_order_updates(&self) -> Option<broadcast::Receiver<FillResult>> {
        self.config.order_stream.then(|| self.updates.subscribe())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<FillResult, ExchangeError> {
        self.simulate_latency().await;

        let plan = {
            let mut state = self.state.write();
            state.submitted.push(request.clone());
            state.next_plan(&request.instrument)
        };
        let (ratio, delayed) = match plan {
            FillPlan::Reject(reason) => return Err(ExchangeError::Rejected { reason }),
            FillPlan::Fail(err) => return Err(err),
            FillPlan::Full => (Decimal::ONE, None),
            FillPlan::Partial(ratio) => (ratio, None),
            FillPlan::None => (Decimal::ZERO, None),
            FillPlan::Delayed { polls, ratio } => (Decimal::ZERO, Some((polls, ratio))),
            FillPlan::Random => (self.random_ratio(), None),
        };

        let order_id = Self::generate_order_id();
        let result = {
            let mut state = self.state.write();
            state.orders.insert(
                order_id.clone(),
                PaperOrder {
                    request: request.clone(),
                    result: FillResult::open(&order_id),
                    delayed,
                },
            );
            self.fill(&mut state, &order_id, ratio)
        }
        .ok_or_else(|| ExchangeError::Api("paper order vanished".to_string()))?;

        tracing::debug!(
            order_id = %order_id,
            instrument = %request.instrument,
            side = %request.side,
            quantity = %request.quantity,
            price = %request.price,
            filled = %result.filled_qty,
            "Paper order submitted"
        );
        self.publish(&result);
        Ok(result)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<FillResult, ExchangeError> {
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        let due = match order.delayed.as_mut() {
            Some((polls, ratio)) if !order.result.status.is_terminal() => {
                *polls = polls.saturating_sub(1);
                (*polls == 0).then_some(*ratio)
            }
            _ => None,
        };
        let Some(ratio) = due else {
            return Ok(order.result.clone());
        };
        order.delayed = None;

        let result = self
            .fill(&mut state, order_id, ratio)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        drop(state);
        self.publish(&result);
        Ok(result)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let update = {
            let mut state = self.state.write();
            state.cancelled.push(order_id.to_string());
            let order = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
            if order.result.status.is_terminal() {
                return Ok(());
            }
            order.result.status = LegStatus::Cancelled;
            order.delayed = None;
            order.result.clone()
        };
        self.publish(&update);
        Ok(())
    }

    async fn get_positions(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let mut state = self.state.write();
        if state.fail_position_reads > 0 {
            state.fail_position_reads -= 1;
            return Err(ExchangeError::Network("paper positions unavailable".to_string()));
        }
        if state.stale_position_reads > 0 {
            state.stale_position_reads -= 1;
        } else {
            state.reported_positions = state.positions.clone();
        }
        Ok(state
            .reported_positions
            .iter()
            .filter(|(_, q)| !q.is_zero())
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn create_test_exchange() -> PaperExchange {
        let exchange = PaperExchange::new(PaperExchangeConfig::default());
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        exchange
    }

    fn request(side: Side, kind: OrderKind, price: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: "ETH".to_string(),
            side,
            quantity: dec!(10),
            price,
            kind,
        }
    }

    // ==== Fill Plan Tests ====

    #[tokio::test]
    async fn test_full_fill_updates_position() {
        let exchange = create_test_exchange();
        let result = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();

        assert_eq!(result.status, LegStatus::Filled);
        assert_eq!(result.filled_qty, dec!(10));
        assert_eq!(result.avg_price, Some(dec!(101)));
        assert_eq!(exchange.position("ETH"), dec!(10));
    }

    #[tokio::test]
    async fn test_crossing_order_fills_at_touch() {
        let exchange = create_test_exchange();
        let result = exchange
            .submit_order(&request(Side::Sell, OrderKind::ImmediateOrCancel, dec!(90)))
            .await
            .unwrap();
        assert_eq!(result.avg_price, Some(dec!(99)));
    }

    #[tokio::test]
    async fn test_partial_maker_rests_and_ioc_cancels() {
        let exchange = create_test_exchange();
        exchange.push_plan("ETH", FillPlan::Partial(dec!(0.4)));
        exchange.push_plan("ETH", FillPlan::Partial(dec!(0.4)));

        let maker = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();
        assert_eq!(maker.status, LegStatus::PartiallyFilled);
        assert_eq!(exchange.open_order_count(), 1);

        let ioc = exchange
            .submit_order(&request(Side::Buy, OrderKind::ImmediateOrCancel, dec!(101)))
            .await
            .unwrap();
        assert_eq!(ioc.status, LegStatus::Cancelled);
        assert_eq!(ioc.filled_qty, dec!(4));
        assert_eq!(exchange.position("ETH"), dec!(8));
    }

    #[tokio::test]
    async fn test_reject_and_fail_plans() {
        let exchange = create_test_exchange();
        exchange.push_plan("ETH", FillPlan::Reject("post only".into()));
        exchange.push_plan("ETH", FillPlan::Fail(ExchangeError::Network("reset".into())));

        let rejected = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await;
        assert!(matches!(rejected, Err(ExchangeError::Rejected { .. })));

        let failed = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await;
        assert!(failed.unwrap_err().is_retryable());
        assert_eq!(exchange.submitted_orders().len(), 2);
        assert_eq!(exchange.position("ETH"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_delayed_fill_after_polls() {
        let exchange = create_test_exchange();
        exchange.push_plan("ETH", FillPlan::Delayed { polls: 2, ratio: Decimal::ONE });

        let ack = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();
        let id = ack.order_id.unwrap();
        assert_eq!(ack.status, LegStatus::Open);

        assert_eq!(exchange.get_order_status(&id).await.unwrap().status, LegStatus::Open);
        assert_eq!(exchange.get_order_status(&id).await.unwrap().status, LegStatus::Filled);
    }

    // ==== Cancel Tests ====

    #[tokio::test]
    async fn test_cancel_terminal_order_is_ok() {
        let exchange = create_test_exchange();
        let ack = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();
        let id = ack.order_id.unwrap();

        assert!(exchange.cancel_order(&id).await.is_ok());
        assert_eq!(exchange.get_order_status(&id).await.unwrap().status, LegStatus::Filled);
        assert!(exchange.cancel_order("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let exchange = create_test_exchange();
        exchange.push_plan("ETH", FillPlan::None);
        let ack = exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();
        let id = ack.order_id.unwrap();

        exchange.cancel_order(&id).await.unwrap();
        assert_eq!(exchange.get_order_status(&id).await.unwrap().status, LegStatus::Cancelled);
        assert_eq!(exchange.open_order_count(), 0);
    }

    // ==== Position Tests ====

    #[tokio::test]
    async fn test_position_reporting_lag() {
        let exchange = PaperExchange::new(PaperExchangeConfig::default().with_position_lag(1));
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        exchange
            .submit_order(&request(Side::Sell, OrderKind::MakerPreferred, dec!(99)))
            .await
            .unwrap();

        assert!(exchange.get_positions().await.unwrap().is_empty());
        assert_eq!(exchange.get_positions().await.unwrap().get("ETH"), Some(&dec!(-10)));
    }

    #[tokio::test]
    async fn test_failed_position_reads() {
        let exchange = create_test_exchange();
        exchange.fail_position_reads(1);
        assert!(exchange.get_positions().await.is_err());
        assert!(exchange.get_positions().await.is_ok());
    }

    // ==== Stream Tests ====

    #[tokio::test]
    async fn test_order_updates_are_pushed() {
        let exchange = PaperExchange::new(PaperExchangeConfig::streaming());
        exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
        let mut updates = exchange.subscribe_order_updates().unwrap();

        exchange
            .submit_order(&request(Side::Buy, OrderKind::MakerPreferred, dec!(101)))
            .await
            .unwrap();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.status, LegStatus::Filled);
    }

    #[tokio::test]
    async fn test_quote_stream_requires_capability() {
        let exchange = create_test_exchange();
        assert!(exchange.subscribe_quotes("ETH").await.is_err());
        assert!(exchange.subscribe_order_updates().is_none());
    }

    #[tokio::test]
    async fn test_seeded_random_fills_are_reproducible() {
        let run = || async {
            let exchange = PaperExchange::new(PaperExchangeConfig::with_seed(7).fill_rate(0.5));
            exchange.set_quote(Quote::new("ETH", dec!(99), dec!(101), Utc::now()));
            exchange.set_default_plan(FillPlan::Random);
            let mut fills = Vec::new();
            for _ in 0..10 {
                let r = exchange
                    .submit_order(&request(Side::Buy, OrderKind::ImmediateOrCancel, dec!(101)))
                    .await
                    .unwrap();
                fills.push(r.filled_qty);
            }
            fills
        };
        assert_eq!(run().await, run().await);
    }
}
