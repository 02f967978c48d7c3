//! Leg submitter.
//!
//! Submits one order and follows it to a terminal state, preferring pushed
//! order updates and polling otherwise. A leg that is still working at its
//! deadline is cancelled and reported as `TimedOut` with whatever filled.
//! The submitter never retries; that is the resolver's job.

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeAdapter;
use crate::regime::SpreadRegime;
use crate::types::{FillResult, LegSpec, LegStatus};
use pairtrade_core::SubmitterConfig;

/// Wait budget for one leg: a base plus a per-unit allowance, shortened
/// while spreads widen and lengthened while they narrow.
#[must_use]
pub fn deadline_for(config: &SubmitterConfig, quantity: Decimal, regime: SpreadRegime) -> Duration {
    let base = Decimal::from(u64::try_from(config.base_deadline.as_millis()).unwrap_or(u64::MAX));
    let factor = match regime {
        SpreadRegime::Widening => config.widening_factor,
        SpreadRegime::Stable => Decimal::ONE,
        SpreadRegime::Narrowing => config.narrowing_factor,
    };
    let millis = (base + config.deadline_per_unit_ms * quantity.abs()) * factor;
    let deadline = Duration::from_millis(millis.round().to_u64().unwrap_or(u64::MAX));
    deadline.max(config.min_deadline).min(config.max_deadline)
}

/// Order ids that may still be working on the exchange.
#[derive(Debug, Default)]
pub struct OpenOrders {
    ids: Mutex<HashSet<String>>,
}

impl OpenOrders {
    pub fn insert(&self, order_id: &str) {
        self.ids.lock().insert(order_id.to_string());
    }

    pub fn remove(&self, order_id: &str) {
        self.ids.lock().remove(order_id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// One submitted order, owned by the submitter until it concludes.
#[derive(Debug, Clone)]
struct Leg {
    spec: LegSpec,
    order_id: Option<String>,
    status: LegStatus,
    filled_qty: Decimal,
    avg_price: Option<Decimal>,
    error: Option<String>,
}

impl Leg {
    const fn new(spec: LegSpec) -> Self {
        Self {
            spec,
            order_id: None,
            status: LegStatus::Open,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error: None,
        }
    }

    /// Applies an exchange report. Fills only grow and a terminal status sticks.
    fn apply(&mut self, update: &FillResult) {
        if update.filled_qty >= self.filled_qty {
            self.filled_qty = update.filled_qty;
            if update.avg_price.is_some() {
                self.avg_price = update.avg_price;
            }
        }
        if !self.status.is_terminal() {
            self.status = update.status;
        }
        if self.filled_qty >= self.spec.quantity {
            self.status = LegStatus::Filled;
        }
        if update.error.is_some() {
            self.error.clone_from(&update.error);
        }
    }

    fn into_result(self) -> FillResult {
        FillResult {
            order_id: self.order_id,
            status: self.status,
            filled_qty: self.filled_qty,
            avg_price: self.avg_price,
            error: self.error,
        }
    }
}

pub struct LegSubmitter {
    adapter: Arc<dyn ExchangeAdapter>,
    config: SubmitterConfig,
    order_stream: bool,
    open_orders: Arc<OpenOrders>,
    shutdown: watch::Receiver<bool>,
}

impl LegSubmitter {
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        config: SubmitterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let order_stream = adapter.capabilities().order_stream;
        Self {
            adapter,
            config,
            order_stream,
            open_orders: Arc::new(OpenOrders::default()),
            shutdown,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    #[must_use]
    pub fn open_orders(&self) -> &OpenOrders {
        &self.open_orders
    }

    #[must_use]
    pub fn deadline_for(&self, quantity: Decimal, regime: SpreadRegime) -> Duration {
        deadline_for(&self.config, quantity, regime)
    }

    /// Submits `spec` and waits up to `deadline` for a terminal state.
    ///
    /// Never fails: rejections come back as `Rejected`, and a submission
    /// whose outcome is unknown comes back as `TimedOut` with zero fill and
    /// an error, to be settled by reconciliation.
    pub async fn submit(&self, spec: &LegSpec, deadline: Duration) -> FillResult {
        if *self.shutdown.borrow() {
            return FillResult::rejected(None, "shutdown in progress");
        }
        if spec.quantity <= Decimal::ZERO {
            return FillResult::skipped();
        }

        let mut leg = Leg::new(spec.clone());
        // Subscribe before submitting so no update is missed.
        let mut updates = if self.order_stream {
            self.adapter.subscribe_order_updates()
        } else {
            None
        };

        let ack = match self.adapter.submit_order(&spec.to_request()).await {
            Ok(ack) => ack,
            Err(e) if e.is_rejection() => {
                warn!(
                    leg = %spec.leg,
                    instrument = %spec.instrument,
                    side = %spec.side,
                    error = %e,
                    "Leg rejected"
                );
                return FillResult::rejected(None, &e.to_string());
            }
            Err(e) => {
                warn!(
                    leg = %spec.leg,
                    instrument = %spec.instrument,
                    error = %e,
                    "Leg submission outcome unknown"
                );
                leg.status = LegStatus::TimedOut;
                leg.error = Some(format!("submission outcome unknown: {e}"));
                return leg.into_result();
            }
        };

        let Some(order_id) = ack.order_id.clone() else {
            leg.apply(&ack);
            if !leg.status.is_terminal() {
                leg.status = LegStatus::TimedOut;
            }
            leg.error = Some("exchange acknowledged without an order id".to_string());
            return leg.into_result();
        };
        leg.order_id = Some(order_id.clone());
        leg.apply(&ack);

        if !leg.status.is_terminal() {
            self.open_orders.insert(&order_id);
            let mut shutdown = self.shutdown.clone();
            let waited = tokio::time::timeout(
                deadline,
                self.wait_for_terminal(&mut leg, &order_id, &mut updates, &mut shutdown),
            )
            .await;
            if waited.is_err() || !leg.status.is_terminal() {
                self.cancel_and_settle(&mut leg, &order_id).await;
            }
            self.open_orders.remove(&order_id);
        }

        info!(
            leg = %spec.leg,
            order_id = %order_id,
            instrument = %spec.instrument,
            side = %spec.side,
            target = %spec.quantity,
            filled = %leg.filled_qty,
            status = %leg.status,
            "Leg concluded"
        );
        leg.into_result()
    }

    async fn wait_for_terminal(
        &self,
        leg: &mut Leg,
        order_id: &str,
        updates: &mut Option<broadcast::Receiver<FillResult>>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(order_id = %order_id, "Shutdown interrupted leg wait");
                        return;
                    }
                }
                update = next_update(updates) => match update {
                    Some(update) if update.order_id.as_deref() == Some(order_id) => {
                        leg.apply(&update);
                        if leg.status.is_terminal() {
                            return;
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!(order_id = %order_id, "Order update stream closed, polling only");
                        *updates = None;
                    }
                },
                _ = poll.tick() => match self.adapter.get_order_status(order_id).await {
                    Ok(update) => {
                        leg.apply(&update);
                        if leg.status.is_terminal() {
                            return;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(order_id = %order_id, error = %e, "Order status poll failed, retrying");
                    }
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "Order status poll failed");
                    }
                },
            }
        }
    }

    /// Cancels a working order and records its final fill.
    async fn cancel_and_settle(&self, leg: &mut Leg, order_id: &str) {
        if let Err(e) = self.adapter.cancel_order(order_id).await {
            warn!(order_id = %order_id, error = %e, "Cancel failed, reading final state anyway");
        }
        match self.adapter.get_order_status(order_id).await {
            Ok(update) => leg.apply(&update),
            Err(e) => warn!(order_id = %order_id, error = %e, "Final order state unavailable"),
        }
        leg.status = if leg.filled_qty >= leg.spec.quantity {
            LegStatus::Filled
        } else {
            LegStatus::TimedOut
        };
    }

    /// Cancels every order still tracked as open. Failures are logged and skipped.
    pub async fn sweep_open_orders(&self) -> usize {
        let ids = self.open_orders.snapshot();
        let mut cancelled = 0;
        for order_id in &ids {
            match self.adapter.cancel_order(order_id).await {
                Ok(()) => {
                    cancelled += 1;
                    self.open_orders.remove(order_id);
                }
                Err(e) => warn!(order_id = %order_id, error = %e, "Sweep cancel failed"),
            }
        }
        if !ids.is_empty() {
            info!(tracked = ids.len(), cancelled, "Swept open orders");
        }
        cancelled
    }
}

async fn next_update(updates: &mut Option<broadcast::Receiver<FillResult>>) -> Option<FillResult> {
    let Some(rx) = updates.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(update) => return Some(update),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Order update stream lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
