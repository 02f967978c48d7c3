//! Position reconciler.
//!
//! Compares the local position cache against what the exchange reports and
//! overwrites local entries whose difference exceeds the tolerance. The
//! exchange is always authoritative. Running `reconcile` twice in a row with
//! no trading in between makes no further changes.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ExchangeError, ReconcileError};
use crate::exchange::ExchangeAdapter;
use crate::market_data::MarketDataFeed;
use pairtrade_core::{PositionTracker, ReconcilerConfig};

/// A local position replaced by the exchange's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionCorrection {
    pub instrument: String,
    pub local: Decimal,
    pub exchange: Decimal,
}

impl PositionCorrection {
    #[must_use]
    pub fn drift(&self) -> Decimal {
        self.exchange - self.local
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// True when no correction was needed.
    pub in_sync: bool,
    pub corrections: Vec<PositionCorrection>,
    /// Positions the exchange reported, zero entries omitted.
    pub exchange_positions: HashMap<String, Decimal>,
}

pub struct PositionReconciler {
    adapter: Arc<dyn ExchangeAdapter>,
    positions: Arc<RwLock<PositionTracker>>,
    config: ReconcilerConfig,
    instruments: Vec<String>,
    marks: Option<Arc<MarketDataFeed>>,
}

impl PositionReconciler {
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        positions: Arc<RwLock<PositionTracker>>,
        config: ReconcilerConfig,
        instruments: Vec<String>,
    ) -> Self {
        Self {
            adapter,
            positions,
            config,
            instruments,
            marks: None,
        }
    }

    /// Uses the feed's mid price as entry price for positions that appear
    /// or change side during a correction.
    #[must_use]
    pub fn with_marks(mut self, feed: Arc<MarketDataFeed>) -> Self {
        self.marks = Some(feed);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Fetches exchange positions and corrects local drift.
    ///
    /// # Errors
    ///
    /// `ReconcileError::Exchange` if positions could not be fetched within
    /// the retry budget. The local cache is untouched in that case.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let exchange = self.fetch_positions().await?;
        Ok(self.apply(&exchange, &BTreeSet::new()))
    }

    /// Waits for the exchange to report `expected` positions, retrying with a
    /// short delay to ride out reporting lag.
    ///
    /// Whatever the outcome, the local cache ends up matching the last
    /// exchange report.
    ///
    /// # Errors
    ///
    /// `Mismatch` when the exchange still disagrees after the last attempt,
    /// or `Exchange` when positions could never be fetched.
    pub async fn verify(
        &self,
        expected: &HashMap<String, Decimal>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let attempts = self.config.max_attempts.max(1);
        let extra: BTreeSet<String> = expected.keys().cloned().collect();
        let mut last_exchange = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.adapter.get_positions().await {
                Ok(exchange) => {
                    let mismatch = expected.iter().find(|(instrument, qty)| {
                        let observed = exchange.get(*instrument).copied().unwrap_or(Decimal::ZERO);
                        (observed - **qty).abs() > self.config.tolerance
                    });
                    if mismatch.is_none() {
                        debug!(attempt, "Exchange positions match expectation");
                        return Ok(self.apply(&exchange, &extra));
                    }
                    last_exchange = Some(exchange);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Position fetch failed during verify");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        let Some(exchange) = last_exchange else {
            return Err(ReconcileError::Exchange(last_error.unwrap_or_else(|| {
                ExchangeError::Api("no position report".to_string())
            })));
        };
        self.apply(&exchange, &extra);

        let (instrument, expected_qty, observed) = expected
            .iter()
            .map(|(i, q)| (i, *q, exchange.get(i).copied().unwrap_or(Decimal::ZERO)))
            .find(|(_, q, observed)| (*observed - *q).abs() > self.config.tolerance)
            .map(|(i, q, o)| (i.clone(), q, o))
            .unwrap_or_default();
        Err(ReconcileError::Mismatch {
            instrument,
            expected: expected_qty,
            observed,
            attempts,
        })
    }

    /// Exchange positions, retrying transient failures.
    async fn fetch_positions(&self) -> Result<HashMap<String, Decimal>, ReconcileError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.adapter.get_positions().await {
                Ok(positions) => return Ok(positions),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(attempt, error = %e, "Position fetch failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Position fetch failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Overwrites local entries that drift beyond tolerance.
    fn apply(&self, exchange: &HashMap<String, Decimal>, extra: &BTreeSet<String>) -> ReconcileReport {
        let mut instruments: BTreeSet<String> = self.instruments.iter().cloned().collect();
        instruments.extend(extra.iter().cloned());

        let mut corrections = Vec::new();
        let mut tracker = self.positions.write();
        for instrument in instruments {
            let observed = exchange.get(&instrument).copied().unwrap_or(Decimal::ZERO);
            let local = tracker.quantity(&instrument);
            if (observed - local).abs() <= self.config.tolerance {
                continue;
            }

            let entry_price = self
                .marks
                .as_ref()
                .and_then(|feed| feed.snapshot(&instrument))
                .map(|s| s.quote.mid())
                .or_else(|| tracker.get_position(&instrument).map(|p| p.avg_price))
                .unwrap_or(Decimal::ZERO);
            tracker.overwrite(&instrument, observed, entry_price);

            warn!(
                instrument = %instrument,
                local = %local,
                exchange = %observed,
                "Position drift corrected from exchange"
            );
            corrections.push(PositionCorrection {
                instrument,
                local,
                exchange: observed,
            });
        }

        if corrections.is_empty() {
            debug!("Positions in sync");
        } else {
            info!(corrections = corrections.len(), "Reconciliation applied corrections");
        }
        ReconcileReport {
            in_sync: corrections.is_empty(),
            corrections,
            exchange_positions: exchange.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperExchange, PaperExchangeConfig};
    use crate::types::{OrderKind, OrderRequest, Quote};
    use chrono::Utc;
    use pairtrade_core::{FillEvent, Side};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use uuid::Uuid;

    fn create_test_reconciler(
        config: PaperExchangeConfig,
    ) -> (Arc<PaperExchange>, Arc<RwLock<PositionTracker>>, PositionReconciler) {
        let exchange = Arc::new(PaperExchange::new(config));
        let positions = Arc::new(RwLock::new(PositionTracker::new()));
        let reconciler = PositionReconciler::new(
            exchange.clone(),
            positions.clone(),
            ReconcilerConfig::default()
                .with_retry_delay(Duration::from_millis(1))
                .with_max_attempts(4),
            vec!["A".to_string(), "B".to_string()],
        );
        (exchange, positions, reconciler)
    }

    fn local_fill(positions: &RwLock<PositionTracker>, instrument: &str, side: Side, qty: Decimal) {
        let _ = positions
            .write()
            .process_fill(&FillEvent::new("local", instrument, side, qty, dec!(100)));
    }

    // ==== Reconcile Tests ====

    #[tokio::test]
    async fn test_in_sync_makes_no_corrections() {
        let (exchange, positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        exchange.set_position("A", dec!(10));
        local_fill(&positions, "A", Side::Buy, dec!(10));

        let report = reconciler.reconcile().await.unwrap();
        assert!(report.in_sync);
        assert!(report.corrections.is_empty());
    }

    #[tokio::test]
    async fn test_drift_is_overwritten_and_idempotent() {
        let (exchange, positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        exchange.set_position("A", dec!(8));
        exchange.set_position("B", dec!(-5));
        local_fill(&positions, "A", Side::Buy, dec!(10));

        let first = reconciler.reconcile().await.unwrap();
        assert!(!first.in_sync);
        assert_eq!(first.corrections.len(), 2);
        assert_eq!(positions.read().quantity("A"), dec!(8));
        assert_eq!(positions.read().quantity("B"), dec!(-5));
        assert_eq!(positions.read().get_position("A").unwrap().avg_price, dec!(100));

        let snapshot = positions.read().clone();
        let second = reconciler.reconcile().await.unwrap();
        assert!(second.in_sync);
        assert_eq!(positions.read().all_positions(), snapshot.all_positions());
    }

    #[tokio::test]
    async fn test_small_difference_within_tolerance() {
        let (exchange, positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        exchange.set_position("A", dec!(10.0005));
        local_fill(&positions, "A", Side::Buy, dec!(10));

        assert!(reconciler.reconcile().await.unwrap().in_sync);
        assert_eq!(positions.read().quantity("A"), dec!(10));
    }

    #[tokio::test]
    async fn test_position_missing_on_exchange_is_cleared() {
        let (_exchange, positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        local_fill(&positions, "B", Side::Sell, dec!(3));

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.corrections[0].drift(), dec!(3));
        assert!(positions.read().get_position("B").is_none());
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let (exchange, _positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        exchange.fail_position_reads(2);
        assert!(reconciler.reconcile().await.is_ok());

        exchange.fail_position_reads(10);
        assert!(matches!(reconciler.reconcile().await, Err(ReconcileError::Exchange(_))));
    }

    // ==== Verify Tests ====

    #[tokio::test]
    async fn test_verify_rides_out_reporting_lag() {
        let (exchange, positions, reconciler) =
            create_test_reconciler(PaperExchangeConfig::default().with_position_lag(2));
        exchange.set_quote(Quote::new("A", dec!(99), dec!(101), Utc::now()));
        exchange
            .submit_order(&OrderRequest {
                client_order_id: Uuid::new_v4(),
                instrument: "A".to_string(),
                side: Side::Buy,
                quantity: dec!(4),
                price: dec!(101),
                kind: OrderKind::ImmediateOrCancel,
            })
            .await
            .unwrap();
        local_fill(&positions, "A", Side::Buy, dec!(4));

        let expected = HashMap::from([("A".to_string(), dec!(4))]);
        let report = reconciler.verify(&expected).await.unwrap();
        assert!(report.in_sync);
        assert_eq!(positions.read().quantity("A"), dec!(4));
    }

    #[tokio::test]
    async fn test_verify_persistent_mismatch() {
        let (exchange, positions, reconciler) = create_test_reconciler(PaperExchangeConfig::default());
        exchange.set_position("A", dec!(2));
        local_fill(&positions, "A", Side::Buy, dec!(5));

        let expected = HashMap::from([("A".to_string(), Decimal::ZERO)]);
        let err = reconciler.verify(&expected).await.unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Mismatch {
                instrument: "A".to_string(),
                expected: Decimal::ZERO,
                observed: dec!(2),
                attempts: 4,
            }
        );
        assert_eq!(positions.read().quantity("A"), dec!(2));
    }
}
