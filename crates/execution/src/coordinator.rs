//! Pair execution coordinator.
//!
//! Runs one BUILD or UNWIND cycle at a time:
//!
//! 1. refuse if halted or shutting down
//! 2. price both legs from fresh snapshots, equal notional on BUILD
//! 3. pre-trade safety check, including the cycle's projected P&L
//! 4. submit both legs concurrently under the cycle deadline
//! 5. hand asymmetric outcomes to the [`PartialFillResolver`]
//! 6. verify the final book against the exchange
//! 7. post-trade safety check; a violation unwinds and halts
//!
//! Cycles are strictly sequential: `execute_cycle` holds a lock for its
//! whole duration.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PricingError, ReconcileError, SetupError};
use crate::exchange::ExchangeAdapter;
use crate::market_data::MarketDataFeed;
use crate::pricing::PricingEngine;
use crate::reconciler::{PositionReconciler, ReconcileReport};
use crate::resolver::{record_fill, LegExecution, PairExecution, PartialFillResolver, Resolution};
use crate::safety::{CycleIntent, IntentLeg, SafetyGuard, SafetyStatus, SafetyViolation};
use crate::submitter::LegSubmitter;
use crate::types::{
    CycleFailure, CycleOutcome, CyclePhase, CycleResult, FillResult, LegId, LegReport, LegSpec,
    LegStatus, MarketSnapshot, OrderKind,
};
use pairtrade_core::{AppConfig, InstrumentConfig, Position, PositionTracker, Side};

pub struct PairExecutionCoordinator {
    config: AppConfig,
    instrument_a: InstrumentConfig,
    instrument_b: InstrumentConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    feed: Arc<MarketDataFeed>,
    pricing: PricingEngine,
    submitter: Arc<LegSubmitter>,
    resolver: PartialFillResolver,
    reconciler: Arc<PositionReconciler>,
    safety: Arc<SafetyGuard>,
    positions: Arc<RwLock<PositionTracker>>,
    cycle_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl PairExecutionCoordinator {
    /// Wires every component from one validated configuration.
    ///
    /// # Errors
    ///
    /// `SetupError` when the configuration is invalid or a pair instrument
    /// is missing.
    pub fn new(config: AppConfig, adapter: Arc<dyn ExchangeAdapter>) -> Result<Self, SetupError> {
        let lookup = |id: &str| {
            config
                .instrument(id)
                .cloned()
                .ok_or_else(|| SetupError::MissingInstrument(id.to_string()))
        };
        let instrument_a = lookup(&config.pair.leg_a)?;
        let instrument_b = lookup(&config.pair.leg_b)?;
        config
            .validate()
            .map_err(|e| SetupError::InvalidConfig(format!("{e:#}")))?;
        let ids = vec![instrument_a.id.clone(), instrument_b.id.clone()];

        let positions = Arc::new(RwLock::new(PositionTracker::new()));
        let feed = Arc::new(MarketDataFeed::new(
            Arc::clone(&adapter),
            &ids,
            config.market_data.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let submitter = Arc::new(LegSubmitter::new(
            Arc::clone(&adapter),
            config.submitter.clone(),
            shutdown_rx,
        ));
        let reconciler = Arc::new(
            PositionReconciler::new(
                Arc::clone(&adapter),
                Arc::clone(&positions),
                config.reconciler.clone(),
                ids,
            )
            .with_marks(Arc::clone(&feed)),
        );
        let safety = Arc::new(SafetyGuard::new(
            config.safety.clone(),
            config.pair.target_notional,
        ));
        let pricing = PricingEngine::new(config.pricing.clone());
        let resolver = PartialFillResolver::new(
            config.resolver.clone(),
            pricing.clone(),
            Arc::clone(&feed),
            Arc::clone(&submitter),
            Arc::clone(&reconciler),
            Arc::clone(&safety),
            Arc::clone(&positions),
            (instrument_a.clone(), instrument_b.clone()),
        );

        info!(
            leg_a = %instrument_a.id,
            leg_b = %instrument_b.id,
            target_notional = %config.pair.target_notional,
            "Pair execution coordinator ready"
        );
        Ok(Self {
            config,
            instrument_a,
            instrument_b,
            adapter,
            feed,
            pricing,
            submitter,
            resolver,
            reconciler,
            safety,
            positions,
            cycle_lock: Mutex::new(()),
            shutdown,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts market data and aligns local positions with the exchange.
    ///
    /// # Errors
    ///
    /// The reconciliation error if exchange positions cannot be fetched.
    pub async fn start(&self) -> Result<ReconcileReport, ReconcileError> {
        self.feed.start().await;
        self.reconciler.reconcile().await
    }

    /// Interrupts any waiting leg, stops market data and cancels every
    /// order still tracked as open. Returns the number of orders cancelled.
    pub async fn shutdown(&self) -> usize {
        info!("Shutting down pair execution");
        self.shutdown.send_replace(true);
        let swept = self.submitter.sweep_open_orders().await;
        self.feed.stop().await;
        swept
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[must_use]
    pub fn current_positions(&self) -> HashMap<String, Position> {
        self.positions.read().all_positions().clone()
    }

    #[must_use]
    pub fn safety_status(&self) -> SafetyStatus {
        self.safety.status()
    }

    #[must_use]
    pub fn safety(&self) -> &SafetyGuard {
        &self.safety
    }

    #[must_use]
    pub fn feed(&self) -> &MarketDataFeed {
        &self.feed
    }

    /// Clears a halt after the operator resolved its cause.
    pub fn clear_halt(&self) -> Option<SafetyViolation> {
        self.safety.clear_halt()
    }

    /// Halts trading by hand.
    pub fn halt(&self, reason: &str) {
        self.safety.halt(SafetyViolation::Halted {
            reason: reason.to_string(),
        });
    }

    /// On-demand reconciliation against the exchange.
    ///
    /// # Errors
    ///
    /// `ReconcileError::Exchange` when positions cannot be fetched.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _cycle = self.cycle_lock.lock().await;
        self.reconciler.reconcile().await
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Executes one BUILD or UNWIND cycle and reports how it ended.
    pub async fn execute_cycle(&self, phase: CyclePhase) -> CycleResult {
        let _cycle = self.cycle_lock.lock().await;
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.safety.roll_day(started_at);

        let refused = |failure: CycleFailure| {
            warn!(cycle_id = %cycle_id, phase = %phase, reason = %failure, "Cycle not attempted");
            CycleResult::not_attempted(cycle_id, phase, failure, started_at)
        };

        if self.is_shutting_down() {
            return refused(CycleFailure::ShuttingDown);
        }
        if let Some(reason) = self.safety.halt_reason() {
            return refused(CycleFailure::Halted(reason.to_string()));
        }

        let snapshots = match self.fresh_snapshots().await {
            Ok(snapshots) => snapshots,
            Err((leg, e)) => {
                return refused(CycleFailure::Pricing {
                    leg,
                    reason: e.to_string(),
                })
            }
        };
        let specs = match phase {
            CyclePhase::Build => self.plan_build(&snapshots),
            CyclePhase::Unwind => self.plan_unwind(&snapshots),
        };
        let [spec_a, spec_b] = match specs {
            Ok(specs) => specs,
            Err(failure) => return refused(failure),
        };

        let marks = Self::marks_from(&snapshots);
        let intent = self.intent(phase, [&spec_a, &spec_b], &marks);
        let tracker = self.positions.read().clone();
        if let Err(violation) = self.safety.pre_trade_check(&intent, &tracker, &marks) {
            return refused(CycleFailure::SafetyBlocked(violation.to_string()));
        }

        let baseline: HashMap<String, Decimal> = [&spec_a, &spec_b]
            .iter()
            .map(|s| (s.instrument.clone(), tracker.quantity(&s.instrument)))
            .collect();

        info!(
            cycle_id = %cycle_id,
            phase = %phase,
            qty_a = %spec_a.quantity,
            price_a = %spec_a.price,
            qty_b = %spec_b.quantity,
            price_b = %spec_b.price,
            projected_pnl = %intent.projected_pnl.round_dp(4),
            "Executing cycle"
        );

        let [fill_a, fill_b] = self
            .submit_legs([&spec_a, &spec_b], [&snapshots[0], &snapshots[1]], &baseline)
            .await;
        let mut realized_pnl = record_fill(&self.positions, &spec_a, &fill_a)
            + record_fill(&self.positions, &spec_b, &fill_b);

        let mut pair = PairExecution {
            cycle_id,
            phase,
            a: LegExecution {
                spec: spec_a,
                fill: fill_a,
            },
            b: LegExecution {
                spec: spec_b,
                fill: fill_b,
            },
            baseline,
        };

        let mut resolution = if !pair.a.fill.has_fills() && !pair.b.fill.has_fills() {
            Resolution {
                success: false,
                outcome: CycleOutcome::NoFill,
                failure: Some(CycleFailure::NoFill),
                realized_pnl: Decimal::ZERO,
                residual_delta: Decimal::ZERO,
            }
        } else {
            self.resolver.resolve(&mut pair).await
        };
        realized_pnl += resolution.realized_pnl;

        if resolution.outcome != CycleOutcome::Fatal {
            if let Err(violation) = self.verify_book(&pair).await {
                resolution = Self::fatal(violation);
            }
        }
        // Booked before the post-trade gate, which checks the day's loss.
        self.safety.record_realized_pnl(realized_pnl);
        if resolution.outcome != CycleOutcome::Fatal {
            if let Some((violation, pnl)) = self.post_trade(&pair).await {
                self.safety.record_realized_pnl(pnl);
                realized_pnl += pnl;
                resolution = Self::fatal(violation);
            }
        }

        let net_delta = SafetyGuard::net_delta(&self.positions.read(), &self.current_marks());
        self.safety.set_residual_delta(net_delta);
        self.safety.record_cycle(resolution.success);

        let result = CycleResult {
            cycle_id,
            phase,
            success: resolution.success,
            outcome: resolution.outcome,
            failure: resolution.failure,
            legs: vec![
                LegReport::new(&pair.a.spec, &pair.a.fill),
                LegReport::new(&pair.b.spec, &pair.b.fill),
            ],
            realized_pnl,
            residual_delta: resolution.residual_delta,
            started_at,
            finished_at: Utc::now(),
        };

        if result.success {
            info!(
                cycle_id = %cycle_id,
                phase = %phase,
                outcome = ?result.outcome,
                realized_pnl = %realized_pnl.round_dp(4),
                net_delta = %net_delta.round_dp(4),
                "Cycle completed"
            );
        } else {
            warn!(
                cycle_id = %cycle_id,
                phase = %phase,
                outcome = ?result.outcome,
                reason = %result.reason().unwrap_or_default(),
                realized_pnl = %realized_pnl.round_dp(4),
                "Cycle failed"
            );
        }
        result
    }

    fn fatal(violation: SafetyViolation) -> Resolution {
        Resolution {
            success: false,
            outcome: CycleOutcome::Fatal,
            failure: Some(CycleFailure::Fatal(violation.to_string())),
            realized_pnl: Decimal::ZERO,
            residual_delta: Decimal::ZERO,
        }
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Latest snapshot per leg, pulled again when missing or stale.
    async fn fresh_snapshots(&self) -> Result<[MarketSnapshot; 2], (LegId, PricingError)> {
        let a = self.fresh_snapshot(&self.instrument_a.id).await.map_err(|e| (LegId::A, e))?;
        let b = self.fresh_snapshot(&self.instrument_b.id).await.map_err(|e| (LegId::B, e))?;
        Ok([a, b])
    }

    async fn fresh_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, PricingError> {
        let max_age = self.pricing.config().max_quote_age;
        if let Some(snapshot) = self.feed.snapshot(instrument) {
            if !snapshot.quote.is_stale(max_age, Utc::now()) {
                return Ok(snapshot);
            }
        }
        self.feed.refresh(instrument).await.map_err(|e| {
            warn!(instrument = %instrument, error = %e, "Quote refresh failed");
            PricingError::NoQuote {
                instrument: instrument.to_string(),
            }
        })
    }

    /// Buy A, sell B, both sized to the same notional.
    fn plan_build(&self, snapshots: &[MarketSnapshot; 2]) -> Result<[LegSpec; 2], CycleFailure> {
        let now = Utc::now();
        let target = self.config.pair.target_notional;
        let pricing_failure = |leg: LegId| {
            move |e: PricingError| CycleFailure::Pricing {
                leg,
                reason: e.to_string(),
            }
        };

        let a = self
            .pricing
            .price_and_size(&self.instrument_a, Side::Buy, &snapshots[0], target, Decimal::ZERO, now)
            .map_err(pricing_failure(LegId::A))?;
        let b = self
            .pricing
            .price_and_size(&self.instrument_b, Side::Sell, &snapshots[1], target, Decimal::ZERO, now)
            .map_err(pricing_failure(LegId::B))?;

        // Depth clamps act per leg; bring both back to the smaller notional.
        let notional = a.notional().min(b.notional());
        let qty_a = self.instrument_a.round_quantity_down(notional / a.price);
        let qty_b = self.instrument_b.round_quantity_down(notional / b.price);
        for (leg, qty, priced) in [(LegId::A, qty_a, &a), (LegId::B, qty_b, &b)] {
            if qty <= Decimal::ZERO {
                return Err(pricing_failure(leg)(PricingError::ZeroQuantity {
                    instrument: priced.instrument.clone(),
                    notional,
                    price: priced.price,
                }));
            }
        }

        Ok([
            LegSpec {
                leg: LegId::A,
                instrument: a.instrument,
                side: a.side,
                quantity: qty_a,
                price: a.price,
                kind: OrderKind::MakerPreferred,
                reference_price: a.reference_price,
            },
            LegSpec {
                leg: LegId::B,
                instrument: b.instrument,
                side: b.side,
                quantity: qty_b,
                price: b.price,
                kind: OrderKind::MakerPreferred,
                reference_price: b.reference_price,
            },
        ])
    }

    /// Closes each instrument's current position. A flat leg gets a zero
    /// quantity and is skipped by the submitter.
    fn plan_unwind(&self, snapshots: &[MarketSnapshot; 2]) -> Result<[LegSpec; 2], CycleFailure> {
        let now = Utc::now();
        let tracker = self.positions.read().clone();
        let legs = [
            (LegId::A, &self.instrument_a, &snapshots[0]),
            (LegId::B, &self.instrument_b, &snapshots[1]),
        ];

        let open: Vec<Decimal> = legs
            .iter()
            .map(|(_, instrument, _)| {
                let qty = tracker.quantity(&instrument.id);
                let rounded = instrument.round_quantity_down(qty.abs());
                if qty.is_sign_negative() {
                    -rounded
                } else {
                    rounded
                }
            })
            .collect();
        if open.iter().all(Decimal::is_zero) {
            return Err(CycleFailure::NothingToUnwind);
        }

        let mut specs = Vec::with_capacity(2);
        for ((leg, instrument, snapshot), position) in legs.into_iter().zip(open) {
            let side = Side::closing(position);
            if position.is_zero() {
                specs.push(LegSpec {
                    leg,
                    instrument: instrument.id.clone(),
                    side,
                    quantity: Decimal::ZERO,
                    price: Decimal::ZERO,
                    kind: OrderKind::MakerPreferred,
                    reference_price: snapshot.quote.touch(side),
                });
                continue;
            }
            let priced = self
                .pricing
                .price_for_quantity(instrument, side, snapshot, position.abs(), Decimal::ZERO, now)
                .map_err(|e| CycleFailure::Pricing {
                    leg,
                    reason: e.to_string(),
                })?;
            specs.push(LegSpec {
                leg,
                instrument: priced.instrument,
                side: priced.side,
                quantity: priced.quantity,
                price: priced.price,
                kind: OrderKind::MakerPreferred,
                reference_price: priced.reference_price,
            });
        }

        let mut specs = specs.into_iter();
        match (specs.next(), specs.next()) {
            (Some(a), Some(b)) => Ok([a, b]),
            _ => Err(CycleFailure::NothingToUnwind),
        }
    }

    /// What the safety guard sees of a planned cycle.
    ///
    /// BUILD projects the cost of crossing to the limit price from mid;
    /// UNWIND projects the P&L of closing at the limit price.
    fn intent(&self, phase: CyclePhase, specs: [&LegSpec; 2], marks: &HashMap<String, Decimal>) -> CycleIntent {
        let tracker = self.positions.read();
        let projected_pnl: Decimal = specs
            .iter()
            .filter(|s| s.quantity > Decimal::ZERO)
            .map(|s| match phase {
                CyclePhase::Build => {
                    let mid = marks.get(&s.instrument).copied().unwrap_or(s.price);
                    -(s.price - mid).abs() * s.quantity
                }
                CyclePhase::Unwind => tracker
                    .get_position(&s.instrument)
                    .map_or(Decimal::ZERO, |p| p.closing_pnl(s.price, s.quantity)),
            })
            .sum();

        CycleIntent {
            phase,
            legs: specs
                .iter()
                .filter(|s| s.quantity > Decimal::ZERO)
                .map(|s| IntentLeg {
                    instrument: s.instrument.clone(),
                    quantity_change: s.side.sign() * s.quantity,
                    price: s.price,
                })
                .collect(),
            projected_pnl,
        }
    }

    fn marks_from(snapshots: &[MarketSnapshot; 2]) -> HashMap<String, Decimal> {
        snapshots
            .iter()
            .map(|s| (s.quote.instrument.clone(), s.quote.mid()))
            .collect()
    }

    fn current_marks(&self) -> HashMap<String, Decimal> {
        [&self.instrument_a.id, &self.instrument_b.id]
            .into_iter()
            .filter_map(|id| self.feed.snapshot(id).map(|s| (id.clone(), s.quote.mid())))
            .collect()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Submits both legs concurrently under the cycle deadline.
    ///
    /// When the deadline fires, open orders are swept and fills are derived
    /// from the exchange's position change. Legs whose submission outcome is
    /// unknown are settled the same way.
    async fn submit_legs(
        &self,
        specs: [&LegSpec; 2],
        snapshots: [&MarketSnapshot; 2],
        baseline: &HashMap<String, Decimal>,
    ) -> [FillResult; 2] {
        let deadline_a = self.submitter.deadline_for(specs[0].quantity, snapshots[0].regime);
        let deadline_b = self.submitter.deadline_for(specs[1].quantity, snapshots[1].regime);

        let joined = tokio::time::timeout(self.config.pair.cycle_deadline, async {
            tokio::join!(
                self.submitter.submit(specs[0], deadline_a),
                self.submitter.submit(specs[1], deadline_b)
            )
        })
        .await;

        let fills = match joined {
            Ok((a, b)) => [a, b],
            Err(_) => {
                warn!(
                    deadline_ms = self.config.pair.cycle_deadline.as_millis() as u64,
                    "Cycle deadline elapsed, sweeping open orders"
                );
                self.submitter.sweep_open_orders().await;
                let timed_out = || FillResult {
                    order_id: None,
                    status: LegStatus::TimedOut,
                    filled_qty: Decimal::ZERO,
                    avg_price: None,
                    error: Some("cycle deadline elapsed".to_string()),
                };
                [timed_out(), timed_out()]
            }
        };

        if !fills.iter().any(FillResult::outcome_unknown) {
            return fills;
        }
        self.settle_from_positions(specs, fills, baseline).await
    }

    /// Replaces fills of unknown outcome with what the exchange's positions
    /// show was executed, priced at the leg's limit.
    async fn settle_from_positions(
        &self,
        specs: [&LegSpec; 2],
        fills: [FillResult; 2],
        baseline: &HashMap<String, Decimal>,
    ) -> [FillResult; 2] {
        let exchange = match self.adapter.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "Cannot settle unknown leg outcomes, positions unavailable");
                return fills;
            }
        };

        let mut settled = fills;
        for (spec, fill) in specs.iter().zip(settled.iter_mut()) {
            if !fill.outcome_unknown() {
                continue;
            }
            let before = baseline.get(&spec.instrument).copied().unwrap_or(Decimal::ZERO);
            let after = exchange.get(&spec.instrument).copied().unwrap_or(Decimal::ZERO);
            let executed = (spec.side.sign() * (after - before))
                .max(Decimal::ZERO)
                .min(spec.quantity);
            if executed > Decimal::ZERO {
                fill.filled_qty = executed;
                fill.avg_price = Some(spec.price);
            }
            warn!(
                leg = %spec.leg,
                instrument = %spec.instrument,
                executed = %executed,
                "Leg settled from exchange positions"
            );
        }
        settled
    }

    /// Confirms the exchange agrees with the local book after the cycle.
    async fn verify_book(&self, pair: &PairExecution) -> Result<(), SafetyViolation> {
        let expected: HashMap<String, Decimal> = {
            let tracker = self.positions.read();
            [&pair.a.spec.instrument, &pair.b.spec.instrument]
                .into_iter()
                .map(|id| (id.clone(), tracker.quantity(id)))
                .collect()
        };

        match self.reconciler.verify(&expected).await {
            Ok(_) => Ok(()),
            Err(ReconcileError::Mismatch {
                instrument,
                expected,
                observed,
                ..
            }) => {
                let violation = SafetyViolation::ReconciliationMismatch {
                    instrument,
                    observed: (observed - expected).abs(),
                    threshold: self.reconciler.config().tolerance,
                };
                self.safety.halt(violation.clone());
                Err(violation)
            }
            Err(e) => {
                error!(cycle_id = %pair.cycle_id, error = %e, "Post-cycle verification unavailable");
                Ok(())
            }
        }
    }

    /// Post-trade limit check. A violation flattens both instruments and
    /// halts; the violation and unwind P&L are returned.
    async fn post_trade(&self, pair: &PairExecution) -> Option<(SafetyViolation, Decimal)> {
        let marks = self.current_marks();
        let tracker = self.positions.read().clone();
        let violation = self.safety.post_trade_check(&tracker, &marks).err()?;

        error!(
            cycle_id = %pair.cycle_id,
            limit = violation.limit(),
            reason = %violation,
            "Post-trade limit breached, unwinding"
        );
        let pnl = match self.resolver.emergency_unwind(pair.cycle_id, &pair.flat_targets()).await {
            Ok(pnl) => pnl,
            Err((_, pnl)) => pnl,
        };
        self.safety.halt(violation.clone());
        Some((violation, pnl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperExchange, PaperExchangeConfig};
    use crate::types::Quote;
    use pairtrade_core::{InstrumentConfig, SubmitterConfig};
    use rust_decimal_macros::dec;

    fn create_test_config() -> AppConfig {
        AppConfig {
            submitter: SubmitterConfig::fast(),
            ..AppConfig::default()
        }
    }

    fn create_test_coordinator() -> (Arc<PaperExchange>, PairExecutionCoordinator) {
        let exchange = Arc::new(PaperExchange::new(PaperExchangeConfig::default()));
        exchange.set_quote(Quote::new("LEG-A", dec!(99.9), dec!(100), Utc::now()));
        exchange.set_quote(Quote::new("LEG-B", dec!(49.95), dec!(50), Utc::now()));
        let coordinator = PairExecutionCoordinator::new(create_test_config(), exchange.clone()).unwrap();
        (exchange, coordinator)
    }

    // ==== Setup Tests ====

    #[test]
    fn test_missing_instrument_is_rejected() {
        let mut config = create_test_config();
        config.instruments = vec![InstrumentConfig::new("LEG-A", dec!(0.01), dec!(0.001))];
        let exchange = Arc::new(PaperExchange::new(PaperExchangeConfig::default()));
        let result = PairExecutionCoordinator::new(config, exchange);
        assert!(matches!(
            result,
            Err(SetupError::MissingInstrument(id)) if id == "LEG-B"
        ));
    }

    #[test]
    fn test_inconsistent_thresholds_are_rejected() {
        let mut config = create_test_config();
        config.resolver.low_fill_ratio = dec!(0.9);
        let exchange = Arc::new(PaperExchange::new(PaperExchangeConfig::default()));
        let result = PairExecutionCoordinator::new(config, exchange);
        assert!(matches!(result, Err(SetupError::InvalidConfig(_))));
    }

    // ==== Planning Tests ====

    #[tokio::test]
    async fn test_build_plan_equalises_notional() {
        let (_exchange, coordinator) = create_test_coordinator();
        let snapshots = coordinator.fresh_snapshots().await.unwrap();
        let [a, b] = coordinator.plan_build(&snapshots).unwrap();

        assert_eq!(a.side, Side::Buy);
        assert_eq!(b.side, Side::Sell);
        let gap = (a.notional() - b.notional()).abs();
        assert!(gap <= a.price * dec!(0.001) + b.price * dec!(0.001));
        assert!(a.notional() <= dec!(1000));
    }

    #[tokio::test]
    async fn test_unwind_plan_requires_position() {
        let (_exchange, coordinator) = create_test_coordinator();
        let snapshots = coordinator.fresh_snapshots().await.unwrap();
        assert_eq!(
            coordinator.plan_unwind(&snapshots).unwrap_err(),
            CycleFailure::NothingToUnwind
        );

        coordinator.positions.write().overwrite("LEG-A", dec!(2), dec!(100));
        let [a, b] = coordinator.plan_unwind(&snapshots).unwrap();
        assert_eq!(a.side, Side::Sell);
        assert_eq!(a.quantity, dec!(2));
        assert_eq!(b.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unwind_plan_buys_back_short_leg() {
        let (_exchange, coordinator) = create_test_coordinator();
        coordinator.positions.write().overwrite("LEG-A", dec!(10.0004), dec!(100));
        coordinator.positions.write().overwrite("LEG-B", dec!(-20.0004), dec!(50));
        let snapshots = coordinator.fresh_snapshots().await.unwrap();

        let [a, b] = coordinator.plan_unwind(&snapshots).unwrap();
        assert_eq!(a.side, Side::Sell);
        assert_eq!(a.quantity, dec!(10));
        assert_eq!(b.side, Side::Buy);
        assert_eq!(b.quantity, dec!(20));
    }

    #[tokio::test]
    async fn test_unwind_intent_projects_closing_pnl() {
        let (_exchange, coordinator) = create_test_coordinator();
        coordinator.positions.write().overwrite("LEG-A", dec!(10), dec!(102));
        let snapshots = coordinator.fresh_snapshots().await.unwrap();
        let [a, b] = coordinator.plan_unwind(&snapshots).unwrap();
        let marks = PairExecutionCoordinator::marks_from(&snapshots);

        let intent = coordinator.intent(CyclePhase::Unwind, [&a, &b], &marks);
        assert_eq!(intent.legs.len(), 1);
        assert_eq!(intent.legs[0].quantity_change, dec!(-10));
        assert_eq!(intent.projected_pnl, (a.price - dec!(102)) * dec!(10));
    }

    // ==== Lifecycle Tests ====

    #[tokio::test]
    async fn test_shutdown_refuses_new_cycles() {
        let (exchange, coordinator) = create_test_coordinator();
        coordinator.shutdown().await;

        let result = coordinator.execute_cycle(CyclePhase::Build).await;
        assert_eq!(result.failure, Some(CycleFailure::ShuttingDown));
        assert!(exchange.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn test_manual_halt_blocks_until_cleared() {
        let (_exchange, coordinator) = create_test_coordinator();
        coordinator.halt("operator");
        let blocked = coordinator.execute_cycle(CyclePhase::Build).await;
        assert_eq!(blocked.outcome, CycleOutcome::Blocked);
        assert!(blocked.reason().unwrap().contains("operator"));

        assert!(coordinator.clear_halt().is_some());
        let result = coordinator.execute_cycle(CyclePhase::Build).await;
        assert!(result.success);
    }
}
