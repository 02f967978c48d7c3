//! Partial-fill resolver.
//!
//! Decides what to do when the two legs of a cycle did not both fill:
//!
//! - average fill ratio below `low_fill_ratio`: emergency unwind whatever filled
//! - between the bounds: retry the remainders, re-priced from fresh data and
//!   more aggressive on every attempt, up to `max_retry_attempts`
//! - above `high_fill_ratio` with a small imbalance: accept as-is and record
//!   the residual delta
//! - imbalance above `hard_imbalance`, whatever the average: unwind the larger
//!   leg's excess
//!
//! The emergency unwind crosses the book with IOC orders and verifies the
//! result against the exchange. If the book cannot be verified flat after
//! `max_unwind_attempts`, the safety guard is halted.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::market_data::MarketDataFeed;
use crate::pricing::PricingEngine;
use crate::reconciler::PositionReconciler;
use crate::safety::{SafetyGuard, SafetyViolation};
use crate::submitter::LegSubmitter;
use crate::types::{
    CycleFailure, CycleOutcome, CyclePhase, FillResult, LegId, LegSpec, OrderKind,
};
use pairtrade_core::{FillEvent, InstrumentConfig, PositionTracker, ResolverConfig, Side};

// =============================================================================
// Classification
// =============================================================================

/// Resolution chosen for a pair of fill ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillClass {
    Complete,
    AcceptAsIs,
    RetryRemainder,
    LowFillAbort,
    /// `leg` filled the larger fraction and gets trimmed.
    ImbalanceUnwind { leg: LegId },
}

/// Classifies the fill ratios of leg A and leg B.
///
/// Pure: the same ratios and config always give the same class.
#[must_use]
pub fn classify_fill_ratios(ratio_a: Decimal, ratio_b: Decimal, config: &ResolverConfig) -> FillClass {
    let complete = Decimal::ONE - config.full_fill_tolerance;
    if ratio_a >= complete && ratio_b >= complete {
        return FillClass::Complete;
    }

    let imbalance = (ratio_a - ratio_b).abs();
    if imbalance > config.hard_imbalance {
        let leg = if ratio_a >= ratio_b { LegId::A } else { LegId::B };
        return FillClass::ImbalanceUnwind { leg };
    }

    let average = (ratio_a + ratio_b) / Decimal::TWO;
    if average < config.low_fill_ratio {
        return FillClass::LowFillAbort;
    }
    if average > config.high_fill_ratio && imbalance <= config.accept_imbalance {
        return FillClass::AcceptAsIs;
    }
    FillClass::RetryRemainder
}

// =============================================================================
// Pair State
// =============================================================================

/// One leg's order and everything filled for it so far, retries included.
#[derive(Debug, Clone)]
pub struct LegExecution {
    pub spec: LegSpec,
    pub fill: FillResult,
}

impl LegExecution {
    #[must_use]
    pub fn ratio(&self) -> Decimal {
        self.fill.fill_ratio(self.spec.quantity)
    }

    /// Signed position change caused by this leg.
    #[must_use]
    pub fn signed_fill(&self) -> Decimal {
        self.spec.side.sign() * self.fill.filled_qty
    }
}

/// Both legs of a cycle after the initial submission.
#[derive(Debug, Clone)]
pub struct PairExecution {
    pub cycle_id: Uuid,
    pub phase: CyclePhase,
    pub a: LegExecution,
    pub b: LegExecution,
    /// Local positions before the cycle submitted anything.
    pub baseline: HashMap<String, Decimal>,
}

impl PairExecution {
    #[must_use]
    pub const fn leg(&self, leg: LegId) -> &LegExecution {
        match leg {
            LegId::A => &self.a,
            LegId::B => &self.b,
        }
    }

    pub fn leg_mut(&mut self, leg: LegId) -> &mut LegExecution {
        match leg {
            LegId::A => &mut self.a,
            LegId::B => &mut self.b,
        }
    }

    /// Signed notional of everything filled in this cycle.
    #[must_use]
    pub fn filled_delta(&self) -> Decimal {
        [&self.a, &self.b]
            .iter()
            .map(|l| l.spec.side.sign() * l.fill.fill_notional())
            .sum()
    }

    fn baseline(&self, instrument: &str) -> Decimal {
        self.baseline.get(instrument).copied().unwrap_or(Decimal::ZERO)
    }

    /// Positions that leave only the matched portion of both legs open.
    ///
    /// The leg with the larger fill ratio is cut back to the smaller ratio;
    /// the other leg keeps what it filled.
    #[must_use]
    pub fn matched_targets(&self, instruments: &[InstrumentConfig]) -> HashMap<String, Decimal> {
        let matched = self.a.ratio().min(self.b.ratio());
        [&self.a, &self.b]
            .into_iter()
            .map(|leg| {
                let keep = instruments
                    .iter()
                    .find(|i| i.id == leg.spec.instrument)
                    .map_or(leg.spec.quantity * matched, |i| {
                        i.round_quantity_down(leg.spec.quantity * matched)
                    })
                    .min(leg.fill.filled_qty);
                let keep = if leg.ratio() <= matched {
                    leg.fill.filled_qty
                } else {
                    keep
                };
                (
                    leg.spec.instrument.clone(),
                    self.baseline(&leg.spec.instrument) + leg.spec.side.sign() * keep,
                )
            })
            .collect()
    }

    /// Positions as they were before the cycle.
    #[must_use]
    pub fn baseline_targets(&self) -> HashMap<String, Decimal> {
        [&self.a, &self.b]
            .into_iter()
            .map(|leg| (leg.spec.instrument.clone(), self.baseline(&leg.spec.instrument)))
            .collect()
    }

    /// Both instruments flat.
    #[must_use]
    pub fn flat_targets(&self) -> HashMap<String, Decimal> {
        [&self.a, &self.b]
            .into_iter()
            .map(|leg| (leg.spec.instrument.clone(), Decimal::ZERO))
            .collect()
    }
}

/// What the resolver concluded for a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub success: bool,
    pub outcome: CycleOutcome,
    pub failure: Option<CycleFailure>,
    /// P&L realized by retry and unwind orders.
    pub realized_pnl: Decimal,
    pub residual_delta: Decimal,
}

/// Applies an executed fill to the position cache and returns realized P&L.
pub fn record_fill(positions: &RwLock<PositionTracker>, spec: &LegSpec, fill: &FillResult) -> Decimal {
    let Some(price) = fill.avg_price.filter(|_| fill.has_fills()) else {
        return Decimal::ZERO;
    };
    let event = FillEvent::new(
        fill.order_id.as_deref().unwrap_or("unknown"),
        &spec.instrument,
        spec.side,
        fill.filled_qty,
        price,
    );
    positions.write().process_fill(&event).unwrap_or(Decimal::ZERO)
}

// =============================================================================
// Resolver
// =============================================================================

pub struct PartialFillResolver {
    config: ResolverConfig,
    pricing: PricingEngine,
    feed: Arc<MarketDataFeed>,
    submitter: Arc<LegSubmitter>,
    reconciler: Arc<PositionReconciler>,
    safety: Arc<SafetyGuard>,
    positions: Arc<RwLock<PositionTracker>>,
    legs: [(LegId, InstrumentConfig); 2],
}

impl PartialFillResolver {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ResolverConfig,
        pricing: PricingEngine,
        feed: Arc<MarketDataFeed>,
        submitter: Arc<LegSubmitter>,
        reconciler: Arc<PositionReconciler>,
        safety: Arc<SafetyGuard>,
        positions: Arc<RwLock<PositionTracker>>,
        instruments: (InstrumentConfig, InstrumentConfig),
    ) -> Self {
        Self {
            config,
            pricing,
            feed,
            submitter,
            reconciler,
            safety,
            positions,
            legs: [(LegId::A, instruments.0), (LegId::B, instruments.1)],
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn instruments(&self) -> [InstrumentConfig; 2] {
        [self.legs[0].1.clone(), self.legs[1].1.clone()]
    }

    fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.legs.iter().map(|(_, i)| i).find(|i| i.id == id)
    }

    /// Drives an asymmetric pair to a final state.
    ///
    /// Retry fills are folded into `pair` and applied to the position cache.
    pub async fn resolve(&self, pair: &mut PairExecution) -> Resolution {
        let mut realized_pnl = Decimal::ZERO;
        let mut attempt = 0;

        loop {
            let class = classify_fill_ratios(pair.a.ratio(), pair.b.ratio(), &self.config);
            debug!(
                cycle_id = %pair.cycle_id,
                ratio_a = %pair.a.ratio().round_dp(4),
                ratio_b = %pair.b.ratio().round_dp(4),
                ?class,
                attempt,
                "Classified fills"
            );

            match class {
                FillClass::Complete => {
                    return Resolution {
                        success: true,
                        outcome: CycleOutcome::Completed,
                        failure: None,
                        realized_pnl,
                        residual_delta: Decimal::ZERO,
                    };
                }
                FillClass::AcceptAsIs => {
                    let residual_delta = pair.filled_delta();
                    info!(
                        cycle_id = %pair.cycle_id,
                        residual_delta = %residual_delta,
                        "Accepted partial fill"
                    );
                    return Resolution {
                        success: true,
                        outcome: CycleOutcome::AcceptedPartial,
                        failure: None,
                        realized_pnl,
                        residual_delta,
                    };
                }
                FillClass::RetryRemainder if attempt < self.config.max_retry_attempts => {
                    attempt += 1;
                    realized_pnl += self.retry_remainders(pair, attempt).await;
                }
                FillClass::RetryRemainder => {
                    warn!(cycle_id = %pair.cycle_id, attempts = attempt, "Retries exhausted");
                    let targets = self.exit_targets(pair, true);
                    return self
                        .conclude_unwind(pair, &targets, CycleFailure::RetriesExhausted, realized_pnl)
                        .await;
                }
                FillClass::LowFillAbort => {
                    let targets = self.exit_targets(pair, false);
                    return self
                        .conclude_unwind(pair, &targets, CycleFailure::LowFill, realized_pnl)
                        .await;
                }
                FillClass::ImbalanceUnwind { leg } => {
                    let targets = self.exit_targets(pair, true);
                    let unwound = match pair.phase {
                        CyclePhase::Build => leg,
                        CyclePhase::Unwind => leg.other(),
                    };
                    return self
                        .conclude_unwind(
                            pair,
                            &targets,
                            CycleFailure::AsymmetricFill { leg: unwound },
                            realized_pnl,
                        )
                        .await;
                }
            }
        }
    }

    /// Where an unwind should leave the book. An UNWIND cycle always exits
    /// flat; a BUILD cycle keeps the matched portion or nothing.
    fn exit_targets(&self, pair: &PairExecution, keep_matched: bool) -> HashMap<String, Decimal> {
        match (pair.phase, keep_matched) {
            (CyclePhase::Unwind, _) => pair.flat_targets(),
            (CyclePhase::Build, true) => pair.matched_targets(&self.instruments()),
            (CyclePhase::Build, false) => pair.baseline_targets(),
        }
    }

    async fn conclude_unwind(
        &self,
        pair: &PairExecution,
        targets: &HashMap<String, Decimal>,
        failure: CycleFailure,
        realized_pnl: Decimal,
    ) -> Resolution {
        warn!(cycle_id = %pair.cycle_id, reason = %failure, "Resolving with emergency unwind");
        match self.emergency_unwind(pair.cycle_id, targets).await {
            Ok(pnl) => Resolution {
                success: false,
                outcome: CycleOutcome::Unwound,
                failure: Some(failure),
                realized_pnl: realized_pnl + pnl,
                residual_delta: Decimal::ZERO,
            },
            Err((violation, pnl)) => Resolution {
                success: false,
                outcome: CycleOutcome::Fatal,
                failure: Some(CycleFailure::Fatal(violation.to_string())),
                realized_pnl: realized_pnl + pnl,
                residual_delta: Decimal::ZERO,
            },
        }
    }

    /// Re-prices and resubmits both remainders once, concurrently.
    ///
    /// Returns the P&L realized by the retry fills.
    async fn retry_remainders(&self, pair: &mut PairExecution, attempt: u32) -> Decimal {
        let extra_bps = self.config.retry_step_bps * Decimal::from(attempt);
        let mut specs: [Option<LegSpec>; 2] = [None, None];

        for (slot, leg) in specs.iter_mut().zip([LegId::A, LegId::B]) {
            let exec = pair.leg(leg);
            let Some(instrument) = self.instrument(&exec.spec.instrument) else {
                continue;
            };
            let remaining =
                instrument.round_quantity_down(exec.spec.quantity - exec.fill.filled_qty);
            if remaining <= Decimal::ZERO {
                continue;
            }

            let snapshot = match self.feed.refresh(&instrument.id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(leg = %leg, error = %e, "No fresh quote for retry");
                    continue;
                }
            };
            match self.pricing.price_for_quantity(
                instrument,
                exec.spec.side,
                &snapshot,
                remaining,
                extra_bps,
                Utc::now(),
            ) {
                Ok(priced) => {
                    *slot = Some(LegSpec {
                        leg,
                        instrument: priced.instrument,
                        side: priced.side,
                        quantity: priced.quantity,
                        price: priced.price,
                        kind: OrderKind::MakerPreferred,
                        reference_price: exec.spec.reference_price,
                    });
                }
                Err(e) => warn!(leg = %leg, error = %e, "Retry pricing failed"),
            }
        }

        info!(
            cycle_id = %pair.cycle_id,
            attempt,
            extra_bps = %extra_bps,
            retry_a = %specs[0].as_ref().map_or(Decimal::ZERO, |s| s.quantity),
            retry_b = %specs[1].as_ref().map_or(Decimal::ZERO, |s| s.quantity),
            "Retrying remainders"
        );

        let mut realized = Decimal::ZERO;
        for (spec, fill) in self.submit_pair(specs, false).await {
            realized += record_fill(&self.positions, &spec, &fill);
            pair.leg_mut(spec.leg).fill.absorb(&fill);
        }
        realized
    }

    /// Closes exposure toward `targets` with crossing IOC orders and verifies
    /// the result against the exchange.
    ///
    /// Returns the realized P&L. After `max_unwind_attempts` unverified
    /// attempts the safety guard is halted and the violation returned with
    /// the P&L realized so far.
    ///
    /// # Errors
    ///
    /// `UnwindUnverified` when the exchange never confirmed the targets.
    pub async fn emergency_unwind(
        &self,
        cycle_id: Uuid,
        targets: &HashMap<String, Decimal>,
    ) -> Result<Decimal, (SafetyViolation, Decimal)> {
        self.safety.record_emergency_unwind();
        let tolerance = self.reconciler.config().tolerance;
        let attempts = self.config.max_unwind_attempts.max(1);
        let mut realized = Decimal::ZERO;
        let mut last_mismatch: Option<ReconcileError> = None;

        // Expected holdings after this unwind's own fills. `verify` may
        // overwrite the cache with a lagging exchange report.
        let mut held: HashMap<String, Decimal> = {
            let tracker = self.positions.read();
            targets.keys().map(|i| (i.clone(), tracker.quantity(i))).collect()
        };

        for attempt in 1..=attempts {
            let mut specs: [Option<LegSpec>; 2] = [None, None];
            for (slot, (leg, instrument)) in specs.iter_mut().zip(self.legs.iter()) {
                let Some(target) = targets.get(&instrument.id).copied() else {
                    continue;
                };
                let current = held.get(&instrument.id).copied().unwrap_or_default();
                let gap = target - current;
                let quantity = instrument.round_quantity_down(gap.abs());
                if quantity <= tolerance {
                    continue;
                }
                let side = if gap > Decimal::ZERO { Side::Buy } else { Side::Sell };

                let quote = match self.feed.refresh(&instrument.id).await {
                    Ok(snapshot) => snapshot.quote,
                    Err(e) => {
                        warn!(leg = %leg, error = %e, "No quote for emergency unwind");
                        continue;
                    }
                };
                match self.pricing.crossing_price(instrument, side, &quote, Utc::now()) {
                    Ok(price) => {
                        *slot = Some(LegSpec {
                            leg: *leg,
                            instrument: instrument.id.clone(),
                            side,
                            quantity,
                            price,
                            kind: OrderKind::ImmediateOrCancel,
                            reference_price: quote.touch(side),
                        });
                    }
                    Err(e) => warn!(leg = %leg, error = %e, "Emergency unwind pricing failed"),
                }
            }

            let orders = specs.iter().flatten().count();
            if orders == 0 {
                debug!(cycle_id = %cycle_id, attempt, "Nothing left to send, re-checking positions");
            } else {
                warn!(cycle_id = %cycle_id, attempt, orders, "Emergency unwind");
            }
            for (spec, fill) in self.submit_pair(specs, true).await {
                realized += record_fill(&self.positions, &spec, &fill);
                if fill.outcome_unknown() {
                    // Fall back to the exchange's view once verify has applied it.
                    held.remove(&spec.instrument);
                } else {
                    *held.entry(spec.instrument.clone()).or_default() +=
                        spec.side.sign() * fill.filled_qty;
                }
            }

            match self.reconciler.verify(targets).await {
                Ok(_) => {
                    info!(cycle_id = %cycle_id, attempt, "Emergency unwind verified");
                    return Ok(realized);
                }
                Err(e) => {
                    warn!(cycle_id = %cycle_id, attempt, error = %e, "Emergency unwind not verified");
                    last_mismatch = Some(e);
                }
            }
            {
                let tracker = self.positions.read();
                for instrument in targets.keys() {
                    held.entry(instrument.clone())
                        .or_insert_with(|| tracker.quantity(instrument));
                }
            }
        }

        let violation = match last_mismatch {
            Some(ReconcileError::Mismatch {
                instrument,
                expected,
                observed,
                ..
            }) => SafetyViolation::UnwindUnverified {
                instrument,
                observed: (observed - expected).abs(),
                threshold: tolerance,
            },
            _ => {
                let (instrument, residual) = targets
                    .iter()
                    .map(|(i, t)| (i.clone(), (*t - self.positions.read().quantity(i)).abs()))
                    .max_by(|a, b| a.1.cmp(&b.1))
                    .unwrap_or_default();
                SafetyViolation::UnwindUnverified {
                    instrument,
                    observed: residual,
                    threshold: tolerance,
                }
            }
        };
        self.safety.halt(violation.clone());
        Err((violation, realized))
    }

    async fn submit_pair(&self, specs: [Option<LegSpec>; 2], emergency: bool) -> Vec<(LegSpec, FillResult)> {
        let [a, b] = specs;
        let (a, b) = tokio::join!(self.submit_one(a, emergency), self.submit_one(b, emergency));
        a.into_iter().chain(b).collect()
    }

    async fn submit_one(&self, spec: Option<LegSpec>, emergency: bool) -> Option<(LegSpec, FillResult)> {
        let spec = spec?;
        let deadline = if emergency {
            self.submitter.config().emergency_deadline
        } else {
            self.submitter
                .deadline_for(spec.quantity, self.feed.regime(&spec.instrument))
        };
        let fill = self.submitter.submit(&spec, deadline).await;
        Some((spec, fill))
    }
}
