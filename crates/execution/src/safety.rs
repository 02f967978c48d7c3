//! Safety guard.
//!
//! Gates every cycle on three limits: per-instrument position notional,
//! daily realized loss (including what the cycle itself is projected to
//! realize), and net directional delta as a fraction of the pair's target
//! notional. The same limits are checked after each cycle; a violation
//! there triggers an emergency unwind and halts trading until
//! [`SafetyGuard::clear_halt`] is called.
//!
//! All mutable safety state lives in one [`SafetyState`], reset at each UTC
//! midnight by [`SafetyGuard::roll_day`].

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::CyclePhase;
use pairtrade_core::{PositionTracker, SafetyLimits};

// =============================================================================
// Violations
// =============================================================================

/// A breached limit with the value that breached it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SafetyViolation {
    #[error("max_position exceeded on {instrument}: notional {observed} > {threshold}")]
    MaxPosition {
        instrument: String,
        observed: Decimal,
        threshold: Decimal,
    },

    #[error("max_daily_loss exceeded: loss {observed} >= {threshold}")]
    DailyLoss { observed: Decimal, threshold: Decimal },

    #[error("max_net_delta exceeded: fraction {observed} > {threshold}")]
    NetDelta { observed: Decimal, threshold: Decimal },

    #[error("emergency unwind unverified on {instrument}: residual {observed} > tolerance {threshold}")]
    UnwindUnverified {
        instrument: String,
        observed: Decimal,
        threshold: Decimal,
    },

    #[error("reconciliation mismatch on {instrument}: drift {observed} > tolerance {threshold}")]
    ReconciliationMismatch {
        instrument: String,
        observed: Decimal,
        threshold: Decimal,
    },

    #[error("trading halted: {reason}")]
    Halted { reason: String },
}

impl SafetyViolation {
    /// Name of the breached limit.
    #[must_use]
    pub const fn limit(&self) -> &'static str {
        match self {
            Self::MaxPosition { .. } => "max_position",
            Self::DailyLoss { .. } => "max_daily_loss",
            Self::NetDelta { .. } => "max_net_delta",
            Self::UnwindUnverified { .. } => "emergency_unwind",
            Self::ReconciliationMismatch { .. } => "reconciliation",
            Self::Halted { .. } => "halted",
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Mutable safety state for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub day: NaiveDate,
    pub daily_realized_pnl: Decimal,
    /// Signed notional left unhedged by accepted partial fills.
    pub residual_delta: Decimal,
    pub halted: Option<SafetyViolation>,
    pub successful_cycles: u32,
    pub failed_cycles: u32,
    pub emergency_unwinds: u32,
}

impl SafetyState {
    #[must_use]
    pub const fn new(day: NaiveDate) -> Self {
        Self {
            day,
            daily_realized_pnl: Decimal::ZERO,
            residual_delta: Decimal::ZERO,
            halted: None,
            successful_cycles: 0,
            failed_cycles: 0,
            emergency_unwinds: 0,
        }
    }

    /// Starts a new day if `today` differs. Halts survive the rollover.
    pub fn roll(&mut self, today: NaiveDate) -> bool {
        if today == self.day {
            return false;
        }
        self.day = today;
        self.daily_realized_pnl = Decimal::ZERO;
        true
    }
}

/// Point-in-time view of the guard for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub state: SafetyState,
    pub limits: SafetyLimits,
    /// Loss budget left today.
    pub remaining_loss_budget: Decimal,
}

impl SafetyStatus {
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.state.halted.is_some()
    }
}

// =============================================================================
// Intent
// =============================================================================

/// Position change one leg of a cycle would make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentLeg {
    pub instrument: String,
    /// Signed quantity change.
    pub quantity_change: Decimal,
    pub price: Decimal,
}

/// What a cycle is about to do, as seen by the pre-trade check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleIntent {
    pub phase: CyclePhase,
    pub legs: Vec<IntentLeg>,
    /// Realized P&L the cycle would book if it fills as priced.
    pub projected_pnl: Decimal,
}

// =============================================================================
// Guard
// =============================================================================

pub struct SafetyGuard {
    limits: SafetyLimits,
    target_notional: Decimal,
    state: RwLock<SafetyState>,
}

impl SafetyGuard {
    #[must_use]
    pub fn new(limits: SafetyLimits, target_notional: Decimal) -> Self {
        Self {
            limits,
            target_notional,
            state: RwLock::new(SafetyState::new(Utc::now().date_naive())),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Largest tolerated absolute net delta in quote currency.
    #[must_use]
    pub fn delta_limit(&self) -> Decimal {
        self.limits.max_net_delta_fraction * self.target_notional
    }

    /// Resets the daily accumulator when `now` falls on a new UTC day.
    pub fn roll_day(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        let previous = state.day;
        let previous_pnl = state.daily_realized_pnl;
        if state.roll(now.date_naive()) {
            info!(
                previous_day = %previous,
                previous_pnl = %previous_pnl,
                day = %state.day,
                "Daily loss accumulator reset"
            );
        }
    }

    /// Sum of signed position notionals.
    #[must_use]
    pub fn net_delta(positions: &PositionTracker, marks: &HashMap<String, Decimal>) -> Decimal {
        positions.net_notional(marks)
    }

    /// Decides whether a cycle may run.
    ///
    /// # Errors
    ///
    /// The first limit the intent would breach.
    pub fn pre_trade_check(
        &self,
        intent: &CycleIntent,
        positions: &PositionTracker,
        marks: &HashMap<String, Decimal>,
    ) -> Result<(), SafetyViolation> {
        let state = self.state.read();
        if let Some(reason) = &state.halted {
            return Err(SafetyViolation::Halted {
                reason: reason.to_string(),
            });
        }

        let loss_now = -state.daily_realized_pnl;
        let projected_loss = loss_now - intent.projected_pnl.min(Decimal::ZERO);
        if loss_now >= self.limits.max_daily_loss || projected_loss > self.limits.max_daily_loss {
            return Err(SafetyViolation::DailyLoss {
                observed: projected_loss,
                threshold: self.limits.max_daily_loss,
            });
        }
        drop(state);

        for leg in &intent.legs {
            let current = positions.quantity(&leg.instrument);
            let next = current + leg.quantity_change;
            let notional = (next * leg.price).abs();
            if next.abs() > current.abs() && notional > self.limits.max_position_notional {
                return Err(SafetyViolation::MaxPosition {
                    instrument: leg.instrument.clone(),
                    observed: notional,
                    threshold: self.limits.max_position_notional,
                });
            }
        }

        let current_delta = Self::net_delta(positions, marks);
        let limit = self.delta_limit();
        let check = match intent.phase {
            CyclePhase::Build => current_delta.abs(),
            CyclePhase::Unwind => {
                let change: Decimal = intent
                    .legs
                    .iter()
                    .map(|l| l.quantity_change * l.price)
                    .sum();
                let projected = (current_delta + change).abs();
                if projected <= current_delta.abs() {
                    Decimal::ZERO
                } else {
                    projected
                }
            }
        };
        if check > limit {
            return Err(SafetyViolation::NetDelta {
                observed: self.delta_fraction(check),
                threshold: self.limits.max_net_delta_fraction,
            });
        }
        Ok(())
    }

    /// Checks the book and the day's realized loss after a cycle. The
    /// cycle's P&L must already be recorded.
    ///
    /// # Errors
    ///
    /// The first breached limit; the caller must unwind and halt.
    pub fn post_trade_check(
        &self,
        positions: &PositionTracker,
        marks: &HashMap<String, Decimal>,
    ) -> Result<(), SafetyViolation> {
        let loss = -self.state.read().daily_realized_pnl;
        if loss >= self.limits.max_daily_loss {
            return Err(SafetyViolation::DailyLoss {
                observed: loss,
                threshold: self.limits.max_daily_loss,
            });
        }

        for position in positions.all_positions().values() {
            let mark = marks
                .get(&position.instrument)
                .copied()
                .unwrap_or(position.avg_price);
            let notional = position.notional_at(mark).abs();
            if notional > self.limits.max_position_notional {
                return Err(SafetyViolation::MaxPosition {
                    instrument: position.instrument.clone(),
                    observed: notional,
                    threshold: self.limits.max_position_notional,
                });
            }
        }

        let delta = Self::net_delta(positions, marks).abs();
        if delta > self.delta_limit() {
            return Err(SafetyViolation::NetDelta {
                observed: self.delta_fraction(delta),
                threshold: self.limits.max_net_delta_fraction,
            });
        }
        Ok(())
    }

    fn delta_fraction(&self, delta: Decimal) -> Decimal {
        if self.target_notional.is_zero() {
            return delta;
        }
        (delta / self.target_notional).round_dp(6)
    }

    /// Adds realized P&L to today's accumulator.
    pub fn record_realized_pnl(&self, pnl: Decimal) {
        self.state.write().daily_realized_pnl += pnl;
    }

    pub fn record_cycle(&self, success: bool) {
        let mut state = self.state.write();
        if success {
            state.successful_cycles += 1;
        } else {
            state.failed_cycles += 1;
        }
    }

    pub fn record_emergency_unwind(&self) {
        self.state.write().emergency_unwinds += 1;
    }

    pub fn set_residual_delta(&self, residual: Decimal) {
        self.state.write().residual_delta = residual;
    }

    /// Blocks all cycles until `clear_halt`. The first reason is kept.
    pub fn halt(&self, violation: SafetyViolation) {
        let mut state = self.state.write();
        if state.halted.is_none() {
            error!(
                limit = violation.limit(),
                reason = %violation,
                "Trading halted"
            );
            state.halted = Some(violation);
        } else {
            warn!(reason = %violation, "Additional fatal condition while halted");
        }
    }

    /// Manual reset after an operator has resolved the cause.
    pub fn clear_halt(&self) -> Option<SafetyViolation> {
        let cleared = self.state.write().halted.take();
        if let Some(reason) = &cleared {
            info!(reason = %reason, "Halt cleared");
        }
        cleared
    }

    #[must_use]
    pub fn halt_reason(&self) -> Option<SafetyViolation> {
        self.state.read().halted.clone()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state.read().halted.is_some()
    }

    #[must_use]
    pub fn status(&self) -> SafetyStatus {
        let state = self.state.read().clone();
        let remaining_loss_budget =
            (self.limits.max_daily_loss + state.daily_realized_pnl).max(Decimal::ZERO);
        SafetyStatus {
            state,
            limits: self.limits.clone(),
            remaining_loss_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pairtrade_core::{FillEvent, Side};
    use rust_decimal_macros::dec;

    fn create_test_guard() -> SafetyGuard {
        SafetyGuard::new(
            SafetyLimits::default()
                .with_max_position_notional(dec!(2000))
                .with_max_daily_loss(dec!(100))
                .with_max_net_delta_fraction(dec!(0.1)),
            dec!(1000),
        )
    }

    fn build_intent(projected_pnl: Decimal) -> CycleIntent {
        CycleIntent {
            phase: CyclePhase::Build,
            legs: vec![
                IntentLeg {
                    instrument: "A".into(),
                    quantity_change: dec!(10),
                    price: dec!(100),
                },
                IntentLeg {
                    instrument: "B".into(),
                    quantity_change: dec!(-20),
                    price: dec!(50),
                },
            ],
            projected_pnl,
        }
    }

    fn tracker_with(fills: &[(&str, Side, Decimal, Decimal)]) -> PositionTracker {
        let mut tracker = PositionTracker::new();
        for (instrument, side, qty, price) in fills {
            let _ = tracker.process_fill(&FillEvent::new("t", instrument, *side, *qty, *price));
        }
        tracker
    }

    // ==== Daily Loss Tests ====

    #[test]
    fn test_projected_loss_blocks_cycle() {
        let guard = create_test_guard();
        guard.record_realized_pnl(dec!(-90));

        let err = guard
            .pre_trade_check(&build_intent(dec!(-20)), &PositionTracker::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            SafetyViolation::DailyLoss {
                observed: dec!(110),
                threshold: dec!(100)
            }
        );
        assert_eq!(err.limit(), "max_daily_loss");
    }

    #[test]
    fn test_loss_within_budget_passes() {
        let guard = create_test_guard();
        guard.record_realized_pnl(dec!(-50));
        assert!(guard
            .pre_trade_check(&build_intent(dec!(-20)), &PositionTracker::new(), &HashMap::new())
            .is_ok());
    }

    #[test]
    fn test_limit_already_hit_blocks_even_profitable_cycle() {
        let guard = create_test_guard();
        guard.record_realized_pnl(dec!(-100));
        assert!(guard
            .pre_trade_check(&build_intent(dec!(5)), &PositionTracker::new(), &HashMap::new())
            .is_err());
    }

    #[test]
    fn test_day_rollover_resets_pnl_but_not_halt() {
        let guard = create_test_guard();
        guard.record_realized_pnl(dec!(-100));
        guard.halt(SafetyViolation::Halted { reason: "test".into() });

        let tomorrow = Utc::now() + chrono::Duration::days(1);
        guard.roll_day(tomorrow);

        let status = guard.status();
        assert_eq!(status.state.daily_realized_pnl, Decimal::ZERO);
        assert_eq!(status.state.day, tomorrow.date_naive());
        assert!(status.is_halted());
    }

    #[test]
    fn test_state_roll_same_day_is_noop() {
        let day = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        let mut state = SafetyState::new(day.date_naive());
        state.daily_realized_pnl = dec!(-5);
        assert!(!state.roll(day.date_naive()));
        assert_eq!(state.daily_realized_pnl, dec!(-5));
        assert!(state.roll((day + chrono::Duration::minutes(2)).date_naive()));
        assert_eq!(state.daily_realized_pnl, Decimal::ZERO);
    }

    // ==== Position Limit Tests ====

    #[test]
    fn test_position_limit_blocks_growth() {
        let guard = create_test_guard();
        let positions = tracker_with(&[("A", Side::Buy, dec!(15), dec!(100)), ("B", Side::Sell, dec!(30), dec!(50))]);
        let err = guard
            .pre_trade_check(&build_intent(Decimal::ZERO), &positions, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, SafetyViolation::MaxPosition { ref instrument, .. } if instrument == "A"));
    }

    #[test]
    fn test_reducing_oversized_position_is_allowed() {
        let guard = create_test_guard();
        let positions = tracker_with(&[("A", Side::Buy, dec!(30), dec!(100)), ("B", Side::Sell, dec!(60), dec!(50))]);
        let unwind = CycleIntent {
            phase: CyclePhase::Unwind,
            legs: vec![
                IntentLeg { instrument: "A".into(), quantity_change: dec!(-30), price: dec!(100) },
                IntentLeg { instrument: "B".into(), quantity_change: dec!(60), price: dec!(50) },
            ],
            projected_pnl: Decimal::ZERO,
        };
        assert!(guard.pre_trade_check(&unwind, &positions, &HashMap::new()).is_ok());
    }

    // ==== Delta Tests ====

    #[test]
    fn test_existing_delta_blocks_build() {
        let guard = create_test_guard();
        let positions = tracker_with(&[("A", Side::Buy, dec!(5), dec!(100))]);
        let err = guard
            .pre_trade_check(&build_intent(Decimal::ZERO), &positions, &HashMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            SafetyViolation::NetDelta {
                observed: dec!(0.5),
                threshold: dec!(0.1)
            }
        );
    }

    #[test]
    fn test_unwind_reducing_delta_is_allowed() {
        let guard = create_test_guard();
        let positions = tracker_with(&[("A", Side::Buy, dec!(5), dec!(100))]);
        let unwind = CycleIntent {
            phase: CyclePhase::Unwind,
            legs: vec![IntentLeg { instrument: "A".into(), quantity_change: dec!(-5), price: dec!(100) }],
            projected_pnl: Decimal::ZERO,
        };
        assert!(guard.pre_trade_check(&unwind, &positions, &HashMap::new()).is_ok());
    }

    #[test]
    fn test_post_trade_delta_violation() {
        let guard = create_test_guard();
        let hedged = tracker_with(&[("A", Side::Buy, dec!(10), dec!(100)), ("B", Side::Sell, dec!(20), dec!(50))]);
        let marks = HashMap::from([("A".to_string(), dec!(100)), ("B".to_string(), dec!(50))]);
        assert!(guard.post_trade_check(&hedged, &marks).is_ok());

        let naked = tracker_with(&[("A", Side::Buy, dec!(10), dec!(100))]);
        assert!(matches!(
            guard.post_trade_check(&naked, &marks),
            Err(SafetyViolation::NetDelta { .. })
        ));
    }

    #[test]
    fn test_post_trade_daily_loss_violation() {
        let guard = create_test_guard();
        let flat = PositionTracker::new();
        let marks = HashMap::new();
        guard.record_realized_pnl(dec!(-60));
        assert!(guard.post_trade_check(&flat, &marks).is_ok());

        guard.record_realized_pnl(dec!(-45));
        assert_eq!(
            guard.post_trade_check(&flat, &marks),
            Err(SafetyViolation::DailyLoss {
                observed: dec!(105),
                threshold: dec!(100),
            })
        );
    }

    // ==== Halt Tests ====

    #[test]
    fn test_halt_blocks_until_cleared() {
        let guard = create_test_guard();
        guard.halt(SafetyViolation::UnwindUnverified {
            instrument: "A".into(),
            observed: dec!(3),
            threshold: dec!(0.001),
        });
        guard.halt(SafetyViolation::Halted { reason: "second".into() });

        let err = guard
            .pre_trade_check(&build_intent(Decimal::ZERO), &PositionTracker::new(), &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("emergency unwind unverified on A"));

        let cleared = guard.clear_halt().unwrap();
        assert_eq!(cleared.limit(), "emergency_unwind");
        assert!(!guard.is_halted());
        assert!(guard
            .pre_trade_check(&build_intent(Decimal::ZERO), &PositionTracker::new(), &HashMap::new())
            .is_ok());
    }

    #[test]
    fn test_status_counters() {
        let guard = create_test_guard();
        guard.record_cycle(true);
        guard.record_cycle(false);
        guard.record_emergency_unwind();
        guard.record_realized_pnl(dec!(-30));
        guard.set_residual_delta(dec!(12));

        let status = guard.status();
        assert_eq!(status.state.successful_cycles, 1);
        assert_eq!(status.state.failed_cycles, 1);
        assert_eq!(status.state.emergency_unwinds, 1);
        assert_eq!(status.remaining_loss_budget, dec!(70));
        assert_eq!(status.state.residual_delta, dec!(12));
    }
}
