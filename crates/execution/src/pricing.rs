//! Pricing engine.
//!
//! Prices legs at the touch (buy at the ask, sell at the bid) plus a small
//! aggressiveness offset chosen by the spread regime, sizes them from a
//! target notional, and walks the depth ladder to keep the expected VWAP
//! within the slippage bound. Every function here is a pure computation on
//! the snapshot it is given; the same snapshot and `now` always produce the
//! same result.

use chrono::{DateTime, Utc};
use pairtrade_core::{InstrumentConfig, PricingConfig, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PricingError;
use crate::regime::SpreadRegime;
use crate::types::{DepthLevel, MarketSnapshot, Quote};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Result of walking the book for a given quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEstimate {
    /// Quantity the visible book can absorb, up to the request.
    pub filled: Decimal,
    pub total_cost: Decimal,
    pub vwap: Decimal,
    pub worst_price: Decimal,
    pub best_price: Decimal,
    pub sufficient_depth: bool,
}

/// Walks `levels` (best first) to estimate filling `quantity`.
///
/// Returns `None` if the ladder is empty or the quantity is not positive.
#[must_use]
pub fn simulate_fill(levels: &[DepthLevel], quantity: Decimal) -> Option<FillEstimate> {
    if quantity <= Decimal::ZERO {
        return None;
    }
    let best_price = levels.first()?.price;

    let mut filled = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut worst_price = best_price;

    for level in levels {
        if filled >= quantity {
            break;
        }
        let take = level.quantity.min(quantity - filled);
        total_cost += take * level.price;
        filled += take;
        worst_price = level.price;
    }

    let vwap = if filled > Decimal::ZERO {
        total_cost / filled
    } else {
        Decimal::ZERO
    };

    Some(FillEstimate {
        filled,
        total_cost,
        vwap,
        worst_price,
        best_price,
        sufficient_depth: filled >= quantity,
    })
}

/// Adverse distance of `vwap` from `best` in basis points.
#[must_use]
pub fn slippage_bps(side: Side, best: Decimal, vwap: Decimal) -> Decimal {
    if best <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let adverse = match side {
        Side::Buy => vwap - best,
        Side::Sell => best - vwap,
    };
    adverse / best * BPS
}

/// Largest quantity whose VWAP across `levels` stays at or better than `limit`.
#[must_use]
pub fn max_quantity_within(levels: &[DepthLevel], side: Side, limit: Decimal) -> Decimal {
    let mut filled = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for level in levels {
        let within = match side {
            Side::Buy => level.price <= limit,
            Side::Sell => level.price >= limit,
        };
        if within {
            filled += level.quantity;
            cost += level.quantity * level.price;
            continue;
        }

        // Worse level: take only what keeps (cost + p*x) / (filled + x) at the limit.
        let headroom = match side {
            Side::Buy => (limit * filled - cost) / (level.price - limit),
            Side::Sell => (cost - limit * filled) / (limit - level.price),
        };
        let take = headroom.max(Decimal::ZERO).min(level.quantity);
        filled += take;
        cost += take * level.price;
        if take < level.quantity {
            break;
        }
    }
    filled
}

/// A priced and sized leg, ready to become an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLeg {
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Touch price the leg was priced from.
    pub reference_price: Decimal,
    pub offset_bps: Decimal,
    /// Depth-walk estimate, absent when the quote carried no depth.
    pub estimate: Option<FillEstimate>,
    /// True when the depth walk reduced the size.
    pub clamped: bool,
}

impl PricedLeg {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    #[must_use]
    pub const fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Aggressiveness offset for a spread regime.
    #[must_use]
    pub fn offset_bps(&self, regime: SpreadRegime) -> Decimal {
        match regime {
            SpreadRegime::Narrowing => self.config.offset_narrowing_bps,
            SpreadRegime::Stable => self.config.offset_stable_bps,
            SpreadRegime::Widening => self.config.offset_widening_bps,
        }
    }

    /// Rejects quotes that are stale, crossed, non-positive or for another instrument.
    ///
    /// # Errors
    ///
    /// `StaleQuote` or `InvalidQuote` describing the problem.
    pub fn validate_quote(
        &self,
        instrument: &InstrumentConfig,
        quote: &Quote,
        now: DateTime<Utc>,
    ) -> Result<(), PricingError> {
        let invalid = |reason: &str| PricingError::InvalidQuote {
            instrument: instrument.id.clone(),
            reason: reason.to_string(),
        };
        if quote.instrument != instrument.id {
            return Err(invalid(&format!("quote is for {}", quote.instrument)));
        }
        if quote.bid <= Decimal::ZERO || quote.ask <= Decimal::ZERO {
            return Err(invalid("non-positive price"));
        }
        if quote.is_crossed() {
            return Err(invalid(&format!("crossed book bid {} >= ask {}", quote.bid, quote.ask)));
        }
        if quote.is_stale(self.config.max_quote_age, now) {
            return Err(PricingError::StaleQuote {
                instrument: instrument.id.clone(),
                age_ms: quote.age(now).as_millis(),
                max_age_ms: self.config.max_quote_age.as_millis(),
            });
        }
        Ok(())
    }

    /// Touch price moved `offset_bps` toward the other side of the book,
    /// rounded to a tick in the aggressive direction.
    #[must_use]
    pub fn limit_price(
        &self,
        instrument: &InstrumentConfig,
        side: Side,
        quote: &Quote,
        offset_bps: Decimal,
    ) -> Decimal {
        let touch = quote.touch(side);
        match side {
            Side::Buy => instrument.round_price_up(touch * (Decimal::ONE + offset_bps / BPS)),
            Side::Sell => instrument.round_price_down(touch * (Decimal::ONE - offset_bps / BPS)),
        }
    }

    /// Prices a leg and sizes it from `target_notional`, clamped by depth.
    ///
    /// `extra_bps` adds aggressiveness on top of the regime offset, used by
    /// retries.
    ///
    /// # Errors
    ///
    /// Stale or invalid quote, a size that rounds to zero, or no size at all
    /// within the slippage bound.
    pub fn price_and_size(
        &self,
        instrument: &InstrumentConfig,
        side: Side,
        snapshot: &MarketSnapshot,
        target_notional: Decimal,
        extra_bps: Decimal,
        now: DateTime<Utc>,
    ) -> Result<PricedLeg, PricingError> {
        let quote = snapshot.quote.as_ref();
        self.validate_quote(instrument, quote, now)?;

        let offset_bps = self.offset_bps(snapshot.regime) + extra_bps;
        let price = self.limit_price(instrument, side, quote, offset_bps);
        let quantity = instrument.round_quantity_down(target_notional / price);
        if quantity <= Decimal::ZERO {
            return Err(PricingError::ZeroQuantity {
                instrument: instrument.id.clone(),
                notional: target_notional,
                price,
            });
        }

        let (quantity, estimate, clamped) = self.clamp_to_depth(instrument, side, quote, quantity)?;
        Ok(PricedLeg {
            instrument: instrument.id.clone(),
            side,
            price,
            quantity,
            reference_price: quote.touch(side),
            offset_bps,
            estimate,
            clamped,
        })
    }

    /// Prices a fixed quantity, as when closing a known position.
    ///
    /// The size is never reduced; if the book cannot absorb it within the
    /// slippage bound this fails instead.
    ///
    /// # Errors
    ///
    /// Stale or invalid quote, a quantity that rounds to zero, or
    /// insufficient liquidity.
    pub fn price_for_quantity(
        &self,
        instrument: &InstrumentConfig,
        side: Side,
        snapshot: &MarketSnapshot,
        quantity: Decimal,
        extra_bps: Decimal,
        now: DateTime<Utc>,
    ) -> Result<PricedLeg, PricingError> {
        let quote = snapshot.quote.as_ref();
        self.validate_quote(instrument, quote, now)?;

        let offset_bps = self.offset_bps(snapshot.regime) + extra_bps;
        let price = self.limit_price(instrument, side, quote, offset_bps);
        let quantity = instrument.round_quantity_down(quantity.abs());
        if quantity <= Decimal::ZERO {
            return Err(PricingError::ZeroQuantity {
                instrument: instrument.id.clone(),
                notional: Decimal::ZERO,
                price,
            });
        }

        let estimate = simulate_fill(quote.levels(side), quantity);
        if let Some(est) = estimate {
            let slippage = slippage_bps(side, est.best_price, est.vwap);
            if !est.sufficient_depth || slippage > self.config.max_slippage_bps {
                return Err(self.insufficient(instrument, quantity));
            }
        }

        Ok(PricedLeg {
            instrument: instrument.id.clone(),
            side,
            price,
            quantity,
            reference_price: quote.touch(side),
            offset_bps,
            estimate,
            clamped: false,
        })
    }

    /// Price that crosses the book by `emergency_cross_bps`, for IOC unwinds.
    ///
    /// # Errors
    ///
    /// Stale or invalid quote.
    pub fn crossing_price(
        &self,
        instrument: &InstrumentConfig,
        side: Side,
        quote: &Quote,
        now: DateTime<Utc>,
    ) -> Result<Decimal, PricingError> {
        self.validate_quote(instrument, quote, now)?;
        let price = self.limit_price(instrument, side, quote, self.config.emergency_cross_bps);
        Ok(price.max(instrument.tick_size))
    }

    fn clamp_to_depth(
        &self,
        instrument: &InstrumentConfig,
        side: Side,
        quote: &Quote,
        quantity: Decimal,
    ) -> Result<(Decimal, Option<FillEstimate>, bool), PricingError> {
        let levels = quote.levels(side);
        let Some(estimate) = simulate_fill(levels, quantity) else {
            return Ok((quantity, None, false));
        };
        let slippage = slippage_bps(side, estimate.best_price, estimate.vwap);
        if estimate.sufficient_depth && slippage <= self.config.max_slippage_bps {
            return Ok((quantity, Some(estimate), false));
        }

        let bound = self.config.max_slippage_bps / BPS;
        let limit = match side {
            Side::Buy => estimate.best_price * (Decimal::ONE + bound),
            Side::Sell => estimate.best_price * (Decimal::ONE - bound),
        };
        let clamped = instrument.round_quantity_down(max_quantity_within(levels, side, limit).min(quantity));
        if clamped <= Decimal::ZERO {
            return Err(self.insufficient(instrument, quantity));
        }

        tracing::debug!(
            instrument = %instrument.id,
            side = %side,
            requested = %quantity,
            clamped = %clamped,
            slippage_bps = %slippage.round_dp(2),
            "Clamped leg size to depth"
        );
        Ok((clamped, simulate_fill(levels, clamped), true))
    }

    fn insufficient(&self, instrument: &InstrumentConfig, requested: Decimal) -> PricingError {
        PricingError::InsufficientLiquidity {
            instrument: instrument.id.clone(),
            requested,
            max_slippage_bps: self.config.max_slippage_bps,
        }
    }
}
