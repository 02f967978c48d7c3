//! Data types shared by the execution components.

use chrono::{DateTime, Utc};
use pairtrade_core::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::regime::SpreadRegime;

// =============================================================================
// Market Data
// =============================================================================

/// A single price level in an order book ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl DepthLevel {
    #[must_use]
    pub const fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book ladder as returned by an exchange depth query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depth {
    /// Bids, best (highest) first.
    pub bids: Vec<DepthLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<DepthLevel>,
}

/// Top of book plus optional depth for one instrument.
///
/// Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Empty when the exchange did not report depth.
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    #[must_use]
    pub fn new(instrument: &str, bid: Decimal, ask: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.to_string(),
            bid,
            ask,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp,
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.bids = depth.bids;
        self.asks = depth.asks;
        self
    }

    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Spread relative to mid, zero for a non-positive mid.
    #[must_use]
    pub fn relative_spread(&self) -> Decimal {
        let mid = self.mid();
        if mid <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.spread() / mid
    }

    #[must_use]
    pub fn is_crossed(&self) -> bool {
        self.bid >= self.ask
    }

    /// Age of the quote at `now`; quotes from the future count as fresh.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > max_age
    }

    /// Best price a taker on `side` would trade against.
    #[must_use]
    pub fn touch(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Levels a taker on `side` would consume, best first.
    #[must_use]
    pub fn levels(&self, side: Side) -> &[DepthLevel] {
        match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        }
    }
}

/// Latest quote together with the spread regime observed when it arrived.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub quote: std::sync::Arc<Quote>,
    pub regime: SpreadRegime,
}

// =============================================================================
// Orders
// =============================================================================

/// How an order is allowed to interact with the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Limit order at the touch that may rest.
    MakerPreferred,
    /// Fills what it can immediately, the rest is cancelled.
    ImmediateOrCancel,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MakerPreferred => write!(f, "MAKER"),
            Self::ImmediateOrCancel => write!(f, "IOC"),
        }
    }
}

/// Order as sent to an exchange adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub kind: OrderKind,
}

/// Lifecycle state of a leg's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    TimedOut,
}

impl LegStatus {
    /// No further fills can arrive.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::TimedOut
        )
    }
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Normalized state of one order: what filled, at what price, and how it ended.
///
/// Adapters return this from submission and status queries, and the
/// submitter returns it once a leg concludes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: Option<String>,
    pub status: LegStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub error: Option<String>,
}

impl FillResult {
    #[must_use]
    pub fn open(order_id: &str) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            status: LegStatus::Open,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error: None,
        }
    }

    #[must_use]
    pub fn filled(order_id: &str, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            status: LegStatus::Filled,
            filled_qty: quantity,
            avg_price: Some(price),
            error: None,
        }
    }

    #[must_use]
    pub fn rejected(order_id: Option<String>, reason: &str) -> Self {
        Self {
            order_id,
            status: LegStatus::Rejected,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error: Some(reason.to_string()),
        }
    }

    /// A leg with nothing to do, e.g. an UNWIND leg for a flat instrument.
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            order_id: None,
            status: LegStatus::Filled,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error: None,
        }
    }

    /// True when any quantity executed, whatever the terminal status.
    #[must_use]
    pub fn has_fills(&self) -> bool {
        self.filled_qty > Decimal::ZERO
    }

    #[must_use]
    pub fn fill_notional(&self) -> Decimal {
        self.avg_price.map_or(Decimal::ZERO, |p| p * self.filled_qty)
    }

    /// Submission failed in a way that leaves the exchange state unknown:
    /// no order id was ever obtained.
    #[must_use]
    pub fn outcome_unknown(&self) -> bool {
        self.status == LegStatus::TimedOut && self.order_id.is_none() && self.error.is_some()
    }

    /// Filled fraction of `target`; a zero target counts as complete.
    #[must_use]
    pub fn fill_ratio(&self, target: Decimal) -> Decimal {
        if target <= Decimal::ZERO {
            return Decimal::ONE;
        }
        (self.filled_qty / target).min(Decimal::ONE)
    }

    /// Folds a follow-up order's fills into this one.
    pub fn absorb(&mut self, other: &Self) {
        if other.has_fills() {
            let notional = self.fill_notional() + other.fill_notional();
            self.filled_qty += other.filled_qty;
            self.avg_price = Some(notional / self.filled_qty);
        }
        if other.order_id.is_some() {
            self.order_id.clone_from(&other.order_id);
        }
        self.status = other.status;
        self.error.clone_from(&other.error);
    }
}

// =============================================================================
// Cycles
// =============================================================================

/// Whether a cycle opens the pair or closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Build,
    Unwind,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "BUILD"),
            Self::Unwind => write!(f, "UNWIND"),
        }
    }
}

/// Which side of the pair a leg belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegId {
    A,
    B,
}

impl LegId {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// What one leg of a cycle should do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegSpec {
    pub leg: LegId,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub kind: OrderKind,
    /// Touch price when the leg was priced, used for slippage reporting.
    pub reference_price: Decimal,
}

impl LegSpec {
    #[must_use]
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: self.instrument.clone(),
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            kind: self.kind,
        }
    }

    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Per-leg summary on a `CycleResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegReport {
    pub leg: LegId,
    pub instrument: String,
    pub side: Side,
    pub target_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub reference_price: Decimal,
    /// Adverse distance between fill and reference in bps, when filled.
    pub slippage_bps: Option<Decimal>,
    pub status: LegStatus,
}

impl LegReport {
    #[must_use]
    pub fn new(spec: &LegSpec, fill: &FillResult) -> Self {
        let slippage_bps = fill
            .avg_price
            .filter(|_| fill.has_fills() && spec.reference_price > Decimal::ZERO)
            .map(|avg| {
                let adverse = match spec.side {
                    Side::Buy => avg - spec.reference_price,
                    Side::Sell => spec.reference_price - avg,
                };
                (adverse / spec.reference_price * Decimal::from(10_000)).round_dp(2)
            });
        Self {
            leg: spec.leg,
            instrument: spec.instrument.clone(),
            side: spec.side,
            target_qty: spec.quantity,
            filled_qty: fill.filled_qty,
            avg_price: fill.avg_price,
            reference_price: spec.reference_price,
            slippage_bps,
            status: fill.status,
        }
    }
}

/// How a cycle concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Both legs filled within tolerance.
    Completed,
    /// Both legs mostly filled; the residual is tracked as delta.
    AcceptedPartial,
    /// Nothing filled and nothing changed; safe to retry.
    NoFill,
    /// Fills were reversed by an emergency unwind.
    Unwound,
    /// Refused before any order was sent.
    Blocked,
    /// Left the system halted until cleared.
    Fatal,
}

/// Why a cycle did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleFailure {
    Halted(String),
    ShuttingDown,
    Pricing { leg: LegId, reason: String },
    NothingToUnwind,
    SafetyBlocked(String),
    NoFill,
    LowFill,
    AsymmetricFill { leg: LegId },
    RetriesExhausted,
    Fatal(String),
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halted(reason) => write!(f, "halted: {reason}"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Pricing { leg, reason } => write!(f, "pricing failed for leg {leg}: {reason}"),
            Self::NothingToUnwind => write!(f, "no position to unwind"),
            Self::SafetyBlocked(reason) => write!(f, "blocked pre-trade: {reason}"),
            Self::NoFill => write!(f, "neither leg filled"),
            Self::LowFill => write!(f, "low fill, unwound both legs"),
            Self::AsymmetricFill { leg } => write!(f, "asymmetric fill, unwound leg {leg}"),
            Self::RetriesExhausted => write!(f, "retries exhausted, unwound imbalance"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Outcome of one BUILD or UNWIND cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub phase: CyclePhase,
    pub success: bool,
    pub outcome: CycleOutcome,
    pub failure: Option<CycleFailure>,
    /// Empty when the cycle was refused before submitting.
    pub legs: Vec<LegReport>,
    pub realized_pnl: Decimal,
    /// Signed notional left unhedged by an accepted partial fill.
    pub residual_delta: Decimal,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleResult {
    #[must_use]
    pub fn not_attempted(
        cycle_id: Uuid,
        phase: CyclePhase,
        failure: CycleFailure,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id,
            phase,
            success: false,
            outcome: CycleOutcome::Blocked,
            failure: Some(failure),
            legs: Vec::new(),
            realized_pnl: Decimal::ZERO,
            residual_delta: Decimal::ZERO,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Human-readable failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    #[must_use]
    pub fn leg(&self, leg: LegId) -> Option<&LegReport> {
        self.legs.iter().find(|l| l.leg == leg)
    }
}
