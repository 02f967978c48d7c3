//! Dual-leg execution core for delta-neutral pairs.
//!
//! Opens and closes offsetting positions in two correlated instruments on a
//! single exchange, keeping the book directionally flat even when one leg
//! fills and the other does not.
//!
//! # Overview
//!
//! ```text
//! SafetyGuard ──gate──▶ PairExecutionCoordinator
//!                           │  prices from MarketDataFeed via PricingEngine
//!                           ├──▶ LegSubmitter (A) ─┐
//!                           └──▶ LegSubmitter (B) ─┴─▶ PartialFillResolver
//!                                                        │
//!                                     PositionReconciler ◀┘ verifies the book
//! ```
//!
//! # Modules
//!
//! - [`exchange`]: the adapter contract every venue implements
//! - [`market_data`]: per-instrument quote tasks, push first, polling fallback
//! - [`pricing`]: at-touch prices, notional sizing, slippage-bounded depth walk
//! - [`submitter`]: one order to a terminal state under a deadline
//! - [`resolver`]: fill-ratio classification, retries, emergency unwind
//! - [`coordinator`]: one BUILD or UNWIND cycle end to end
//! - [`reconciler`]: local positions against exchange positions
//! - [`safety`]: position, daily loss and net delta limits
//! - [`paper`]: scriptable in-memory exchange
//!
//! # Example
//!
//! ```ignore
//! use pairtrade_core::ConfigLoader;
//! use pairtrade_execution::{CyclePhase, PairExecutionCoordinator};
//!
//! let config = ConfigLoader::load()?;
//! let coordinator = PairExecutionCoordinator::new(config, adapter)?;
//! coordinator.start().await?;
//!
//! let result = coordinator.execute_cycle(CyclePhase::Build).await;
//! if !result.success {
//!     tracing::warn!(reason = ?result.reason(), "Build failed");
//! }
//! coordinator.shutdown().await;
//! ```
//!
//! # Safety
//!
//! A cycle that cannot verify its unwind, or whose book disagrees with the
//! exchange after retries, halts the [`SafetyGuard`]. Every later cycle is
//! refused until [`PairExecutionCoordinator::clear_halt`] is called.

pub mod coordinator;
pub mod error;
pub mod exchange;
pub mod market_data;
pub mod paper;
pub mod pricing;
pub mod reconciler;
pub mod regime;
pub mod resolver;
pub mod safety;
pub mod submitter;
pub mod types;

// Re-export main types for convenience
pub use coordinator::PairExecutionCoordinator;
pub use error::{ExchangeError, PricingError, ReconcileError, SetupError};
pub use exchange::{ExchangeAdapter, ExchangeCapabilities};
pub use market_data::MarketDataFeed;
pub use paper::{FillPlan, PaperExchange, PaperExchangeConfig};
pub use pricing::{FillEstimate, PricedLeg, PricingEngine};
pub use reconciler::{PositionCorrection, PositionReconciler, ReconcileReport};
pub use regime::{SpreadRegime, SpreadRegimeTracker};
pub use resolver::{classify_fill_ratios, FillClass, PartialFillResolver, Resolution};
pub use safety::{CycleIntent, IntentLeg, SafetyGuard, SafetyState, SafetyStatus, SafetyViolation};
pub use submitter::LegSubmitter;
pub use types::{
    CycleFailure, CycleOutcome, CyclePhase, CycleResult, Depth, DepthLevel, FillResult, LegId,
    LegReport, LegSpec, LegStatus, MarketSnapshot, OrderKind, OrderRequest, Quote,
};
