//! Exchange adapter contract.
//!
//! Any venue plugs into the execution core by implementing
//! [`ExchangeAdapter`]. Optional push streams are declared up front through
//! [`ExchangeCapabilities`]; callers read the flags once at construction and
//! never probe for methods at runtime.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};

use crate::error::ExchangeError;
use crate::types::{Depth, FillResult, OrderRequest, Quote};

/// Optional features an adapter supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeCapabilities {
    /// `subscribe_quotes` delivers pushed quotes.
    pub quote_stream: bool,
    /// `subscribe_order_updates` delivers pushed order state.
    pub order_stream: bool,
}

impl ExchangeCapabilities {
    #[must_use]
    pub const fn polling_only() -> Self {
        Self {
            quote_stream: false,
            order_stream: false,
        }
    }

    #[must_use]
    pub const fn streaming() -> Self {
        Self {
            quote_stream: true,
            order_stream: true,
        }
    }
}

/// Trait for exchange connectivity used by the pair execution core.
///
/// Implementations must be thread-safe (Send + Sync) so both legs can be
/// driven concurrently.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Optional features this adapter offers.
    fn capabilities(&self) -> ExchangeCapabilities;

    /// Opens streaming connections. Failure degrades callers to polling.
    async fn connect(&self) -> Result<(), ExchangeError>;

    async fn disconnect(&self) -> Result<(), ExchangeError>;

    /// Current top of book, optionally with depth.
    async fn get_quote(&self, instrument: &str) -> Result<Quote, ExchangeError>;

    async fn get_depth(&self, instrument: &str) -> Result<Depth, ExchangeError>;

    /// Pushed quotes for one instrument. The stream ends when the
    /// connection drops.
    async fn subscribe_quotes(&self, _instrument: &str) -> Result<mpsc::Receiver<Quote>, ExchangeError> {
        Err(ExchangeError::Unsupported("quote stream"))
    }

    /// Pushed order state changes for every order on the account.
    fn subscribe_order_updates(&self) -> Option<broadcast::Receiver<FillResult>> {
        None
    }

    /// Submits an order and returns its initial state with `order_id` set.
    ///
    /// # Errors
    ///
    /// `ExchangeError::Rejected` when the exchange refuses the order; any
    /// other error leaves the outcome unknown.
    async fn submit_order(&self, request: &OrderRequest) -> Result<FillResult, ExchangeError>;

    async fn get_order_status(&self, order_id: &str) -> Result<FillResult, ExchangeError>;

    /// Cancels an order. Cancelling an order that is already terminal
    /// returns `Ok`.
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Signed net position per instrument as the exchange reports it.
    async fn get_positions(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;
}
