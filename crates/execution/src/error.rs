//! Error types for the execution core.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors reported by an exchange adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Order was rejected by the exchange.
    #[error("Order rejected: {reason}")]
    Rejected {
        /// Rejection reason from exchange.
        reason: String,
    },

    /// Request did not complete in time; the outcome is unknown.
    #[error("Timeout during {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Order is not known to the exchange.
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// Order ID that was queried.
        order_id: String,
    },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Capability not offered by this adapter.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Any other exchange-side error.
    #[error("API error: {0}")]
    Api(String),
}

impl ExchangeError {
    /// Returns true if this error is potentially transient and the call could succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Network(_)
        )
    }

    /// Returns true if the exchange definitively refused the order.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Why a leg could not be priced. No order is sent when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("No quote available for {instrument}")]
    NoQuote { instrument: String },

    #[error("Stale quote for {instrument}: {age_ms}ms old, limit {max_age_ms}ms")]
    StaleQuote {
        instrument: String,
        age_ms: u128,
        max_age_ms: u128,
    },

    #[error("Invalid quote for {instrument}: {reason}")]
    InvalidQuote { instrument: String, reason: String },

    #[error("Insufficient liquidity for {instrument}: {requested} requested within {max_slippage_bps} bps")]
    InsufficientLiquidity {
        instrument: String,
        requested: Decimal,
        max_slippage_bps: Decimal,
    },

    #[error("Quantity for {instrument} rounds to zero (notional {notional} at {price})")]
    ZeroQuantity {
        instrument: String,
        notional: Decimal,
        price: Decimal,
    },
}

/// Errors raised while comparing local and exchange positions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Failed to fetch exchange positions: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Position mismatch on {instrument} after {attempts} attempts: expected {expected}, exchange reports {observed}")]
    Mismatch {
        instrument: String,
        expected: Decimal,
        observed: Decimal,
        attempts: u32,
    },
}

/// Configuration the coordinator cannot be built from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Instrument {0} is not configured")]
    MissingInstrument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(!ExchangeError::Rejected { reason: "post only".into() }.is_retryable());
        assert!(ExchangeError::Rejected { reason: "post only".into() }.is_rejection());
        assert!(!ExchangeError::Api("bad".into()).is_rejection());
    }

    #[test]
    fn test_pricing_error_messages_carry_values() {
        let err = PricingError::StaleQuote {
            instrument: "ETH".into(),
            age_ms: 3_000,
            max_age_ms: 2_000,
        };
        assert_eq!(err.to_string(), "Stale quote for ETH: 3000ms old, limit 2000ms");
    }
}
