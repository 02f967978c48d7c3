use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    #[must_use]
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// The side that reduces a position of the given signed size.
    #[must_use]
    pub fn closing(position: Decimal) -> Self {
        if position > Decimal::ZERO {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// An executed quantity at a price, applied to the position cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    #[must_use]
    pub fn new(order_id: &str, instrument: &str, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_id: order_id.to_string(),
            instrument: instrument.to_string(),
            side,
            quantity,
            price,
            commission: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Signed quantity change this fill applies to the position.
    #[must_use]
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), dec!(-1));
        assert_eq!(Side::closing(dec!(2)), Side::Sell);
        assert_eq!(Side::closing(dec!(-2)), Side::Buy);
        assert_eq!(Side::Buy.to_string(), "BUY");
    }

    #[test]
    fn test_side_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }

    #[test]
    fn test_fill_signed_quantity() {
        let fill = FillEvent::new("o-1", "ETH", Side::Sell, dec!(1.5), dec!(2000));
        assert_eq!(fill.signed_quantity(), dec!(-1.5));
    }
}
