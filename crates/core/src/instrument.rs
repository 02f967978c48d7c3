use anyhow::{bail, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Static trading rules for one instrument. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstrumentConfig {
    pub id: String,
    /// Smallest price increment.
    pub tick_size: Decimal,
    /// Smallest quantity increment.
    pub quantity_increment: Decimal,
}

impl InstrumentConfig {
    #[must_use]
    pub fn new(id: &str, tick_size: Decimal, quantity_increment: Decimal) -> Self {
        Self {
            id: id.to_string(),
            tick_size,
            quantity_increment,
        }
    }

    /// # Errors
    ///
    /// Returns an error if either increment is not positive.
    pub fn validate(&self) -> Result<()> {
        if self.tick_size <= Decimal::ZERO {
            bail!("{}: tick_size must be positive, got {}", self.id, self.tick_size);
        }
        if self.quantity_increment <= Decimal::ZERO {
            bail!(
                "{}: quantity_increment must be positive, got {}",
                self.id,
                self.quantity_increment
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn round_price_down(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.tick_size, RoundingStrategy::ToNegativeInfinity)
    }

    #[must_use]
    pub fn round_price_up(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.tick_size, RoundingStrategy::ToPositiveInfinity)
    }

    /// Rounds a quantity toward zero so orders never exceed the requested size.
    #[must_use]
    pub fn round_quantity_down(&self, quantity: Decimal) -> Decimal {
        round_to_increment(quantity, self.quantity_increment, RoundingStrategy::ToZero)
    }

    #[must_use]
    pub fn is_valid_price(&self, price: Decimal) -> bool {
        price > Decimal::ZERO && (price % self.tick_size).is_zero()
    }

    #[must_use]
    pub fn is_valid_quantity(&self, quantity: Decimal) -> bool {
        quantity > Decimal::ZERO && (quantity % self.quantity_increment).is_zero()
    }
}

fn round_to_increment(value: Decimal, increment: Decimal, strategy: RoundingStrategy) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = (value / increment).round_dp_with_strategy(0, strategy);
    (steps * increment).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create_test_instrument() -> InstrumentConfig {
        InstrumentConfig::new("ETH-PERP", dec!(0.05), dec!(0.001))
    }

    #[test]
    fn test_price_rounding_direction() {
        let inst = create_test_instrument();
        assert_eq!(inst.round_price_down(dec!(100.07)), dec!(100.05));
        assert_eq!(inst.round_price_up(dec!(100.07)), dec!(100.1));
        assert_eq!(inst.round_price_up(dec!(100.05)), dec!(100.05));
    }

    #[test]
    fn test_quantity_rounds_toward_zero() {
        let inst = create_test_instrument();
        assert_eq!(inst.round_quantity_down(dec!(1.23456)), dec!(1.234));
        assert_eq!(inst.round_quantity_down(dec!(-1.23456)), dec!(-1.234));
        assert_eq!(inst.round_quantity_down(dec!(0.0009)), Decimal::ZERO);
    }

    #[test]
    fn test_validity_checks() {
        let inst = create_test_instrument();
        assert!(inst.is_valid_price(dec!(100.05)));
        assert!(!inst.is_valid_price(dec!(100.07)));
        assert!(inst.is_valid_quantity(dec!(0.002)));
        assert!(!inst.is_valid_quantity(Decimal::ZERO));
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let inst = InstrumentConfig::new("BAD", Decimal::ZERO, dec!(1));
        assert!(inst.validate().is_err());
    }
}
