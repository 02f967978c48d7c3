use crate::events::{FillEvent, Side};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Signed net quantity and VWAP entry price for one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub instrument: String,
    /// Positive for long, negative for short.
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

impl Position {
    #[allow(clippy::missing_const_for_fn)] // String cannot be used in const fn
    fn new(instrument: String, quantity: Decimal, avg_price: Decimal) -> Self {
        Self {
            instrument,
            quantity,
            avg_price,
        }
    }

    /// Signed notional at the given mark.
    #[must_use]
    pub fn notional_at(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    /// P&L realized by closing up to `quantity` of this position at `price`.
    #[must_use]
    pub fn closing_pnl(&self, price: Decimal, quantity: Decimal) -> Decimal {
        let closed = quantity.min(self.quantity.abs());
        let pnl = (price - self.avg_price) * closed;
        if self.quantity.is_sign_negative() {
            -pnl
        } else {
            pnl
        }
    }
}

/// Local shadow of exchange positions.
///
/// Updated from fills as they arrive and overwritten by reconciliation when
/// the exchange disagrees.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    positions: HashMap<String, Position>,
}

impl PositionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
        }
    }

    /// Processes a fill event and calculates realized `PnL` if position closed.
    ///
    /// Returns `Some(pnl)` when a position is fully or partially closed, `None` when opening.
    /// A fill larger than the open position closes it and opens the remainder
    /// on the other side at the fill price.
    pub fn process_fill(&mut self, fill: &FillEvent) -> Option<Decimal> {
        if fill.quantity <= Decimal::ZERO {
            return None;
        }
        let signed = fill.signed_quantity();
        let position = self.positions.get_mut(&fill.instrument);

        match (fill.side, position) {
            (_, None) => {
                self.positions.insert(
                    fill.instrument.clone(),
                    Position::new(fill.instrument.clone(), signed, fill.price),
                );
                None
            }

            // Adding in the same direction
            (_, Some(pos))
                if pos.quantity.is_zero()
                    || pos.quantity.is_sign_positive() == signed.is_sign_positive() =>
            {
                let total_cost = pos.avg_price * pos.quantity.abs() + fill.price * fill.quantity;
                pos.quantity += signed;
                pos.avg_price = total_cost / pos.quantity.abs();
                None
            }

            // Reducing, closing or flipping
            (side, Some(pos)) => {
                let open = pos.quantity.abs();
                let close_quantity = fill.quantity.min(open);
                let pnl = match side {
                    Side::Sell => (fill.price - pos.avg_price) * close_quantity,
                    Side::Buy => (pos.avg_price - fill.price) * close_quantity,
                } - fill.commission;

                pos.quantity += signed;
                if pos.quantity.is_zero() {
                    self.positions.remove(&fill.instrument);
                } else if fill.quantity > open {
                    pos.avg_price = fill.price;
                }

                Some(pnl)
            }
        }
    }

    /// Replaces the tracked quantity with an authoritative value.
    ///
    /// The entry price survives when the side is unchanged; otherwise the
    /// supplied `entry_price` is used.
    pub fn overwrite(&mut self, instrument: &str, quantity: Decimal, entry_price: Decimal) {
        if quantity.is_zero() {
            self.positions.remove(instrument);
            return;
        }
        match self.positions.get_mut(instrument) {
            Some(pos) if pos.quantity.is_sign_positive() == quantity.is_sign_positive() => {
                pos.quantity = quantity;
            }
            _ => {
                self.positions.insert(
                    instrument.to_string(),
                    Position::new(instrument.to_string(), quantity, entry_price),
                );
            }
        }
    }

    #[must_use]
    pub fn get_position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    /// Signed quantity held, zero when flat.
    #[must_use]
    pub fn quantity(&self, instrument: &str) -> Decimal {
        self.positions
            .get(instrument)
            .map_or(Decimal::ZERO, |p| p.quantity)
    }

    #[must_use]
    pub const fn all_positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    /// Sum of signed notionals for the given marks. Instruments without a
    /// mark are valued at their entry price.
    #[must_use]
    pub fn net_notional(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .map(|p| p.notional_at(marks.get(&p.instrument).copied().unwrap_or(p.avg_price)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(side: Side, quantity: Decimal, price: Decimal) -> FillEvent {
        FillEvent::new("o-1", "ETH", side, quantity, price)
    }

    // ==== Fill Processing Tests ====

    #[test]
    fn test_open_and_add_long_uses_vwap() {
        let mut tracker = PositionTracker::new();
        assert_eq!(tracker.process_fill(&fill(Side::Buy, dec!(1), dec!(100))), None);
        assert_eq!(tracker.process_fill(&fill(Side::Buy, dec!(1), dec!(110))), None);

        let pos = tracker.get_position("ETH").unwrap();
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.avg_price, dec!(105));
    }

    #[test]
    fn test_close_long_realizes_pnl() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&fill(Side::Buy, dec!(2), dec!(100)));
        let pnl = tracker.process_fill(&fill(Side::Sell, dec!(2), dec!(95)));

        assert_eq!(pnl, Some(dec!(-10)));
        assert!(tracker.get_position("ETH").is_none());
        assert_eq!(tracker.quantity("ETH"), Decimal::ZERO);
    }

    #[test]
    fn test_short_open_add_and_partial_close() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&fill(Side::Sell, dec!(1), dec!(50)));
        let _ = tracker.process_fill(&fill(Side::Sell, dec!(1), dec!(52)));
        assert_eq!(tracker.get_position("ETH").unwrap().avg_price, dec!(51));

        let pnl = tracker.process_fill(&fill(Side::Buy, dec!(1), dec!(49)));
        assert_eq!(pnl, Some(dec!(2)));
        assert_eq!(tracker.quantity("ETH"), dec!(-1));
    }

    #[test]
    fn test_fill_through_zero_flips_side() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&fill(Side::Buy, dec!(1), dec!(100)));
        let pnl = tracker.process_fill(&fill(Side::Sell, dec!(3), dec!(101)));

        assert_eq!(pnl, Some(dec!(1)));
        let pos = tracker.get_position("ETH").unwrap();
        assert_eq!(pos.quantity, dec!(-2));
        assert_eq!(pos.avg_price, dec!(101));
    }

    #[test]
    fn test_zero_quantity_fill_is_ignored() {
        let mut tracker = PositionTracker::new();
        assert_eq!(tracker.process_fill(&fill(Side::Buy, Decimal::ZERO, dec!(100))), None);
        assert!(tracker.all_positions().is_empty());
    }

    #[test]
    fn test_closing_pnl_by_direction() {
        let long = Position::new("ETH".into(), dec!(10), dec!(100));
        assert_eq!(long.closing_pnl(dec!(98), dec!(4)), dec!(-8));
        assert_eq!(long.closing_pnl(dec!(101), dec!(50)), dec!(10));

        let short = Position::new("ETH".into(), dec!(-10), dec!(100));
        assert_eq!(short.closing_pnl(dec!(98), dec!(4)), dec!(8));
        assert_eq!(short.closing_pnl(dec!(101), dec!(10)), dec!(-10));
    }

    // ==== Overwrite Tests ====

    #[test]
    fn test_overwrite_keeps_entry_on_same_side() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&fill(Side::Buy, dec!(2), dec!(100)));
        tracker.overwrite("ETH", dec!(1.5), dec!(90));

        let pos = tracker.get_position("ETH").unwrap();
        assert_eq!(pos.quantity, dec!(1.5));
        assert_eq!(pos.avg_price, dec!(100));
    }

    #[test]
    fn test_overwrite_to_zero_removes_position() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&fill(Side::Buy, dec!(2), dec!(100)));
        tracker.overwrite("ETH", Decimal::ZERO, dec!(100));
        assert!(tracker.get_position("ETH").is_none());
    }

    #[test]
    fn test_overwrite_new_side_uses_supplied_entry() {
        let mut tracker = PositionTracker::new();
        tracker.overwrite("BTC", dec!(-0.5), dec!(30000));
        let pos = tracker.get_position("BTC").unwrap();
        assert_eq!(pos.quantity, dec!(-0.5));
        assert_eq!(pos.avg_price, dec!(30000));
    }

    #[test]
    fn test_net_notional_uses_marks() {
        let mut tracker = PositionTracker::new();
        let _ = tracker.process_fill(&FillEvent::new("a", "A", Side::Buy, dec!(10), dec!(100)));
        let _ = tracker.process_fill(&FillEvent::new("b", "B", Side::Sell, dec!(20), dec!(50)));

        let marks = HashMap::from([("A".to_string(), dec!(101)), ("B".to_string(), dec!(50))]);
        assert_eq!(tracker.net_notional(&marks), dec!(10));
    }
}
