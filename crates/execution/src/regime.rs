//! Spread-volatility regime classification.
//!
//! Each instrument keeps a rolling window of relative bid/ask spreads. The
//! regime compares the mean of the newer half of the window with the older
//! half: a rise beyond the threshold is `Widening`, a fall is `Narrowing`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::types::Quote;

/// Minimum samples before a regime other than `Stable` is reported.
const MIN_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpreadRegime {
    Narrowing,
    #[default]
    Stable,
    Widening,
}

impl fmt::Display for SpreadRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Narrowing => write!(f, "narrowing"),
            Self::Stable => write!(f, "stable"),
            Self::Widening => write!(f, "widening"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpreadRegimeTracker {
    window: usize,
    threshold: Decimal,
    samples: VecDeque<Decimal>,
}

impl SpreadRegimeTracker {
    #[must_use]
    pub fn new(window: usize, threshold: Decimal) -> Self {
        let window = window.max(MIN_SAMPLES);
        Self {
            window,
            threshold,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Records the quote's spread and returns the regime after it.
    pub fn observe(&mut self, quote: &Quote) -> SpreadRegime {
        if !quote.is_crossed() {
            if self.samples.len() == self.window {
                self.samples.pop_front();
            }
            self.samples.push_back(quote.relative_spread());
        }
        self.regime()
    }

    #[must_use]
    pub fn regime(&self) -> SpreadRegime {
        if self.samples.len() < MIN_SAMPLES {
            return SpreadRegime::Stable;
        }
        let half = self.samples.len() / 2;
        let older = mean(self.samples.iter().take(half));
        let recent = mean(self.samples.iter().skip(half));

        if older.is_zero() {
            return if recent.is_zero() {
                SpreadRegime::Stable
            } else {
                SpreadRegime::Widening
            };
        }
        let change = (recent - older) / older;
        if change > self.threshold {
            SpreadRegime::Widening
        } else if change < -self.threshold {
            SpreadRegime::Narrowing
        } else {
            SpreadRegime::Stable
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn mean<'a>(values: impl Iterator<Item = &'a Decimal>) -> Decimal {
    let (sum, count) = values.fold((Decimal::ZERO, 0u32), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        Decimal::ZERO
    } else {
        sum / Decimal::from(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn quote_with_spread(spread: Decimal) -> Quote {
        Quote::new("ETH", dec!(100) - spread / dec!(2), dec!(100) + spread / dec!(2), Utc::now())
    }

    fn feed(tracker: &mut SpreadRegimeTracker, spreads: &[Decimal]) -> SpreadRegime {
        spreads
            .iter()
            .map(|s| tracker.observe(&quote_with_spread(*s)))
            .last()
            .unwrap_or_default()
    }

    #[test]
    fn test_few_samples_is_stable() {
        let mut tracker = SpreadRegimeTracker::new(10, dec!(0.1));
        assert_eq!(feed(&mut tracker, &[dec!(0.1), dec!(0.5)]), SpreadRegime::Stable);
    }

    #[test]
    fn test_widening_spreads() {
        let mut tracker = SpreadRegimeTracker::new(10, dec!(0.1));
        let regime = feed(&mut tracker, &[dec!(0.1), dec!(0.1), dec!(0.3), dec!(0.3)]);
        assert_eq!(regime, SpreadRegime::Widening);
    }

    #[test]
    fn test_narrowing_spreads() {
        let mut tracker = SpreadRegimeTracker::new(10, dec!(0.1));
        let regime = feed(&mut tracker, &[dec!(0.4), dec!(0.4), dec!(0.1), dec!(0.1)]);
        assert_eq!(regime, SpreadRegime::Narrowing);
    }

    #[test]
    fn test_small_changes_stay_stable() {
        let mut tracker = SpreadRegimeTracker::new(10, dec!(0.1));
        let regime = feed(&mut tracker, &[dec!(0.20), dec!(0.20), dec!(0.21), dec!(0.21)]);
        assert_eq!(regime, SpreadRegime::Stable);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut tracker = SpreadRegimeTracker::new(4, dec!(0.1));
        feed(&mut tracker, &[dec!(0.1), dec!(0.1), dec!(0.3), dec!(0.3)]);
        let regime = feed(&mut tracker, &[dec!(0.3), dec!(0.3)]);
        assert_eq!(tracker.len(), 4);
        assert_eq!(regime, SpreadRegime::Stable);
    }

    #[test]
    fn test_crossed_quotes_are_ignored() {
        let mut tracker = SpreadRegimeTracker::new(4, dec!(0.1));
        let crossed = Quote::new("ETH", dec!(101), dec!(100), Utc::now());
        tracker.observe(&crossed);
        assert!(tracker.is_empty());
    }
}
