use crate::instrument::InstrumentConfig;
use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the pair execution core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub instruments: Vec<InstrumentConfig>,
    pub pair: PairConfig,
    pub market_data: MarketDataConfig,
    pub pricing: PricingConfig,
    pub submitter: SubmitterConfig,
    pub resolver: ResolverConfig,
    pub reconciler: ReconcilerConfig,
    pub safety: SafetyLimits,
}

/// The two instruments traded together and the notional each leg targets.
///
/// BUILD buys `leg_a` and sells `leg_b`; UNWIND closes whatever is held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairConfig {
    pub leg_a: String,
    pub leg_b: String,
    /// Notional value each leg targets, in quote currency.
    pub target_notional: Decimal,
    /// Overall deadline for both legs of one cycle.
    #[serde(with = "duration_ms")]
    pub cycle_deadline: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketDataConfig {
    /// Polling interval when no push stream is available.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long to stay on polling before trying the push stream again.
    #[serde(with = "duration_ms")]
    pub resubscribe_after: Duration,
    /// Number of spread samples kept per instrument.
    pub regime_window: usize,
    /// Relative change in mean spread that flips the regime.
    pub regime_threshold: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// Quotes older than this are rejected.
    #[serde(with = "duration_ms")]
    pub max_quote_age: Duration,
    pub offset_narrowing_bps: Decimal,
    pub offset_stable_bps: Decimal,
    pub offset_widening_bps: Decimal,
    /// Maximum VWAP slippage versus touch accepted by the depth walk.
    pub max_slippage_bps: Decimal,
    /// How far through the touch emergency orders are priced.
    pub emergency_cross_bps: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubmitterConfig {
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub base_deadline: Duration,
    /// Extra wait per unit of quantity, in milliseconds.
    pub deadline_per_unit_ms: Decimal,
    #[serde(with = "duration_ms")]
    pub min_deadline: Duration,
    #[serde(with = "duration_ms")]
    pub max_deadline: Duration,
    /// Deadline multiplier while spreads widen.
    pub widening_factor: Decimal,
    /// Deadline multiplier while spreads narrow.
    pub narrowing_factor: Decimal,
    /// Deadline for crossing IOC orders.
    #[serde(with = "duration_ms")]
    pub emergency_deadline: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Average fill ratio below which the entry is aborted.
    pub low_fill_ratio: Decimal,
    /// Average fill ratio above which a small imbalance is accepted.
    pub high_fill_ratio: Decimal,
    /// Largest cross-leg ratio difference accepted as-is.
    pub accept_imbalance: Decimal,
    /// Cross-leg ratio difference that forces an unwind of the larger leg.
    pub hard_imbalance: Decimal,
    /// A leg whose fill ratio is within this of 1 counts as complete.
    pub full_fill_tolerance: Decimal,
    pub max_retry_attempts: u32,
    /// Extra aggressiveness added per retry attempt.
    pub retry_step_bps: Decimal,
    pub max_unwind_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Absolute quantity difference tolerated before the local cache is corrected.
    pub tolerance: Decimal,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyLimits {
    /// Largest absolute notional held in any one instrument.
    pub max_position_notional: Decimal,
    /// Largest realized loss per UTC day, as a positive amount.
    pub max_daily_loss: Decimal,
    /// Largest net delta as a fraction of the pair target notional.
    pub max_net_delta_fraction: Decimal,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            leg_a: "LEG-A".to_string(),
            leg_b: "LEG-B".to_string(),
            target_notional: Decimal::new(1000, 0),
            cycle_deadline: Duration::from_secs(30),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            resubscribe_after: Duration::from_secs(30),
            regime_window: 20,
            regime_threshold: Decimal::new(10, 2),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            max_quote_age: Duration::from_secs(2),
            offset_narrowing_bps: Decimal::ZERO,
            offset_stable_bps: Decimal::ONE,
            offset_widening_bps: Decimal::new(3, 0),
            max_slippage_bps: Decimal::new(10, 0),
            emergency_cross_bps: Decimal::new(50, 0),
        }
    }
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            base_deadline: Duration::from_secs(3),
            deadline_per_unit_ms: Decimal::new(10, 0),
            min_deadline: Duration::from_secs(1),
            max_deadline: Duration::from_secs(10),
            widening_factor: Decimal::new(5, 1),
            narrowing_factor: Decimal::new(15, 1),
            emergency_deadline: Duration::from_secs(2),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            low_fill_ratio: Decimal::new(20, 2),
            high_fill_ratio: Decimal::new(80, 2),
            accept_imbalance: Decimal::new(5, 2),
            hard_imbalance: Decimal::new(50, 2),
            full_fill_tolerance: Decimal::new(1, 3),
            max_retry_attempts: 3,
            retry_step_bps: Decimal::new(2, 0),
            max_unwind_attempts: 3,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(1, 3),
            retry_delay: Duration::from_millis(250),
            max_attempts: 5,
        }
    }
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_position_notional: Decimal::new(5000, 0),
            max_daily_loss: Decimal::new(100, 0),
            max_net_delta_fraction: Decimal::new(10, 2),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let pair = PairConfig::default();
        Self {
            instruments: vec![
                InstrumentConfig::new(&pair.leg_a, Decimal::new(1, 2), Decimal::new(1, 3)),
                InstrumentConfig::new(&pair.leg_b, Decimal::new(1, 2), Decimal::new(1, 3)),
            ],
            pair,
            market_data: MarketDataConfig::default(),
            pricing: PricingConfig::default(),
            submitter: SubmitterConfig::default(),
            resolver: ResolverConfig::default(),
            reconciler: ReconcilerConfig::default(),
            safety: SafetyLimits::default(),
        }
    }
}

impl SafetyLimits {
    /// Tight limits for first runs with real money.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_position_notional: Decimal::new(1000, 0),
            max_daily_loss: Decimal::new(25, 0),
            max_net_delta_fraction: Decimal::new(5, 2),
        }
    }

    #[must_use]
    pub const fn with_max_position_notional(mut self, notional: Decimal) -> Self {
        self.max_position_notional = notional;
        self
    }

    #[must_use]
    pub const fn with_max_daily_loss(mut self, loss: Decimal) -> Self {
        self.max_daily_loss = loss;
        self
    }

    #[must_use]
    pub const fn with_max_net_delta_fraction(mut self, fraction: Decimal) -> Self {
        self.max_net_delta_fraction = fraction;
        self
    }
}

impl ResolverConfig {
    /// Fewer retries and a tighter accept band.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            accept_imbalance: Decimal::new(2, 2),
            max_retry_attempts: 2,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_max_unwind_attempts(mut self, attempts: u32) -> Self {
        self.max_unwind_attempts = attempts;
        self
    }
}

impl SubmitterConfig {
    /// Short waits for simulated exchanges.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            base_deadline: Duration::from_millis(60),
            deadline_per_unit_ms: Decimal::ZERO,
            min_deadline: Duration::from_millis(30),
            max_deadline: Duration::from_millis(200),
            emergency_deadline: Duration::from_millis(60),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_base_deadline(mut self, deadline: Duration) -> Self {
        self.base_deadline = deadline;
        self
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl PricingConfig {
    #[must_use]
    pub const fn with_max_quote_age(mut self, age: Duration) -> Self {
        self.max_quote_age = age;
        self
    }

    #[must_use]
    pub const fn with_max_slippage_bps(mut self, bps: Decimal) -> Self {
        self.max_slippage_bps = bps;
        self
    }
}

impl AppConfig {
    /// Looks up an instrument by identifier.
    #[must_use]
    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.id == id)
    }

    /// Checks invariants that span several sections.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invariant that does not hold.
    pub fn validate(&self) -> Result<()> {
        if self.pair.leg_a == self.pair.leg_b {
            bail!("pair legs must be different instruments, both are {}", self.pair.leg_a);
        }
        for id in [&self.pair.leg_a, &self.pair.leg_b] {
            let Some(instrument) = self.instrument(id) else {
                bail!("pair instrument {id} has no instrument config");
            };
            instrument.validate()?;
        }
        if self.pair.target_notional <= Decimal::ZERO {
            bail!("target_notional must be positive, got {}", self.pair.target_notional);
        }

        let r = &self.resolver;
        if !(Decimal::ZERO <= r.low_fill_ratio
            && r.low_fill_ratio < r.high_fill_ratio
            && r.high_fill_ratio <= Decimal::ONE)
        {
            bail!(
                "fill ratio thresholds must satisfy 0 <= low < high <= 1, got low={} high={}",
                r.low_fill_ratio,
                r.high_fill_ratio
            );
        }
        if r.accept_imbalance > r.hard_imbalance {
            bail!(
                "accept_imbalance {} must not exceed hard_imbalance {}",
                r.accept_imbalance,
                r.hard_imbalance
            );
        }

        let s = &self.submitter;
        if s.min_deadline > s.max_deadline {
            bail!("submitter min_deadline exceeds max_deadline");
        }
        if s.poll_interval.is_zero() {
            bail!("submitter poll_interval must be non-zero");
        }

        if self.safety.max_daily_loss < Decimal::ZERO {
            bail!("max_daily_loss is a positive amount, got {}", self.safety.max_daily_loss);
        }
        if self.reconciler.tolerance < Decimal::ZERO {
            bail!("reconciler tolerance must be non-negative");
        }
        Ok(())
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==== Defaults Tests ====

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.instrument("LEG-A").is_some());
        assert!(config.instrument("LEG-C").is_none());
    }

    #[test]
    fn test_conservative_limits_are_tighter() {
        let default = SafetyLimits::default();
        let conservative = SafetyLimits::conservative();
        assert!(conservative.max_daily_loss < default.max_daily_loss);
        assert!(conservative.max_position_notional < default.max_position_notional);
    }

    #[test]
    fn test_builder_methods() {
        let limits = SafetyLimits::default()
            .with_max_daily_loss(dec!(50))
            .with_max_net_delta_fraction(dec!(0.02));
        assert_eq!(limits.max_daily_loss, dec!(50));
        assert_eq!(limits.max_net_delta_fraction, dec!(0.02));
    }

    // ==== Validation Tests ====

    #[test]
    fn test_validate_rejects_same_instrument_twice() {
        let mut config = AppConfig::default();
        config.pair.leg_b = config.pair.leg_a.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_instrument() {
        let mut config = AppConfig::default();
        config.instruments.pop();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("LEG-B"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = AppConfig::default();
        config.resolver.low_fill_ratio = dec!(0.9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_accept_above_hard_imbalance() {
        let mut config = AppConfig::default();
        config.resolver.accept_imbalance = dec!(0.6);
        assert!(config.validate().is_err());
    }

    // ==== Serde Tests ====

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = AppConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["pair"]["cycle_deadline"], 30_000);
        assert_eq!(json["submitter"]["poll_interval"], 250);
    }

    #[test]
    fn test_json_roundtrip_preserves_config() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"pair": {"target_notional": "250"}}"#).unwrap();
        assert_eq!(parsed.pair.target_notional, dec!(250));
        assert_eq!(parsed.pair.leg_a, "LEG-A");
        assert_eq!(parsed.resolver, ResolverConfig::default());
    }
}
