//! Shared types for the pair execution core: configuration, instrument
//! rules, fill events and the local position cache.

pub mod config;
pub mod config_loader;
pub mod events;
pub mod instrument;
pub mod position;

pub use config::{
    AppConfig, MarketDataConfig, PairConfig, PricingConfig, ReconcilerConfig, ResolverConfig,
    SafetyLimits, SubmitterConfig,
};
pub use config_loader::ConfigLoader;
pub use events::{FillEvent, Side};
pub use instrument::InstrumentConfig;
pub use position::{Position, PositionTracker};
