use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "PAIRTRADE_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration by merging defaults, `config/PairTrade.toml` and
    /// `PAIRTRADE_` environment variables (nested keys split on `__`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load() -> Result<AppConfig> {
        Self::load_from("config", None)
    }

    /// Loads configuration with a profile overlay from `config/PairTrade.{profile}.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from("config", Some(profile))
    }

    /// Loads configuration from an explicit directory.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load_from(dir: impl AsRef<Path>, profile: Option<&str>) -> Result<AppConfig> {
        let dir = dir.as_ref();
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(dir.join("PairTrade.toml")));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(dir.join(format!("PairTrade.{profile}.toml"))));
        }
        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        tracing::info!(
            leg_a = %config.pair.leg_a,
            leg_b = %config.pair.leg_b,
            target_notional = %config.pair.target_notional,
            profile = profile.unwrap_or("default"),
            "Loaded pair execution config"
        );
        Ok(config)
    }
}
