use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

use crate::config::LadderConfig;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the ladder configuration from `config/Config.toml` merged with
    /// `LADDER_` environment variables (`LADDER_SCHEDULER__MAX_ROLLS_PER_CYCLE=5`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the result fails validation.
    pub fn load() -> Result<LadderConfig> {
        Self::load_from("config/Config.toml")
    }

    /// Loads the configuration from a specific file. A missing file yields
    /// the built-in defaults (plus environment overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the result fails validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<LadderConfig> {
        let path = path.as_ref();
        let config: LadderConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LADDER_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        config.validate().context("Invalid ladder configuration")?;
        Ok(config)
    }

    /// Loads the base file with a profile overlay (`Config.{profile}.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or validation fails.
    pub fn load_with_profile(profile: &str) -> Result<LadderConfig> {
        let config: LadderConfig = Figment::new()
            .merge(Toml::file("config/Config.toml"))
            .merge(Toml::file(format!("config/Config.{profile}.toml")))
            .merge(Env::prefixed("LADDER_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config profile {profile}"))?;

        config.validate().context("Invalid ladder configuration")?;
        Ok(config)
    }
}
