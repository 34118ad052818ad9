//! Settings loading
//!
//! Layers, later wins:
//! 1. `config/default.toml`
//! 2. `config/{SPREAD_ENV}.toml`
//! 3. `SPREAD_MONITOR__SECTION__KEY` environment variables

use config::{Config, Environment, File, FileFormat};
use thiserror::Error;

use spread_core::{CoreError, MonitorConfig};

pub type Settings = MonitorConfig;

const ENV_PREFIX: &str = "SPREAD_MONITOR";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] CoreError),
}

/// Load settings from `config/` and the environment
pub fn load_settings() -> Result<Settings, ConfigError> {
    let env = std::env::var("SPREAD_ENV").unwrap_or_else(|_| "development".to_string());
    load_from_dir("config", &env)
}

pub fn load_from_dir(dir: &str, env: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(&format!("{dir}/default")).required(false))
        .add_source(File::with_name(&format!("{dir}/{env}")).required(false))
        .add_source(environment());
    finish(builder)
}

/// Settings from a TOML document plus the environment
pub fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .add_source(environment());
    finish(builder)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Settings, ConfigError> {
    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
