use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{EngineConfig, RunnerConfig};

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Engine parameters (contract, direction, sizing, risk, recovery)
    pub engine: EngineConfig,
    /// Tick loop configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path))
            // e.g. GRID_ENGINE__STOP_PRICE=95000
            .add_source(config::Environment::with_prefix("GRID").separator("__"));
        Self::build(builder)
    }

    /// Parse settings from TOML text, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings
            .engine
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(settings)
    }
}

/// Initialize env_logger, letting `RUST_LOG` win over the configured level
pub fn init_logging(log: &LogConfig) {
    let env = env_logger::Env::default().default_filter_or(log.level.as_str());
    env_logger::Builder::from_env(env).try_init().ok();
}
