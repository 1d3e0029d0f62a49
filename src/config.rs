//! Broker configuration using Figment
//!
//! Configuration is loaded from:
//! 1. built-in defaults
//! 2. `config/broker.toml` (or the file passed on the command line)
//! 3. environment variables prefixed with `DAQ_BROKER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_BROKER_APPLICATION__LOG_LEVEL=debug
//! DAQ_BROKER_APPLICATION__NAME="Motion rack"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_broker::config::BrokerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::load()?;
//!     println!("Application: {}", config.application.name);
//!     println!("Devices: {}", config.devices.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/broker.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "DAQ_BROKER_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The merged configuration is inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Devices served by the device registry
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-broker".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Kind of reference device to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Counter device with a bell
    Test,
    /// Simulated stepper motor
    StepperMotor,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier, used for selection
    pub id: String,
    /// Which reference device to build
    pub kind: DeviceKind,
    /// Whether this device is registered at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Stepper motor options; defaults apply when absent
    #[serde(default)]
    pub stepper_motor: Option<StepperMotorSettings>,
}

/// Simulated stepper motor options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperMotorSettings {
    /// Position in steps at startup
    #[serde(default)]
    pub initial_position: i64,
    /// Whether the motor may be enabled and disabled
    #[serde(default = "default_enableable")]
    pub enableable: bool,
    /// Time per step in milliseconds
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
}

impl Default for StepperMotorSettings {
    fn default() -> Self {
        Self {
            initial_position: 0,
            enableable: default_enableable(),
            step_delay_ms: default_step_delay(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_enableable() -> bool {
    true
}

fn default_step_delay() -> u64 {
    2
}

impl BrokerConfig {
    /// Load configuration from `config/broker.toml` and environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Device IDs are non-empty and unique
    /// - Stepper motor options only appear on stepper motors
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Device ID cannot be empty".to_string(),
                ));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
            if device.kind != DeviceKind::StepperMotor && device.stepper_motor.is_some() {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' has a 'stepper_motor' block but is not a stepper motor",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Devices to register at startup.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
