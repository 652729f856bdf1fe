//! Bridge configuration
//!
//! Read from a TOML file, then overridden by `WHEELBRIDGE_*` environment
//! variables. Every section and key is optional; see [`BridgeConfig::default`].
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 5000
//! ack = false
//! # idle_timeout_secs = 30
//!
//! [mapping]
//! mode = "continuous-axis"
//! steering_threshold = 0.3
//! min_update_interval_secs = 0.01
//!
//! [device]
//! backend = "loopback"
//! profile = "joystick"
//! device_id = 1
//!
//! [device.axes]
//! steering = "x"
//! gas = "y"
//! brake = "z"
//!
//! [logging]
//! level = "info"
//! ```

use crate::device::{AxisRange, BackendKind, DeviceProfile, MAX_DEVICE_ID, MIN_DEVICE_ID};
use crate::mapping::{
    AxisConfig, AxisMap, KeyMap, KeyboardConfig, MappingConfig, MappingError, MappingType,
    DEFAULT_STEERING_THRESHOLD,
};
use crate::server::ServerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Level};

const CONFIG_DIR: &str = "wheelbridge";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "WHEELBRIDGE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ack: bool,
    pub idle_timeout_secs: Option<f64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            ack: false,
            idle_timeout_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct MappingSection {
    pub mode: MappingType,
    pub steering_threshold: f64,
    pub min_update_interval_secs: f64,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            mode: MappingType::ContinuousAxis,
            steering_threshold: DEFAULT_STEERING_THRESHOLD,
            min_update_interval_secs: 0.01,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Follows the mapping mode when unset
    pub profile: Option<DeviceProfile>,
    pub device_id: u32,
    pub axis_min: Option<i32>,
    pub axis_max: Option<i32>,
    pub axis_center: Option<i32>,
    /// Physical axis slots, defaults depend on the profile
    pub axes: Option<AxisMap>,
    pub keys: KeyMap,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Loopback,
            profile: None,
            device_id: 1,
            axis_min: None,
            axis_max: None,
            axis_center: None,
            axes: None,
            keys: KeyMap::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub mapping: MappingSection,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

fn parse_serde<T: for<'de> Deserialize<'de>>(
    key: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    T::deserialize(serde::de::value::StrDeserializer::<serde::de::value::Error>::new(
        value.trim(),
    ))
    .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn seconds(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigError::Invalid(format!(
            "{} must be a non-negative number of seconds, got {}",
            key, secs
        ))
    })
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Path of the config file: `$WHEELBRIDGE_CONFIG` or the user config dir
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads `path`, falling back to defaults when the file does not exist
    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded config file {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Loads the config file, applies the process environment and validates
    pub async fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::default_path()).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `WHEELBRIDGE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WHEELBRIDGE_HOST") {
            self.server.host = v.trim().to_string();
        }
        if let Some(v) = lookup("WHEELBRIDGE_PORT") {
            self.server.port = parse_env("WHEELBRIDGE_PORT", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_ACK") {
            self.server.ack = parse_bool("WHEELBRIDGE_ACK", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_IDLE_TIMEOUT") {
            self.server.idle_timeout_secs = Some(parse_env("WHEELBRIDGE_IDLE_TIMEOUT", v)?);
        }
        if let Some(v) = lookup("WHEELBRIDGE_MODE") {
            self.mapping.mode = parse_env("WHEELBRIDGE_MODE", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_THRESHOLD") {
            self.mapping.steering_threshold = parse_env("WHEELBRIDGE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_MIN_UPDATE_INTERVAL") {
            self.mapping.min_update_interval_secs =
                parse_env("WHEELBRIDGE_MIN_UPDATE_INTERVAL", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_BACKEND") {
            self.device.backend = parse_serde("WHEELBRIDGE_BACKEND", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_PROFILE") {
            self.device.profile = Some(parse_serde("WHEELBRIDGE_PROFILE", v)?);
        }
        if let Some(v) = lookup("WHEELBRIDGE_DEVICE_ID") {
            self.device.device_id = parse_env("WHEELBRIDGE_DEVICE_ID", v)?;
        }
        if let Some(v) = lookup("WHEELBRIDGE_AXIS_MIN") {
            self.device.axis_min = Some(parse_env("WHEELBRIDGE_AXIS_MIN", v)?);
        }
        if let Some(v) = lookup("WHEELBRIDGE_AXIS_MAX") {
            self.device.axis_max = Some(parse_env("WHEELBRIDGE_AXIS_MAX", v)?);
        }
        if let Some(v) = lookup("WHEELBRIDGE_AXIS_CENTER") {
            self.device.axis_center = Some(parse_env("WHEELBRIDGE_AXIS_CENTER", v)?);
        }
        if let Some(v) = lookup("WHEELBRIDGE_LOG") {
            self.logging.level = v.trim().to_string();
        }
        Ok(())
    }

    /// Profile in effect: explicit setting or derived from the mode
    pub fn profile(&self) -> DeviceProfile {
        self.device.profile.unwrap_or(match self.mapping.mode {
            MappingType::DiscreteKeys => DeviceProfile::Keyboard,
            MappingType::ContinuousAxis => DeviceProfile::Joystick,
        })
    }

    /// Axis range in effect, `None` for profiles without axes
    pub fn axis_range(&self) -> Option<AxisRange> {
        let default = self.profile().default_range();
        match (self.device.axis_min, self.device.axis_max, default) {
            (None, None, default) => default,
            (min, max, Some(default)) => Some(AxisRange::new(
                min.unwrap_or(default.min),
                max.unwrap_or(default.max),
            )),
            (min, max, None) => Some(AxisRange::new(min.unwrap_or(0), max.unwrap_or(0))),
        }
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.logging.level.trim()).map_err(|_| {
            ConfigError::Invalid(format!("unknown log level {:?}", self.logging.level))
        })
    }

    pub fn server_options(&self) -> Result<ServerOptions, ConfigError> {
        let idle_timeout = self
            .server
            .idle_timeout_secs
            .map(|secs| seconds("server.idle_timeout_secs", secs))
            .transpose()?;
        Ok(ServerOptions {
            ack: self.server.ack,
            idle_timeout,
        })
    }

    /// Builds the mapping configuration for the configured mode
    pub fn mapping_config(&self) -> Result<Arc<dyn MappingConfig>, ConfigError> {
        let config: Arc<dyn MappingConfig> = match self.mapping.mode {
            MappingType::DiscreteKeys => Arc::new(KeyboardConfig::new(
                self.mapping.steering_threshold,
                self.device.keys,
            )),
            MappingType::ContinuousAxis => {
                let profile = self.profile();
                let range = self.axis_range().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "profile {} has no axes, continuous-axis mode needs joystick or gamepad",
                        profile
                    ))
                })?;
                let axes = self.device.axes.unwrap_or_else(|| AxisMap::for_profile(profile));
                let interval = seconds(
                    "mapping.min_update_interval_secs",
                    self.mapping.min_update_interval_secs,
                )?;
                Arc::new(
                    AxisConfig::new(range, axes)
                        .with_center(self.device.axis_center)
                        .with_min_update_interval(interval)
                        .with_threshold(self.mapping.steering_threshold),
                )
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every cross-field rule without touching the device
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_DEVICE_ID..=MAX_DEVICE_ID).contains(&self.device.device_id) {
            return Err(ConfigError::Invalid(format!(
                "device_id {} is outside {}..={}",
                self.device.device_id, MIN_DEVICE_ID, MAX_DEVICE_ID
            )));
        }
        if self.mapping.mode == MappingType::ContinuousAxis
            && self.profile() == DeviceProfile::Keyboard
        {
            return Err(ConfigError::Invalid(
                "continuous-axis mode cannot drive the keyboard profile".to_string(),
            ));
        }
        self.log_level()?;
        self.server_options()?;
        self.mapping_config()?;
        Ok(())
    }
}
