//! Gateway configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sensorgate_core::{ConnectionConfig, DeviceDescriptor, ReconnectOptions};
use sensorgate_types::{DeviceFamily, SensorKind};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings shared by all devices.
    pub gateway: GatewayConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Cloud API settings.
    pub cloud: CloudConfig,
    /// Devices to monitor.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// ```
    /// use sensorgate_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.gateway.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.cloud.validate());

        let mut seen_ids = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen_ids.insert(device.id.clone()) {
                errors.push(ValidationError {
                    field: format!("{}.id", prefix),
                    message: format!("duplicate device id '{}'", device.id),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a device by id.
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Sensor sampling period written to every period characteristic, in
    /// units of 10 ms.
    pub sampling_period: u8,
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Delay before reconnecting after a link loss.
    pub reconnect_delay_ms: u64,
    /// Consecutive reconnect attempts before giving up; unlimited if unset.
    pub max_reconnect_attempts: Option<u32>,
    /// Resume upgrades interrupted by a restart instead of abandoning them.
    pub resume_interrupted: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sampling_period: sensorgate_types::types::DEFAULT_PERIOD,
            scan_timeout_secs: 7,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 600,
            max_reconnect_attempts: None,
            resume_interrupted: true,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.sampling_period == 0 {
            errors.push(ValidationError {
                field: "gateway.sampling_period".to_string(),
                message: "sampling period must be > 0".to_string(),
            });
        }
        if self.scan_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "gateway.scan_timeout_secs".to_string(),
                message: "scan timeout must be > 0".to_string(),
            });
        }
        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "gateway.connect_timeout_secs".to_string(),
                message: "connect timeout must be > 0".to_string(),
            });
        }
        if self.reconnect_delay_ms == 0 {
            errors.push(ValidationError {
                field: "gateway.reconnect_delay_ms".to_string(),
                message: "reconnect delay must be > 0".to_string(),
            });
        }

        errors
    }

    /// Connection settings for the device state machine.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut reconnect =
            ReconnectOptions::new().delay(Duration::from_millis(self.reconnect_delay_ms));
        if let Some(attempts) = self.max_reconnect_attempts {
            reconnect = reconnect.max_attempts(attempts);
        }
        ConnectionConfig::new()
            .scan_timeout(Duration::from_secs(self.scan_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .sampling_period(self.sampling_period)
            .reconnect(reconnect)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Directory downloaded firmware images are kept in until flashed.
    pub firmware_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db = sensorgate_store::default_db_path();
        let firmware_dir = db
            .parent()
            .map(|p| p.join("firmware"))
            .unwrap_or_else(|| PathBuf::from("firmware"));
        Self {
            path: db,
            firmware_dir,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }
        if self.firmware_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.firmware_dir".to_string(),
                message: "firmware directory cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Cloud API configuration. Upgrades are disabled without a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// How often reachability is probed.
    pub probe_interval_secs: u64,
}

/// Minimum reachability probe interval in seconds.
pub const MIN_PROBE_INTERVAL: u64 = 5;

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            probe_interval_secs: 30,
        }
    }
}

impl CloudConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(url) = &self.url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            errors.push(ValidationError {
                field: "cloud.url".to_string(),
                message: format!("URL must start with http:// or https://, got '{}'", url),
            });
        }
        if let Some(key) = &self.api_key
            && key.is_empty()
        {
            errors.push(ValidationError {
                field: "cloud.api_key".to_string(),
                message: "api key cannot be empty string (omit it instead)".to_string(),
            });
        }
        if self.probe_interval_secs < MIN_PROBE_INTERVAL {
            errors.push(ValidationError {
                field: "cloud.probe_interval_secs".to_string(),
                message: format!(
                    "probe interval {} is too short (minimum {} seconds)",
                    self.probe_interval_secs, MIN_PROBE_INTERVAL
                ),
            });
        }

        errors
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// A peripheral the gateway should monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Gateway-assigned identifier, used by upgrade commands.
    pub id: String,
    /// Advertised BLE name to scan for.
    pub name: String,
    /// Device family; inferred from the name when omitted.
    #[serde(default)]
    pub family: Option<DeviceFamily>,
    /// Hardware model, required for upgrades.
    #[serde(default)]
    pub model: Option<String>,
    /// Sensors to leave switched off.
    #[serde(default)]
    pub disabled_sensors: Vec<SensorKind>,
}

impl DeviceConfig {
    /// Explicit family, or the one the name implies.
    pub fn resolved_family(&self) -> Option<DeviceFamily> {
        self.family.or_else(|| DeviceFamily::from_name(&self.name))
    }

    /// Descriptor for the device state machine.
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        let family = self.resolved_family()?;
        let descriptor = DeviceDescriptor::new(&self.id, &self.name, family);
        Some(match &self.model {
            Some(model) => descriptor.with_model(model),
            None => descriptor,
        })
    }

    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.id", prefix),
                message: "device id cannot be empty".to_string(),
            });
        }
        if self.name.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.name", prefix),
                message: "device name cannot be empty".to_string(),
            });
        }

        let family = self.resolved_family();
        if family.is_none() && !self.name.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.family", prefix),
                message: format!(
                    "cannot infer device family from name '{}', set it explicitly",
                    self.name
                ),
            });
        }

        if let Some(family) = family {
            for kind in &self.disabled_sensors {
                if !family.sensors().iter().any(|s| s.kind == *kind) {
                    errors.push(ValidationError {
                        field: format!("{}.disabled_sensors", prefix),
                        message: format!("{} has no {} sensor", family, kind),
                    });
                }
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `gateway.sampling_period` or `devices[0].name`).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorgate")
        .join("gateway.toml")
}
