//! BLE sensor gateway daemon.
//!
//! This crate wires the sensorgate core into a long-running service that:
//! - Keeps every configured peripheral connected and streaming readings
//! - Accepts firmware upgrade commands and drives them to completion
//! - Persists upgrade records and undelivered cloud reports in SQLite
//! - Replays queued reports whenever the cloud becomes reachable
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/sensorgate/gateway.toml`:
//!
//! ```toml
//! [gateway]
//! sampling_period = 100       # units of 10 ms
//! reconnect_delay_ms = 600
//! resume_interrupted = true
//!
//! [storage]
//! path = "~/.local/share/sensorgate/gateway.db"
//!
//! [cloud]
//! url = "https://iot.example.com/api"
//! probe_interval_secs = 30
//!
//! [[devices]]
//! id = "node-1"
//! name = "SensorNode 4F2A"
//! model = "SN-100"
//! disabled_sensors = ["light"]
//! ```
//!
//! # Upgrade commands
//!
//! While running, the daemon reads one JSON upgrade command per line on
//! stdin:
//!
//! ```text
//! {"device_id":"node-1","transaction_id":"tx-42","file_token":"f9c1","md5":"5d41402abc4b2a76b9719d911017c592"}
//! ```

pub mod config;
pub mod gateway;
pub mod telemetry;

pub use config::{
    CloudConfig, Config, ConfigError, DeviceConfig, GatewayConfig, StorageConfig,
    ValidationError, default_config_path,
};
pub use gateway::{Gateway, GatewayError};
