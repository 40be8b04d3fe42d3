//! Platform-agnostic types for the sensorgate BLE gateway.
//!
//! This crate provides shared types that can be used by the BLE core, the
//! persistence layer and the gateway service without pulling in any radio
//! or async runtime dependencies.
//!
//! # Features
//!
//! - Device families and the sensors they expose
//! - UUID constants for BLE services and characteristics
//! - Pure sensor payload decoders with telemetry and display formatting
//! - Firmware version parsing
//! - Persisted firmware-upgrade records
//!
//! # Example
//!
//! ```
//! use sensorgate_types::{SensorKind, codec};
//!
//! let reading = codec::decode(SensorKind::Light, &[0x01, 0x2C]).unwrap();
//! assert_eq!(reading.to_string(), "300 lux");
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod upgrade;
pub mod uuid;

pub use codec::Reading;
pub use error::{ParseError, ParseResult};
pub use types::{DeviceFamily, FirmwareVersion, SensorKind, SensorSpec, Vector3};
pub use upgrade::{PendingTransaction, TransactionOutcome, UpgradeState, UpgradeStatus};
pub use crate::uuid as uuids;
