//! BLE core of the sensorgate gateway.
//!
//! This crate drives SensorTag and SensorNode peripherals over Bluetooth Low
//! Energy and flashes new firmware onto SensorNodes.
//!
//! # Features
//!
//! - **Device state machine**: scan, connect, discover sensors, monitor
//! - **Sensor dispatch**: per-service sensors on SensorTag, multiplexed on SensorNode
//! - **Auto-reconnection**: reconnect after link loss while a device is enabled
//! - **Firmware transfer**: CRC-checked block upload over the debug channel
//! - **Upgrade orchestration**: download, MD5 check, flash, report, with
//!   persisted state and replay of reports queued while offline
//!
//! Radio, storage, cloud and host hooks are traits ([`Transport`],
//! [`UpgradeStore`], [`CloudApi`], [`AppState`]), so the whole stack runs
//! against the in-memory implementations in [`mock`].
//!
//! # Quick Start
//!
//! ```no_run
//! use sensorgate_core::{
//!     BtleTransport, ConnectionConfig, DeviceConnection, DeviceContext, DeviceDescriptor,
//! };
//! use sensorgate_types::DeviceFamily;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleTransport::new().await?;
//!     let device = DeviceConnection::new(
//!         DeviceDescriptor::new("node-1", "SensorNode 01", DeviceFamily::SensorNode),
//!         DeviceContext::new(transport),
//!         ConnectionConfig::default(),
//!     );
//!
//!     device.enable().await?;
//!     println!("{} is {}", device.name(), device.state().await);
//!
//!     let version = device.query_firmware_version().await?;
//!     println!("firmware {version}");
//!     Ok(())
//! }
//! ```

pub mod btle;
#[cfg(feature = "cloud-client")]
pub mod cloud_client;
pub mod connection;
pub mod error;
pub mod events;
pub mod mock;
pub mod reconnect;
pub mod traits;
pub mod transport;
pub mod upgrade;
pub mod util;

pub use sensorgate_types::codec;
pub use sensorgate_types::types;
pub use sensorgate_types::uuid as uuids;

pub use btle::BtleTransport;
#[cfg(feature = "cloud-client")]
pub use cloud_client::{CloudClientConfig, HttpCloudClient};
pub use connection::{
    ConnectionConfig, ConnectionState, DeviceConnection, DeviceContext, DeviceDescriptor, Sensor,
};
pub use error::{DeviceNotFoundReason, Error, Result, UpgradeError};
pub use events::{EventDispatcher, GatewayEvent};
pub use reconnect::ReconnectOptions;
pub use traits::{
    AlwaysForeground, AppState, CloudApi, DeviceDelegate, NoopDelegate, UpgradeDelegate,
    UpgradeStore,
};
pub use transport::{PeripheralHandle, Transport, TransportEvent, TransportEvents};
pub use upgrade::{
    CommandDisposition, TransferReport, UpgradeConfig, UpgradeContext, UpgradeEngine, UpgradeJob,
    UpgradeManager, UpgradeManagerConfig, crc32,
};
pub use util::format_peripheral_id;

/// Type alias for a shared device reference.
pub type SharedDevice = std::sync::Arc<DeviceConnection>;

pub use sensorgate_types::{
    DeviceFamily, FirmwareVersion, PendingTransaction, Reading, SensorKind, TransactionOutcome,
    UpgradeState, UpgradeStatus,
};
