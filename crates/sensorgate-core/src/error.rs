//! Error types for sensorgate-core.
//!
//! Two families of errors live here. [`Error`] covers everything that can go
//! wrong while talking to a peripheral, the cloud, or the persistence layer.
//! [`UpgradeError`] is the terminal reason of a firmware upgrade job; it is
//! cloneable so it can sit inside the transfer phase and be persisted as the
//! job's error message.
//!
//! # Recovery
//!
//! | Error | Strategy |
//! |-------|----------|
//! | [`Error::Timeout`] | Retry; the device state machine reconnects on its own |
//! | [`Error::NotConnected`] | Wait for the reconnect loop |
//! | [`Error::NoServices`] | Re-enable the device; it rejected discovery |
//! | [`Error::InvalidData`] | Do not retry, the payload was malformed |
//! | [`Error::Upgrade`] | Inspect the [`UpgradeError`]; the job already reported it |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the gateway core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device")]
    NotConnected,

    /// Connection succeeded but the peripheral exposed no services.
    #[error("Device exposed no services")]
    NoServices,

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Failed to parse data received from device.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Firmware upgrade failure.
    #[error("Upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Cloud API failure.
    #[error("Cloud error: {0}")]
    Cloud(String),

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with the specified name was not seen.
    NotFound { identifier: String },
    /// Scan timed out before finding the device.
    ScanTimeout { duration: Duration },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

/// Terminal reason of a firmware upgrade job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// The image checksum computed to zero, which the bootloader rejects.
    #[error("Firmware image has an invalid CRC")]
    WrongCrc,
    /// The device echoed a different CRC than the one sent.
    #[error("Device acknowledged CRC {received:#010x}, expected {expected:#010x}")]
    WrongCrcReceived { expected: u32, received: u32 },
    /// A response of unexpected shape arrived while waiting for the CRC echo.
    #[error("Unexpected response from device")]
    UnexpectedResponse,
    /// The finish acknowledgement carried an unknown status byte.
    #[error("Unexpected finish byte from device")]
    UnexpectedFinishByte,
    /// The device stopped answering during the transfer.
    #[error("Data transmission timed out")]
    DataTransmissionTimeout,
    /// The link dropped before or during the transfer.
    #[error("Can't send, device is not connected")]
    CantSendDeviceIsNotConnected,
    /// Another transfer is already running on this device.
    #[error("Upgrade already in progress")]
    AlreadyInProgress,
    /// The user cancelled the job.
    #[error("Upgrade canceled")]
    Canceled,
    /// The downloaded image does not match the MD5 digest from the server.
    #[error("MD5 check failed")]
    Md5CheckFailed,
    /// The Bluetooth radio is off.
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,
    /// No device with this id is registered with the gateway.
    #[error("Device is not registered")]
    DeviceNotRegistered,
    /// The hardware model does not accept OTA images.
    #[error("Device model does not support upgrade")]
    UnsupportedModel,
    /// The device family does not implement the upgrade protocol.
    #[error("Device family does not support upgrade")]
    UnsupportedFamily,
    /// The device did not come back within the prepare window.
    #[error("Failed to connect to device")]
    FailedToConnect,
    /// The firmware image could not be fetched.
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    /// The gateway restarted while the job was running.
    #[error("Upgrade interrupted by restart")]
    Interrupted,
    /// The user chose not to resume an interrupted transfer.
    #[error("Upgrade abandoned")]
    Abandoned,
    /// A write to the debug characteristic failed.
    #[error("Transport error: {0}")]
    Transport(String),
    /// A job field needed by this phase was missing or unreadable.
    #[error("Invalid upgrade job: {0}")]
    InvalidJob(String),
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a storage error from any displayable cause.
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Self::Storage(cause.to_string())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<sensorgate_types::ParseError> for Error {
    fn from(err: sensorgate_types::ParseError) -> Self {
        match err {
            sensorgate_types::ParseError::InsufficientBytes {
                sensor,
                expected,
                actual,
            } => Error::InvalidData(format!(
                "{sensor} payload needs {expected} bytes, got {actual}"
            )),
            sensorgate_types::ParseError::InvalidValue(msg) => Error::InvalidData(msg),
            _ => Error::InvalidData(format!("Parse error: {}", err)),
        }
    }
}

/// Result type alias using sensorgate-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
