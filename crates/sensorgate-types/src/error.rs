//! Error types for data parsing in sensorgate-types.

use thiserror::Error;

/// Errors that can occur when decoding sensor payloads or protocol lines.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in sensorgate-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The payload is shorter than the fixed layout of the sensor.
    #[error("Invalid data: {sensor} requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Sensor that produced the payload.
        sensor: &'static str,
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes received.
        actual: usize,
    },

    /// A value could not be interpreted.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Unknown status or state name in persisted data.
    #[error("Unknown upgrade state: {0}")]
    UnknownState(String),
}

/// Result type alias using sensorgate-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_bytes_display() {
        let err = ParseError::InsufficientBytes {
            sensor: "humidity",
            expected: 4,
            actual: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("humidity"));
        assert!(msg.contains("requires 4 bytes"));
        assert!(msg.contains("got 2"));
    }
}
