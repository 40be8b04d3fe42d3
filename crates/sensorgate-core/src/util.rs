//! Utility functions for sensorgate-core.

use btleplug::platform::PeripheralId;

use crate::transport::PeripheralHandle;

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms they are MAC
/// addresses or D-Bus paths. This strips the `PeripheralId(...)` wrapper from
/// the debug representation.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_peripheral_wrapper(&format!("{:?}", id)).to_string()
}

/// Build the transport handle for a btleplug peripheral.
pub fn peripheral_handle(id: &PeripheralId) -> PeripheralHandle {
    PeripheralHandle::new(format_peripheral_id(id))
}

fn strip_peripheral_wrapper(debug: &str) -> &str {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
}

/// Lowercase hex encoding of a digest.
pub fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
