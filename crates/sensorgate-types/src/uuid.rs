//! Bluetooth UUIDs for supported sensor families.
//!
//! This module contains all the UUIDs needed to talk to the peripherals the
//! gateway understands over Bluetooth Low Energy.

use uuid::{Uuid, uuid};

// --- SensorTag (one service per sensor) ---

/// IR thermopile temperature service.
pub const IR_TEMPERATURE_SERVICE: Uuid = uuid!("f000aa00-0451-4000-b000-000000000000");
/// IR temperature data (notify).
pub const IR_TEMPERATURE_DATA: Uuid = uuid!("f000aa01-0451-4000-b000-000000000000");
/// IR temperature configuration.
pub const IR_TEMPERATURE_CONFIG: Uuid = uuid!("f000aa02-0451-4000-b000-000000000000");
/// IR temperature sampling period.
pub const IR_TEMPERATURE_PERIOD: Uuid = uuid!("f000aa03-0451-4000-b000-000000000000");

/// Humidity service.
pub const HUMIDITY_SERVICE: Uuid = uuid!("f000aa20-0451-4000-b000-000000000000");
/// Humidity data (notify).
pub const HUMIDITY_DATA: Uuid = uuid!("f000aa21-0451-4000-b000-000000000000");
/// Humidity configuration.
pub const HUMIDITY_CONFIG: Uuid = uuid!("f000aa22-0451-4000-b000-000000000000");
/// Humidity sampling period.
pub const HUMIDITY_PERIOD: Uuid = uuid!("f000aa23-0451-4000-b000-000000000000");

/// Barometric pressure service.
pub const BAROMETER_SERVICE: Uuid = uuid!("f000aa40-0451-4000-b000-000000000000");
/// Barometer data (notify).
pub const BAROMETER_DATA: Uuid = uuid!("f000aa41-0451-4000-b000-000000000000");
/// Barometer configuration.
pub const BAROMETER_CONFIG: Uuid = uuid!("f000aa42-0451-4000-b000-000000000000");
/// Barometer sampling period.
pub const BAROMETER_PERIOD: Uuid = uuid!("f000aa44-0451-4000-b000-000000000000");

/// Optical (lux) sensor service.
pub const OPTICAL_SERVICE: Uuid = uuid!("f000aa70-0451-4000-b000-000000000000");
/// Optical data (notify).
pub const OPTICAL_DATA: Uuid = uuid!("f000aa71-0451-4000-b000-000000000000");
/// Optical configuration.
pub const OPTICAL_CONFIG: Uuid = uuid!("f000aa72-0451-4000-b000-000000000000");
/// Optical sampling period.
pub const OPTICAL_PERIOD: Uuid = uuid!("f000aa73-0451-4000-b000-000000000000");

/// Movement (gyroscope, accelerometer, magnetometer) service.
pub const MOVEMENT_SERVICE: Uuid = uuid!("f000aa80-0451-4000-b000-000000000000");
/// Movement data (notify).
pub const MOVEMENT_DATA: Uuid = uuid!("f000aa81-0451-4000-b000-000000000000");
/// Movement configuration (16-bit axis enable mask).
pub const MOVEMENT_CONFIG: Uuid = uuid!("f000aa82-0451-4000-b000-000000000000");
/// Movement sampling period.
pub const MOVEMENT_PERIOD: Uuid = uuid!("f000aa83-0451-4000-b000-000000000000");

// --- SensorNode (single multiplexed service) ---

/// SensorNode primary service; every sensor characteristic lives here.
pub const NODE_SERVICE: Uuid = uuid!("a5e10100-1c2b-4d6e-9f80-5b3c7d9e0a11");

/// Accelerometer data (notify).
pub const NODE_ACCEL_DATA: Uuid = uuid!("a5e10101-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Accelerometer configuration.
pub const NODE_ACCEL_CONFIG: Uuid = uuid!("a5e10102-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Accelerometer sampling period.
pub const NODE_ACCEL_PERIOD: Uuid = uuid!("a5e10103-1c2b-4d6e-9f80-5b3c7d9e0a11");

/// Gyroscope data (notify).
pub const NODE_GYRO_DATA: Uuid = uuid!("a5e10111-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Gyroscope configuration.
pub const NODE_GYRO_CONFIG: Uuid = uuid!("a5e10112-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Gyroscope sampling period.
pub const NODE_GYRO_PERIOD: Uuid = uuid!("a5e10113-1c2b-4d6e-9f80-5b3c7d9e0a11");

/// Environment (temperature, humidity, pressure) data (notify).
pub const NODE_ENV_DATA: Uuid = uuid!("a5e10121-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Environment configuration.
pub const NODE_ENV_CONFIG: Uuid = uuid!("a5e10122-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Environment sampling period.
pub const NODE_ENV_PERIOD: Uuid = uuid!("a5e10123-1c2b-4d6e-9f80-5b3c7d9e0a11");

/// Ambient light data (notify).
pub const NODE_LIGHT_DATA: Uuid = uuid!("a5e10131-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Ambient light configuration.
pub const NODE_LIGHT_CONFIG: Uuid = uuid!("a5e10132-1c2b-4d6e-9f80-5b3c7d9e0a11");
/// Ambient light sampling period.
pub const NODE_LIGHT_PERIOD: Uuid = uuid!("a5e10133-1c2b-4d6e-9f80-5b3c7d9e0a11");

/// Debug / command channel (write + notify). Carries `versionFw` queries and
/// the firmware upgrade protocol.
pub const NODE_DEBUG: Uuid = uuid!("a5e101f0-1c2b-4d6e-9f80-5b3c7d9e0a11");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensortag_uuids_share_base() {
        for id in [
            IR_TEMPERATURE_DATA,
            HUMIDITY_DATA,
            BAROMETER_DATA,
            OPTICAL_DATA,
            MOVEMENT_DATA,
        ] {
            assert!(id.to_string().ends_with("-0451-4000-b000-000000000000"));
        }
    }

    #[test]
    fn test_node_characteristics_are_distinct() {
        let all = [
            NODE_ACCEL_DATA,
            NODE_ACCEL_CONFIG,
            NODE_ACCEL_PERIOD,
            NODE_GYRO_DATA,
            NODE_GYRO_CONFIG,
            NODE_GYRO_PERIOD,
            NODE_ENV_DATA,
            NODE_ENV_CONFIG,
            NODE_ENV_PERIOD,
            NODE_LIGHT_DATA,
            NODE_LIGHT_CONFIG,
            NODE_LIGHT_PERIOD,
            NODE_DEBUG,
        ];
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
        assert!(!all.contains(&NODE_SERVICE));
    }
}
