//! Core types describing device families, their sensors, and firmware versions.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;
use crate::uuid as ble;

/// Family of a BLE sensor peripheral.
///
/// The family decides how sensors are laid out on the GATT server, which
/// byte order the payloads use, and whether the device can be upgraded over
/// the air.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new families
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DeviceFamily {
    /// Multi-sensor tag with one GATT service per sensor, little-endian payloads.
    SensorTag,
    /// Sensor node with a single multiplexed service, big-endian payloads,
    /// and a debug channel that supports firmware upgrade.
    SensorNode,
}

/// Hardware models of the SensorNode family whose bootloader accepts OTA images.
pub const UPGRADABLE_NODE_MODELS: &[&str] = &["SN-100", "SN-200"];

impl DeviceFamily {
    /// Detect the family from an advertised device name (case-insensitive).
    ///
    /// ```
    /// use sensorgate_types::DeviceFamily;
    ///
    /// assert_eq!(DeviceFamily::from_name("CC2650 SensorTag"), Some(DeviceFamily::SensorTag));
    /// assert_eq!(DeviceFamily::from_name("SensorNode 4F2A"), Some(DeviceFamily::SensorNode));
    /// assert_eq!(DeviceFamily::from_name("Headphones"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.contains("sensortag") || lower.contains("cc2650") {
            Some(DeviceFamily::SensorTag)
        } else if lower.contains("sensornode") || lower.starts_with("snode") {
            Some(DeviceFamily::SensorNode)
        } else {
            None
        }
    }

    /// Whether several sensors share one service.
    ///
    /// Multiplexed families dispatch characteristic updates by characteristic
    /// UUID; the others dispatch by service UUID.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, DeviceFamily::SensorNode)
    }

    /// Whether this family implements the firmware upgrade protocol.
    #[must_use]
    pub fn supports_upgrade(&self) -> bool {
        matches!(self, DeviceFamily::SensorNode)
    }

    /// Whether a given hardware model of this family accepts OTA images.
    #[must_use]
    pub fn model_supports_upgrade(&self, model: &str) -> bool {
        self.supports_upgrade() && UPGRADABLE_NODE_MODELS.contains(&model)
    }

    /// Debug/command characteristic, if the family has one.
    #[must_use]
    pub fn debug_characteristic(&self) -> Option<Uuid> {
        match self {
            DeviceFamily::SensorNode => Some(ble::NODE_DEBUG),
            DeviceFamily::SensorTag => None,
        }
    }

    /// All sensors this family may expose.
    #[must_use]
    pub fn sensors(&self) -> &'static [SensorSpec] {
        match self {
            DeviceFamily::SensorTag => SENSORTAG_SENSORS,
            DeviceFamily::SensorNode => NODE_SENSORS,
        }
    }

    /// Find the sensor that owns a discovered service/characteristic pair.
    ///
    /// Multiplexed families match on the data characteristic; the others on
    /// the service.
    #[must_use]
    pub fn match_sensor(&self, service: Uuid, characteristic: Uuid) -> Option<&'static SensorSpec> {
        self.sensors().iter().find(|spec| {
            if self.is_multiplexed() {
                spec.service == service && spec.data == characteristic
            } else {
                spec.service == service
            }
        })
    }

    /// Dispatch key used for incoming characteristic updates.
    #[must_use]
    pub fn dispatch_key(&self, service: Uuid, characteristic: Uuid) -> Uuid {
        if self.is_multiplexed() {
            characteristic
        } else {
            service
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::SensorTag => write!(f, "SensorTag"),
            DeviceFamily::SensorNode => write!(f, "SensorNode"),
        }
    }
}

/// Kind of sensor exposed by a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum SensorKind {
    /// SensorTag IR thermopile (object + ambient temperature).
    IrTemperature,
    /// SensorTag humidity sensor (temperature + relative humidity).
    Humidity,
    /// SensorTag barometer (temperature + pressure).
    Barometer,
    /// SensorTag optical sensor (lux).
    Optical,
    /// SensorTag 9-axis movement sensor.
    Movement,
    /// SensorNode accelerometer.
    Accelerometer,
    /// SensorNode gyroscope.
    Gyroscope,
    /// SensorNode combined environment sensor.
    Environment,
    /// SensorNode ambient light sensor.
    Light,
}

impl SensorKind {
    /// Stable lowercase name, used for logs, telemetry topics and config keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::IrTemperature => "ir_temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Barometer => "barometer",
            SensorKind::Optical => "optical",
            SensorKind::Movement => "movement",
            SensorKind::Accelerometer => "accelerometer",
            SensorKind::Gyroscope => "gyroscope",
            SensorKind::Environment => "environment",
            SensorKind::Light => "light",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "ir_temperature" => SensorKind::IrTemperature,
            "humidity" => SensorKind::Humidity,
            "barometer" => SensorKind::Barometer,
            "optical" => SensorKind::Optical,
            "movement" => SensorKind::Movement,
            "accelerometer" => SensorKind::Accelerometer,
            "gyroscope" => SensorKind::Gyroscope,
            "environment" => SensorKind::Environment,
            "light" => SensorKind::Light,
            other => return Err(ParseError::InvalidValue(format!("unknown sensor '{other}'"))),
        };
        Ok(kind)
    }
}

/// Static description of where a sensor lives on the GATT server and how to
/// switch it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSpec {
    /// Sensor kind.
    pub kind: SensorKind,
    /// Service the sensor belongs to.
    pub service: Uuid,
    /// Notification (data) characteristic.
    pub data: Uuid,
    /// Configuration characteristic.
    pub config: Uuid,
    /// Sampling period characteristic.
    pub period: Uuid,
    /// Bytes written to the configuration characteristic to enable the sensor.
    pub enable: &'static [u8],
    /// Bytes written to the configuration characteristic to disable the sensor.
    pub disable: &'static [u8],
}

/// Default sampling period byte (units of 10 ms, so one second).
pub const DEFAULT_PERIOD: u8 = 100;

const SENSORTAG_SENSORS: &[SensorSpec] = &[
    SensorSpec {
        kind: SensorKind::IrTemperature,
        service: ble::IR_TEMPERATURE_SERVICE,
        data: ble::IR_TEMPERATURE_DATA,
        config: ble::IR_TEMPERATURE_CONFIG,
        period: ble::IR_TEMPERATURE_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Humidity,
        service: ble::HUMIDITY_SERVICE,
        data: ble::HUMIDITY_DATA,
        config: ble::HUMIDITY_CONFIG,
        period: ble::HUMIDITY_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Barometer,
        service: ble::BAROMETER_SERVICE,
        data: ble::BAROMETER_DATA,
        config: ble::BAROMETER_CONFIG,
        period: ble::BAROMETER_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Optical,
        service: ble::OPTICAL_SERVICE,
        data: ble::OPTICAL_DATA,
        config: ble::OPTICAL_CONFIG,
        period: ble::OPTICAL_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Movement,
        service: ble::MOVEMENT_SERVICE,
        data: ble::MOVEMENT_DATA,
        config: ble::MOVEMENT_CONFIG,
        period: ble::MOVEMENT_PERIOD,
        // gyro xyz, accel xyz, magnetometer; accel range 2G
        enable: &[0x7F, 0x00],
        disable: &[0x00, 0x00],
    },
];

const NODE_SENSORS: &[SensorSpec] = &[
    SensorSpec {
        kind: SensorKind::Accelerometer,
        service: ble::NODE_SERVICE,
        data: ble::NODE_ACCEL_DATA,
        config: ble::NODE_ACCEL_CONFIG,
        period: ble::NODE_ACCEL_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Gyroscope,
        service: ble::NODE_SERVICE,
        data: ble::NODE_GYRO_DATA,
        config: ble::NODE_GYRO_CONFIG,
        period: ble::NODE_GYRO_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Environment,
        service: ble::NODE_SERVICE,
        data: ble::NODE_ENV_DATA,
        config: ble::NODE_ENV_CONFIG,
        period: ble::NODE_ENV_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
    SensorSpec {
        kind: SensorKind::Light,
        service: ble::NODE_SERVICE,
        data: ble::NODE_LIGHT_DATA,
        config: ble::NODE_LIGHT_CONFIG,
        period: ble::NODE_LIGHT_PERIOD,
        enable: &[0x01],
        disable: &[0x00],
    },
];

/// Three-axis vector reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    /// Create a new vector.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x={:.2} y={:.2} z={:.2}", self.x, self.y, self.z)
    }
}

/// Firmware version reported by a SensorNode over the debug channel.
///
/// The wire format is `name_mcuType_major.minor.patch`, terminated by `\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareVersion {
    /// Firmware image name.
    pub name: String,
    /// Microcontroller type the image targets.
    pub mcu: String,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    /// Parse a version line as returned by the `versionFw` command.
    ///
    /// ```
    /// use sensorgate_types::FirmwareVersion;
    ///
    /// let v = FirmwareVersion::parse("node_fw_nrf52_1.4.2\r\n").unwrap();
    /// assert_eq!(v.name, "node_fw");
    /// assert_eq!(v.mcu, "nrf52");
    /// assert_eq!((v.major, v.minor, v.patch), (1, 4, 2));
    /// ```
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n', '\0']).trim();
        let invalid = || ParseError::InvalidValue(format!("malformed firmware version '{line}'"));

        let mut parts = line.rsplitn(3, '_');
        let version = parts.next().ok_or_else(invalid)?;
        let mcu = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

        let numbers: Vec<u16> = version
            .split('.')
            .map(|n| n.parse::<u16>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let [major, minor, patch] = numbers[..] else {
            return Err(invalid());
        };

        Ok(Self {
            name: name.to_string(),
            mcu: mcu.to_string(),
            major,
            minor,
            patch,
        })
    }

    /// Whether `self` is a strictly newer release than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &FirmwareVersion) -> bool {
        (self.major, self.minor, self.patch) > (other.major, other.minor, other.patch)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}.{}.{}",
            self.name, self.mcu, self.major, self.minor, self.patch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_name() {
        assert_eq!(
            DeviceFamily::from_name("SensorTag 2.0"),
            Some(DeviceFamily::SensorTag)
        );
        assert_eq!(
            DeviceFamily::from_name("sensornode-kitchen"),
            Some(DeviceFamily::SensorNode)
        );
        assert_eq!(DeviceFamily::from_name("SNode 01"), Some(DeviceFamily::SensorNode));
        assert_eq!(DeviceFamily::from_name(""), None);
    }

    #[test]
    fn test_upgrade_support() {
        assert!(DeviceFamily::SensorNode.supports_upgrade());
        assert!(!DeviceFamily::SensorTag.supports_upgrade());
        assert!(DeviceFamily::SensorNode.model_supports_upgrade("SN-200"));
        assert!(!DeviceFamily::SensorNode.model_supports_upgrade("SN-010"));
        assert!(!DeviceFamily::SensorTag.model_supports_upgrade("SN-200"));
    }

    #[test]
    fn test_match_sensor_by_service_for_sensortag() {
        // Any characteristic inside the humidity service belongs to the humidity sensor
        let spec = DeviceFamily::SensorTag
            .match_sensor(ble::HUMIDITY_SERVICE, ble::HUMIDITY_CONFIG)
            .unwrap();
        assert_eq!(spec.kind, SensorKind::Humidity);
    }

    #[test]
    fn test_match_sensor_by_characteristic_for_node() {
        let spec = DeviceFamily::SensorNode
            .match_sensor(ble::NODE_SERVICE, ble::NODE_GYRO_DATA)
            .unwrap();
        assert_eq!(spec.kind, SensorKind::Gyroscope);
        assert!(
            DeviceFamily::SensorNode
                .match_sensor(ble::NODE_SERVICE, ble::NODE_GYRO_CONFIG)
                .is_none()
        );
    }

    #[test]
    fn test_dispatch_key() {
        let tag = DeviceFamily::SensorTag;
        assert_eq!(
            tag.dispatch_key(ble::HUMIDITY_SERVICE, ble::HUMIDITY_DATA),
            ble::HUMIDITY_SERVICE
        );
        let node = DeviceFamily::SensorNode;
        assert_eq!(
            node.dispatch_key(ble::NODE_SERVICE, ble::NODE_ENV_DATA),
            ble::NODE_ENV_DATA
        );
    }

    #[test]
    fn test_sensor_kind_round_trip_names() {
        for spec in DeviceFamily::SensorTag
            .sensors()
            .iter()
            .chain(DeviceFamily::SensorNode.sensors())
        {
            assert_eq!(spec.kind.as_str().parse::<SensorKind>().unwrap(), spec.kind);
        }
        assert!("thermostat".parse::<SensorKind>().is_err());
    }

    #[test]
    fn test_firmware_version_parse() {
        let v = FirmwareVersion::parse("sn_stm32l4_2.10.0\r\n").unwrap();
        assert_eq!(v.name, "sn");
        assert_eq!(v.mcu, "stm32l4");
        assert_eq!((v.major, v.minor, v.patch), (2, 10, 0));
        assert_eq!(v.to_string(), "sn_stm32l4_2.10.0");
    }

    #[test]
    fn test_firmware_version_rejects_garbage() {
        assert!(FirmwareVersion::parse("").is_err());
        assert!(FirmwareVersion::parse("sn_1.2.3").is_err());
        assert!(FirmwareVersion::parse("sn_mcu_1.2").is_err());
        assert!(FirmwareVersion::parse("sn_mcu_1.x.3").is_err());
    }

    #[test]
    fn test_firmware_version_ordering() {
        let old = FirmwareVersion::parse("sn_mcu_1.9.9").unwrap();
        let new = FirmwareVersion::parse("sn_mcu_1.10.0").unwrap();
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!old.is_newer_than(&old));
    }
}
