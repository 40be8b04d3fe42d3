//! Sensor payload decoding.
//!
//! Every sensor publishes a fixed-layout notification payload. The decoders in
//! this module are pure: they check the payload length first and then read
//! fields at known offsets, so a short buffer is reported as
//! [`ParseError::InsufficientBytes`] and never panics.
//!
//! SensorTag payloads are little-endian, SensorNode payloads big-endian.

use core::fmt;

use bytes::Buf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::types::{SensorKind, Vector3};

/// Gyroscope scale for the SensorTag movement sensor (±250 °/s over 16 bits).
const TAG_GYRO_SCALE: f32 = 65536.0 / 500.0;
/// Accelerometer scale for the SensorTag movement sensor at the 2G range.
const TAG_ACCEL_SCALE: f32 = 32768.0 / 2.0;
/// Magnetometer scale (µT per LSB).
const TAG_MAG_SCALE: f32 = 4912.0 / 32760.0;

/// A decoded sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Reading {
    /// Object and die temperature in °C.
    IrTemperature { object: f32, ambient: f32 },
    /// Temperature in °C and relative humidity in %.
    Humidity { temperature: f32, humidity: f32 },
    /// Temperature in °C and pressure in hPa.
    Barometer { temperature: f32, pressure: f32 },
    /// Illuminance in lux.
    Light { lux: f32 },
    /// 9-axis motion: °/s, g, µT.
    Motion {
        gyroscope: Vector3,
        accelerometer: Vector3,
        magnetometer: Vector3,
    },
    /// Acceleration in g.
    Acceleration(Vector3),
    /// Angular rate in °/s.
    Rotation(Vector3),
    /// Temperature in °C, relative humidity in %, pressure in hPa.
    Environment {
        temperature: f32,
        humidity: f32,
        pressure: f32,
    },
}

/// Number of payload bytes each sensor publishes.
#[must_use]
pub fn payload_len(kind: SensorKind) -> usize {
    match kind {
        SensorKind::IrTemperature => 4,
        SensorKind::Humidity => 4,
        SensorKind::Barometer => 6,
        SensorKind::Optical => 2,
        SensorKind::Movement => 18,
        SensorKind::Accelerometer => 6,
        SensorKind::Gyroscope => 6,
        SensorKind::Environment => 6,
        SensorKind::Light => 2,
    }
}

/// Decode a notification payload for the given sensor.
pub fn decode(kind: SensorKind, data: &[u8]) -> ParseResult<Reading> {
    let expected = payload_len(kind);
    if data.len() < expected {
        return Err(ParseError::InsufficientBytes {
            sensor: kind.as_str(),
            expected,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let reading = match kind {
        SensorKind::IrTemperature => {
            let object = buf.get_i16_le();
            let ambient = buf.get_i16_le();
            Reading::IrTemperature {
                object: f32::from(object) / 128.0,
                ambient: f32::from(ambient) / 128.0,
            }
        }
        SensorKind::Humidity => {
            let temp_raw = buf.get_u16_le();
            let hum_raw = buf.get_u16_le() & !0x0003;
            Reading::Humidity {
                temperature: f32::from(temp_raw) / 65536.0 * 165.0 - 40.0,
                humidity: f32::from(hum_raw) / 65536.0 * 100.0,
            }
        }
        SensorKind::Barometer => {
            let temp_raw = buf.get_uint_le(3);
            let press_raw = buf.get_uint_le(3);
            Reading::Barometer {
                temperature: temp_raw as f32 / 100.0,
                pressure: press_raw as f32 / 100.0,
            }
        }
        SensorKind::Optical => {
            let raw = buf.get_u16_le();
            let mantissa = raw & 0x0FFF;
            let exponent = (raw & 0xF000) >> 12;
            Reading::Light {
                lux: f32::from(mantissa) * 0.01 * f32::from(1u16 << exponent),
            }
        }
        SensorKind::Movement => {
            let mut axis = |scale: f32| {
                let x = f32::from(buf.get_i16_le()) / scale;
                let y = f32::from(buf.get_i16_le()) / scale;
                let z = f32::from(buf.get_i16_le()) / scale;
                Vector3::new(x, y, z)
            };
            let gyroscope = axis(TAG_GYRO_SCALE);
            let accelerometer = axis(TAG_ACCEL_SCALE);
            let magnetometer = axis(1.0 / TAG_MAG_SCALE);
            Reading::Motion {
                gyroscope,
                accelerometer,
                magnetometer,
            }
        }
        SensorKind::Accelerometer => {
            let x = f32::from(buf.get_i16()) / 1000.0;
            let y = f32::from(buf.get_i16()) / 1000.0;
            let z = f32::from(buf.get_i16()) / 1000.0;
            Reading::Acceleration(Vector3::new(x, y, z))
        }
        SensorKind::Gyroscope => {
            let x = f32::from(buf.get_i16()) / 100.0;
            let y = f32::from(buf.get_i16()) / 100.0;
            let z = f32::from(buf.get_i16()) / 100.0;
            Reading::Rotation(Vector3::new(x, y, z))
        }
        SensorKind::Environment => {
            let temperature = f32::from(buf.get_i16()) / 100.0;
            let humidity = f32::from(buf.get_u16()) / 100.0;
            let pressure = f32::from(buf.get_u16()) / 10.0;
            Reading::Environment {
                temperature,
                humidity,
                pressure,
            }
        }
        SensorKind::Light => Reading::Light {
            lux: f32::from(buf.get_u16()),
        },
    };

    Ok(reading)
}

impl Reading {
    /// Flatten the reading into key/value pairs for cloud telemetry upload.
    #[must_use]
    pub fn telemetry(&self) -> Vec<(String, f64)> {
        fn vector(prefix: &str, v: &Vector3, out: &mut Vec<(String, f64)>) {
            out.push((format!("{prefix}_x"), f64::from(v.x)));
            out.push((format!("{prefix}_y"), f64::from(v.y)));
            out.push((format!("{prefix}_z"), f64::from(v.z)));
        }

        let mut out = Vec::new();
        match self {
            Reading::IrTemperature { object, ambient } => {
                out.push(("object_temp".to_string(), f64::from(*object)));
                out.push(("ambient_temp".to_string(), f64::from(*ambient)));
            }
            Reading::Humidity {
                temperature,
                humidity,
            } => {
                out.push(("temperature".to_string(), f64::from(*temperature)));
                out.push(("humidity".to_string(), f64::from(*humidity)));
            }
            Reading::Barometer {
                temperature,
                pressure,
            } => {
                out.push(("temperature".to_string(), f64::from(*temperature)));
                out.push(("pressure".to_string(), f64::from(*pressure)));
            }
            Reading::Light { lux } => out.push(("light".to_string(), f64::from(*lux))),
            Reading::Motion {
                gyroscope,
                accelerometer,
                magnetometer,
            } => {
                vector("gyro", gyroscope, &mut out);
                vector("accel", accelerometer, &mut out);
                vector("mag", magnetometer, &mut out);
            }
            Reading::Acceleration(v) => vector("accel", v, &mut out),
            Reading::Rotation(v) => vector("gyro", v, &mut out),
            Reading::Environment {
                temperature,
                humidity,
                pressure,
            } => {
                out.push(("temperature".to_string(), f64::from(*temperature)));
                out.push(("humidity".to_string(), f64::from(*humidity)));
                out.push(("pressure".to_string(), f64::from(*pressure)));
            }
        }
        out
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::IrTemperature { object, ambient } => {
                write!(f, "Object {object:.1}°C, ambient {ambient:.1}°C")
            }
            Reading::Humidity {
                temperature,
                humidity,
            } => write!(f, "{humidity:.1}% RH at {temperature:.1}°C"),
            Reading::Barometer {
                temperature,
                pressure,
            } => write!(f, "{pressure:.1} hPa at {temperature:.1}°C"),
            Reading::Light { lux } => write!(f, "{lux:.0} lux"),
            Reading::Motion {
                gyroscope,
                accelerometer,
                magnetometer,
            } => write!(
                f,
                "gyro [{gyroscope}] °/s, accel [{accelerometer}] g, mag [{magnetometer}] µT"
            ),
            Reading::Acceleration(v) => write!(f, "accel [{v}] g"),
            Reading::Rotation(v) => write!(f, "gyro [{v}] °/s"),
            Reading::Environment {
                temperature,
                humidity,
                pressure,
            } => write!(
                f,
                "{temperature:.1}°C, {humidity:.1}% RH, {pressure:.1} hPa"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn test_decode_ir_temperature() {
        // object = 25.0 °C (3200), ambient = 21.5 °C (2752)
        let data = [0x80, 0x0C, 0xC0, 0x0A];
        let Reading::IrTemperature { object, ambient } =
            decode(SensorKind::IrTemperature, &data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert!(approx(object, 25.0));
        assert!(approx(ambient, 21.5));
    }

    #[test]
    fn test_decode_humidity() {
        // temp raw 0x6666 -> ~25.99 °C, hum raw 0x8000 -> 50 %
        let data = [0x66, 0x66, 0x00, 0x80];
        let Reading::Humidity {
            temperature,
            humidity,
        } = decode(SensorKind::Humidity, &data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert!((temperature - 25.99).abs() < 0.05);
        assert!(approx(humidity, 50.0));
    }

    #[test]
    fn test_decode_barometer() {
        // 23.45 °C = 2345 = 0x000929; 1013.25 hPa = 101325 = 0x018BCD
        let data = [0x29, 0x09, 0x00, 0xCD, 0x8B, 0x01];
        let Reading::Barometer {
            temperature,
            pressure,
        } = decode(SensorKind::Barometer, &data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert!(approx(temperature, 23.45));
        assert!(approx(pressure, 1013.25));
    }

    #[test]
    fn test_decode_optical() {
        // exponent 3, mantissa 1000 -> 1000 * 0.01 * 8 = 80 lux
        let raw: u16 = (3 << 12) | 1000;
        let Reading::Light { lux } = decode(SensorKind::Optical, &raw.to_le_bytes()).unwrap()
        else {
            panic!("wrong variant");
        };
        assert!(approx(lux, 80.0));
    }

    #[test]
    fn test_decode_movement_accel_axis() {
        let mut data = [0u8; 18];
        // accel x = 1 g at the 2G range
        data[6..8].copy_from_slice(&16384i16.to_le_bytes());
        let Reading::Motion { accelerometer, .. } =
            decode(SensorKind::Movement, &data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert!(approx(accelerometer.x, 1.0));
        assert!(approx(accelerometer.y, 0.0));
    }

    #[test]
    fn test_decode_node_is_big_endian() {
        // x = 1000 mg, y = -500 mg, z = 0
        let data = [0x03, 0xE8, 0xFE, 0x0C, 0x00, 0x00];
        let Reading::Acceleration(v) = decode(SensorKind::Accelerometer, &data).unwrap() else {
            panic!("wrong variant");
        };
        assert!(approx(v.x, 1.0));
        assert!(approx(v.y, -0.5));
        assert!(approx(v.z, 0.0));
    }

    #[test]
    fn test_decode_node_environment() {
        // 21.50 °C, 40.00 %, 1013.2 hPa
        let mut data = Vec::new();
        data.extend_from_slice(&2150i16.to_be_bytes());
        data.extend_from_slice(&4000u16.to_be_bytes());
        data.extend_from_slice(&10132u16.to_be_bytes());
        let reading = decode(SensorKind::Environment, &data).unwrap();
        assert_eq!(
            reading,
            Reading::Environment {
                temperature: 21.5,
                humidity: 40.0,
                pressure: 1013.2,
            }
        );
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let err = decode(SensorKind::Movement, &[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientBytes {
                sensor: "movement",
                expected: 18,
                actual: 10,
            }
        );
    }

    #[test]
    fn test_telemetry_keys() {
        let reading = Reading::Rotation(Vector3::new(1.0, 2.0, 3.0));
        let keys: Vec<_> = reading.telemetry().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["gyro_x", "gyro_y", "gyro_z"]);

        let reading = Reading::Light { lux: 120.0 };
        assert_eq!(reading.telemetry(), vec![("light".to_string(), 120.0)]);
    }

    #[test]
    fn test_display_strings() {
        let reading = Reading::Humidity {
            temperature: 22.04,
            humidity: 48.26,
        };
        assert_eq!(reading.to_string(), "48.3% RH at 22.0°C");

        let reading = Reading::Light { lux: 80.4 };
        assert_eq!(reading.to_string(), "80 lux");
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            for kind in [
                SensorKind::IrTemperature,
                SensorKind::Humidity,
                SensorKind::Barometer,
                SensorKind::Optical,
                SensorKind::Movement,
                SensorKind::Accelerometer,
                SensorKind::Gyroscope,
                SensorKind::Environment,
                SensorKind::Light,
            ] {
                let result = decode(kind, &bytes);
                prop_assert_eq!(result.is_ok(), bytes.len() >= payload_len(kind));
            }
        }
    }
}
