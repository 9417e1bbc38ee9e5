//! LPP telemetry payload parsing.
//!
//! Remote nodes report sensor data as a low-power-packet byte sequence:
//! repeated `[channel:1][sensor_type:1][value:N]` records with per-type
//! fixed value sizes. Parsing is a lazy prefix parse: it stops at the
//! first unknown sensor byte or truncated tail and returns whatever was
//! decoded up to that point.

/// A single decoded sensor value.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    /// Digital input (0 or 1).
    DigitalInput(u8),
    /// Digital output (0 or 1).
    DigitalOutput(u8),
    /// Analog input (0.01 resolution).
    AnalogInput(f32),
    /// Analog output (0.01 resolution).
    AnalogOutput(f32),
    /// Illuminance in lux.
    Illuminance(u16),
    /// Presence (0 or 1).
    Presence(u8),
    /// Temperature in Celsius (0.1 resolution).
    Temperature(f32),
    /// Relative humidity in % (0.5 resolution).
    Humidity(f32),
    /// Accelerometer values in G (0.001 resolution).
    Accelerometer { x: f32, y: f32, z: f32 },
    /// Barometric pressure in hPa (0.1 resolution).
    Barometer(f32),
    /// Battery voltage in V (0.01 resolution).
    Voltage(f32),
    /// Current in A (0.001 resolution).
    Current(f32),
    /// Percentage (0-100).
    Percentage(u8),
    /// Altitude in m (0.01 resolution).
    Altitude(f32),
    /// GPS location: degrees, degrees, meters.
    Gps {
        latitude: f64,
        longitude: f64,
        altitude: f32,
    },
    /// Gyrometer values in degrees/s (0.01 resolution).
    Gyrometer { x: f32, y: f32, z: f32 },
    /// Unix timestamp.
    UnixTime(u32),
}

/// A telemetry reading with channel and sensor type info.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReading {
    /// Sensor channel number.
    pub channel: u8,
    /// Sensor type code.
    pub sensor_type: u8,
    /// Decoded value.
    pub value: TelemetryValue,
}

/// Sign-extends a 3-byte little-endian value to i32.
fn i24_le(bytes: &[u8]) -> i32 {
    let raw = i32::from(bytes[0]) | (i32::from(bytes[1]) << 8) | (i32::from(bytes[2]) << 16);
    (raw << 8) >> 8
}

fn i16_le(bytes: &[u8]) -> i16 {
    i16::from_le_bytes([bytes[0], bytes[1]])
}

fn u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Decodes one value of the given sensor type from `data`.
///
/// Returns the value and the number of bytes consumed, or `None` for an
/// unknown type or a truncated tail.
fn decode_value(sensor_type: u8, data: &[u8]) -> Option<(TelemetryValue, usize)> {
    let fixed = |n: usize| -> Option<&[u8]> {
        if data.len() >= n { Some(&data[..n]) } else { None }
    };

    match sensor_type {
        0x00 => fixed(1).map(|d| (TelemetryValue::DigitalInput(d[0]), 1)),
        0x01 => fixed(1).map(|d| (TelemetryValue::DigitalOutput(d[0]), 1)),
        0x02 => fixed(2).map(|d| (TelemetryValue::AnalogInput(f32::from(i16_le(d)) / 100.0), 2)),
        0x03 => fixed(2).map(|d| (TelemetryValue::AnalogOutput(f32::from(i16_le(d)) / 100.0), 2)),
        0x65 => fixed(2).map(|d| (TelemetryValue::Illuminance(u16_le(d)), 2)),
        0x66 => fixed(1).map(|d| (TelemetryValue::Presence(d[0]), 1)),
        0x67 => fixed(2).map(|d| (TelemetryValue::Temperature(f32::from(i16_le(d)) / 10.0), 2)),
        0x68 => fixed(1).map(|d| (TelemetryValue::Humidity(f32::from(d[0]) / 2.0), 1)),
        0x71 => fixed(6).map(|d| {
            (
                TelemetryValue::Accelerometer {
                    x: f32::from(i16_le(&d[0..2])) / 1000.0,
                    y: f32::from(i16_le(&d[2..4])) / 1000.0,
                    z: f32::from(i16_le(&d[4..6])) / 1000.0,
                },
                6,
            )
        }),
        0x73 => fixed(2).map(|d| (TelemetryValue::Barometer(f32::from(u16_le(d)) / 10.0), 2)),
        0x74 => fixed(2).map(|d| (TelemetryValue::Voltage(f32::from(u16_le(d)) / 100.0), 2)),
        0x75 => fixed(2).map(|d| (TelemetryValue::Current(f32::from(u16_le(d)) / 1000.0), 2)),
        0x78 => fixed(1).map(|d| (TelemetryValue::Percentage(d[0]), 1)),
        0x79 => fixed(2).map(|d| (TelemetryValue::Altitude(f32::from(i16_le(d)) / 100.0), 2)),
        // GPS: three 24-bit signed LE triplets; lat/lon in 1e-4 deg,
        // altitude in centimeters.
        0x88 => fixed(9).map(|d| {
            #[allow(clippy::cast_precision_loss)]
            let altitude = i24_le(&d[6..9]) as f32 / 100.0;
            (
                TelemetryValue::Gps {
                    latitude: f64::from(i24_le(&d[0..3])) / 10_000.0,
                    longitude: f64::from(i24_le(&d[3..6])) / 10_000.0,
                    altitude,
                },
                9,
            )
        }),
        0x86 => fixed(6).map(|d| {
            (
                TelemetryValue::Gyrometer {
                    x: f32::from(i16_le(&d[0..2])) / 100.0,
                    y: f32::from(i16_le(&d[2..4])) / 100.0,
                    z: f32::from(i16_le(&d[4..6])) / 100.0,
                },
                6,
            )
        }),
        0x85 => fixed(4).map(|d| {
            (
                TelemetryValue::UnixTime(u32::from_le_bytes([d[0], d[1], d[2], d[3]])),
                4,
            )
        }),
        _ => None,
    }
}

/// Parses an LPP payload into the readings decoded before the first
/// unknown sensor byte or truncated record.
#[must_use]
pub fn parse_lpp(data: &[u8]) -> Vec<TelemetryReading> {
    let mut readings = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let channel = data[pos];
        let sensor_type = data[pos + 1];
        let Some((value, consumed)) = decode_value(sensor_type, &data[pos + 2..]) else {
            break;
        };
        readings.push(TelemetryReading {
            channel,
            sensor_type,
            value,
        });
        pos += 2 + consumed;
    }

    readings
}
