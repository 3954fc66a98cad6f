//! FTMS / HRS wire formats
//!
//! Pure functions over byte slices. Decoders return `None` on malformed or
//! short payloads so callers can always fall back to the raw bytes.

pub mod control_point;
pub mod cursor;
pub mod features;
pub mod heart_rate;
pub mod indoor_bike;
pub mod uuids;

pub use control_point::{ControlPointCommand, SimulationParameters, StopKind};
pub use features::FtmsFeatures;
pub use heart_rate::{HeartRateMeasurement, SensorContact};
pub use indoor_bike::{ExpendedEnergy, IndoorBikeData};

use crate::error::BleError;
use serde::Serialize;
use uuid::Uuid;

/// A characteristic value decoded according to its identifier
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedValue {
    HeartRate(HeartRateMeasurement),
    IndoorBike(IndoorBikeData),
    FtmsFeatures(FtmsFeatures),
}

/// Decode `data` if `characteristic` has a known format
pub fn decode(characteristic: &Uuid, data: &[u8]) -> Option<DecodedValue> {
    if *characteristic == uuids::HEART_RATE_MEASUREMENT {
        HeartRateMeasurement::parse(data).map(DecodedValue::HeartRate)
    } else if *characteristic == uuids::INDOOR_BIKE_DATA {
        IndoorBikeData::parse(data).map(DecodedValue::IndoorBike)
    } else if *characteristic == uuids::FITNESS_MACHINE_FEATURE {
        FtmsFeatures::parse(data).map(DecodedValue::FtmsFeatures)
    } else {
        None
    }
}

/// Space separated uppercase byte pairs, e.g. `44 00 90 03`
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex with optional whitespace, `:` or `-` separators and `0x` prefix
pub fn parse_hex(input: &str) -> Result<Vec<u8>, BleError> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(BleError::InvalidPayload(format!(
            "odd number of hex digits in '{}'",
            input
        )));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| BleError::InvalidPayload(format!("invalid hex '{}'", input)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dispatch() {
        let hr = decode(&uuids::HEART_RATE_MEASUREMENT, &[0x00, 0x48]);
        assert!(matches!(hr, Some(DecodedValue::HeartRate(m)) if m.heart_rate == 72));

        let bike = decode(
            &uuids::INDOOR_BIKE_DATA,
            &[0x44, 0x00, 0x90, 0x03, 0x98, 0x00, 0x64, 0x00],
        );
        assert!(matches!(bike, Some(DecodedValue::IndoorBike(b)) if b.instantaneous_power_w == Some(100)));

        assert_eq!(decode(&uuids::BATTERY_LEVEL, &[0x64]), None);
        assert_eq!(decode(&uuids::HEART_RATE_MEASUREMENT, &[0x00]), None);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(format_hex(&[0x0A, 0xFF, 0x00]), "0A FF 00");
        assert_eq!(format_hex(&[]), "");
        assert_eq!(parse_hex("05 96 00").unwrap(), vec![0x05, 0x96, 0x00]);
        assert_eq!(parse_hex("0x0596").unwrap(), vec![0x05, 0x96]);
        assert_eq!(parse_hex("aa:bb").unwrap(), vec![0xAA, 0xBB]);
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_decoded_value_serializes_with_tag() {
        let value = decode(&uuids::HEART_RATE_MEASUREMENT, &[0x00, 0x48]).unwrap();
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "heart_rate");
        assert_eq!(json["heart_rate"], 72);
    }
}
