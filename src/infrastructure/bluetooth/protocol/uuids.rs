//! Assigned numbers for the services and characteristics this bridge knows
//! by name, plus helpers for the 16-bit short form.

use crate::error::BleError;
use uuid::Uuid;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;
const SHORT_MASK: u128 = 0xFFFF_FFFF_u128 << 96;

/// Expand a 16-bit assigned number onto the Bluetooth SIG base UUID
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE_UUID)
}

pub const FITNESS_MACHINE_SERVICE: Uuid = ble_uuid(0x1826);
pub const FITNESS_MACHINE_FEATURE: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA: Uuid = ble_uuid(0x2AD2);
pub const TRAINING_STATUS: Uuid = ble_uuid(0x2AD3);
pub const SUPPORTED_RESISTANCE_LEVEL_RANGE: Uuid = ble_uuid(0x2AD6);
pub const SUPPORTED_POWER_RANGE: Uuid = ble_uuid(0x2AD8);
pub const FITNESS_MACHINE_CONTROL_POINT: Uuid = ble_uuid(0x2AD9);
pub const FITNESS_MACHINE_STATUS: Uuid = ble_uuid(0x2ADA);

pub const HEART_RATE_SERVICE: Uuid = ble_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = ble_uuid(0x2A37);
pub const BODY_SENSOR_LOCATION: Uuid = ble_uuid(0x2A38);
pub const HEART_RATE_CONTROL_POINT: Uuid = ble_uuid(0x2A39);

pub const DEVICE_INFORMATION_SERVICE: Uuid = ble_uuid(0x180A);
pub const MANUFACTURER_NAME: Uuid = ble_uuid(0x2A29);
pub const MODEL_NUMBER: Uuid = ble_uuid(0x2A24);
pub const FIRMWARE_REVISION: Uuid = ble_uuid(0x2A26);

pub const BATTERY_SERVICE: Uuid = ble_uuid(0x180F);
pub const BATTERY_LEVEL: Uuid = ble_uuid(0x2A19);

const KNOWN_NAMES: &[(Uuid, &str)] = &[
    (FITNESS_MACHINE_SERVICE, "Fitness Machine"),
    (FITNESS_MACHINE_FEATURE, "Fitness Machine Feature"),
    (INDOOR_BIKE_DATA, "Indoor Bike Data"),
    (TRAINING_STATUS, "Training Status"),
    (SUPPORTED_RESISTANCE_LEVEL_RANGE, "Supported Resistance Level Range"),
    (SUPPORTED_POWER_RANGE, "Supported Power Range"),
    (FITNESS_MACHINE_CONTROL_POINT, "Fitness Machine Control Point"),
    (FITNESS_MACHINE_STATUS, "Fitness Machine Status"),
    (HEART_RATE_SERVICE, "Heart Rate"),
    (HEART_RATE_MEASUREMENT, "Heart Rate Measurement"),
    (BODY_SENSOR_LOCATION, "Body Sensor Location"),
    (HEART_RATE_CONTROL_POINT, "Heart Rate Control Point"),
    (DEVICE_INFORMATION_SERVICE, "Device Information"),
    (MANUFACTURER_NAME, "Manufacturer Name String"),
    (MODEL_NUMBER, "Model Number String"),
    (FIRMWARE_REVISION, "Firmware Revision String"),
    (BATTERY_SERVICE, "Battery"),
    (BATTERY_LEVEL, "Battery Level"),
];

/// The 16-bit assigned number, if `uuid` sits on the SIG base UUID
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_MASK == BASE_UUID && (value >> 112) == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Render an identifier the way operators type it: `2AD2` for assigned
/// numbers, the full hyphenated form otherwise
pub fn display_uuid(uuid: &Uuid) -> String {
    match short_form(uuid) {
        Some(short) => format!("{:04X}", short),
        None => uuid.to_string(),
    }
}

pub fn known_name(uuid: &Uuid) -> Option<&'static str> {
    KNOWN_NAMES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// Parse `2AD2`, `0x2AD2` or a full 128-bit identifier
pub fn parse_uuid(input: &str) -> Result<Uuid, BleError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex.len() == 4 {
        return u16::from_str_radix(hex, 16)
            .map(ble_uuid)
            .map_err(|_| BleError::InvalidUuid(input.to_string()));
    }

    Uuid::parse_str(trimmed).map_err(|_| BleError::InvalidUuid(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            INDOOR_BIKE_DATA.to_string(),
            "00002ad2-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(short_form(&HEART_RATE_MEASUREMENT), Some(0x2A37));
    }

    #[test]
    fn test_parse_uuid_forms() {
        assert_eq!(parse_uuid("2AD2").unwrap(), INDOOR_BIKE_DATA);
        assert_eq!(parse_uuid("0x2a37").unwrap(), HEART_RATE_MEASUREMENT);
        assert_eq!(
            parse_uuid("00002ad9-0000-1000-8000-00805f9b34fb").unwrap(),
            FITNESS_MACHINE_CONTROL_POINT
        );
        assert!(matches!(parse_uuid("xyz"), Err(BleError::InvalidUuid(_))));
        assert!(matches!(parse_uuid("2AD"), Err(BleError::InvalidUuid(_))));
    }

    #[test]
    fn test_display_uuid() {
        assert_eq!(display_uuid(&FITNESS_MACHINE_CONTROL_POINT), "2AD9");
        let custom = Uuid::from_u128(0xc8c51726_81bc_483b_a052_f7a14ea3d281);
        assert_eq!(display_uuid(&custom), "c8c51726-81bc-483b-a052-f7a14ea3d281");
        assert_eq!(known_name(&INDOOR_BIKE_DATA), Some("Indoor Bike Data"));
        assert_eq!(known_name(&custom), None);
    }
}
