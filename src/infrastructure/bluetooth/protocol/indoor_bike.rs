//! FTMS Indoor Bike Data (0x2AD2)
//!
//! A 16-bit flags field followed by the fields it selects, in ascending bit
//! order. Bit 0 ("more data") has inverted sense: when clear, the
//! instantaneous speed is present.
//!
//! ```text
//! bit  field                         size  unit
//! 0    instantaneous speed (if 0)    u16   0.01 km/h
//! 1    average speed                 u16   0.01 km/h
//! 2    instantaneous cadence         u16   0.5 rpm
//! 3    average cadence               u16   0.5 rpm
//! 4    total distance                u24   m
//! 5    resistance level              i16   unitless
//! 6    instantaneous power           i16   W
//! 7    average power                 i16   W
//! 8    expended energy               u16+u16+u8  kcal, kcal/h, kcal/min
//! 9    heart rate                    u8    bpm
//! 10   metabolic equivalent          u8    0.1
//! 11   elapsed time                  u16   s
//! 12   remaining time                u16   s
//! ```

use super::cursor::FieldCursor;
use serde::Serialize;

const MORE_DATA: u16 = 1 << 0;
const AVERAGE_SPEED: u16 = 1 << 1;
const INSTANTANEOUS_CADENCE: u16 = 1 << 2;
const AVERAGE_CADENCE: u16 = 1 << 3;
const TOTAL_DISTANCE: u16 = 1 << 4;
const RESISTANCE_LEVEL: u16 = 1 << 5;
const INSTANTANEOUS_POWER: u16 = 1 << 6;
const AVERAGE_POWER: u16 = 1 << 7;
const EXPENDED_ENERGY: u16 = 1 << 8;
const HEART_RATE: u16 = 1 << 9;
const METABOLIC_EQUIVALENT: u16 = 1 << 10;
const ELAPSED_TIME: u16 = 1 << 11;
const REMAINING_TIME: u16 = 1 << 12;

const SPEED_SCALE: f64 = 0.01;
const CADENCE_SCALE: f64 = 0.5;
const MET_SCALE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpendedEnergy {
    pub total_kcal: u16,
    pub per_hour_kcal: u16,
    pub per_minute_kcal: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndoorBikeData {
    pub instantaneous_speed_kmh: Option<f64>,
    pub average_speed_kmh: Option<f64>,
    pub instantaneous_cadence_rpm: Option<f64>,
    pub average_cadence_rpm: Option<f64>,
    pub total_distance_m: Option<u32>,
    pub resistance_level: Option<i16>,
    pub instantaneous_power_w: Option<i16>,
    pub average_power_w: Option<i16>,
    pub expended_energy: Option<ExpendedEnergy>,
    pub heart_rate_bpm: Option<u8>,
    pub metabolic_equivalent: Option<f64>,
    pub elapsed_time_s: Option<u16>,
    pub remaining_time_s: Option<u16>,
}

impl IndoorBikeData {
    /// Decode a record; `None` when a flagged field is truncated or the
    /// flags select no field at all
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let mut cursor = FieldCursor::new(data);
        let flags = cursor.u16()?;
        let present = |bit: u16| flags & bit != 0;
        let mut record = Self::default();

        if !present(MORE_DATA) {
            record.instantaneous_speed_kmh = Some(f64::from(cursor.u16()?) * SPEED_SCALE);
        }
        if present(AVERAGE_SPEED) {
            record.average_speed_kmh = Some(f64::from(cursor.u16()?) * SPEED_SCALE);
        }
        if present(INSTANTANEOUS_CADENCE) {
            record.instantaneous_cadence_rpm = Some(f64::from(cursor.u16()?) * CADENCE_SCALE);
        }
        if present(AVERAGE_CADENCE) {
            record.average_cadence_rpm = Some(f64::from(cursor.u16()?) * CADENCE_SCALE);
        }
        if present(TOTAL_DISTANCE) {
            record.total_distance_m = Some(cursor.u24()?);
        }
        if present(RESISTANCE_LEVEL) {
            record.resistance_level = Some(cursor.i16()?);
        }
        if present(INSTANTANEOUS_POWER) {
            record.instantaneous_power_w = Some(cursor.i16()?);
        }
        if present(AVERAGE_POWER) {
            record.average_power_w = Some(cursor.i16()?);
        }
        if present(EXPENDED_ENERGY) {
            record.expended_energy = Some(ExpendedEnergy {
                total_kcal: cursor.u16()?,
                per_hour_kcal: cursor.u16()?,
                per_minute_kcal: cursor.u8()?,
            });
        }
        if present(HEART_RATE) {
            record.heart_rate_bpm = Some(cursor.u8()?);
        }
        if present(METABOLIC_EQUIVALENT) {
            record.metabolic_equivalent = Some(f64::from(cursor.u8()?) * MET_SCALE);
        }
        if present(ELAPSED_TIME) {
            record.elapsed_time_s = Some(cursor.u16()?);
        }
        if present(REMAINING_TIME) {
            record.remaining_time_s = Some(cursor.u16()?);
        }

        if record == Self::default() {
            return None;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payloads_rejected() {
        assert_eq!(IndoorBikeData::parse(&[]), None);
        assert_eq!(IndoorBikeData::parse(&[0x44]), None);
        // Speed implied by cleared bit 0 but absent
        assert_eq!(IndoorBikeData::parse(&[0x00, 0x00]), None);
        // Power flagged but truncated
        assert_eq!(IndoorBikeData::parse(&[0x41, 0x00, 0x64]), None);
    }

    #[test]
    fn test_speed_cadence_power() {
        let data = [0x44, 0x00, 0x90, 0x03, 0x98, 0x00, 0x64, 0x00];
        let bike = IndoorBikeData::parse(&data).unwrap();
        assert!((bike.instantaneous_speed_kmh.unwrap() - 9.12).abs() < 1e-9);
        assert!((bike.instantaneous_cadence_rpm.unwrap() - 76.0).abs() < 1e-9);
        assert_eq!(bike.instantaneous_power_w, Some(100));
        assert_eq!(bike.average_speed_kmh, None);
        assert_eq!(bike.heart_rate_bpm, None);
    }

    #[test]
    fn test_more_data_without_fields_rejected() {
        assert_eq!(IndoorBikeData::parse(&[0x01, 0x00]), None);
    }

    #[test]
    fn test_all_fields() {
        let mut data = vec![0xFF, 0x1F];
        data.extend_from_slice(&1500u16.to_le_bytes()); // avg speed 15.00
        data.extend_from_slice(&180u16.to_le_bytes()); // cadence 90
        data.extend_from_slice(&170u16.to_le_bytes()); // avg cadence 85
        data.extend_from_slice(&[0x10, 0x27, 0x01]); // 75536 m
        data.extend_from_slice(&(-5i16).to_le_bytes());
        data.extend_from_slice(&250i16.to_le_bytes());
        data.extend_from_slice(&200i16.to_le_bytes());
        data.extend_from_slice(&120u16.to_le_bytes());
        data.extend_from_slice(&600u16.to_le_bytes());
        data.push(10);
        data.push(142); // heart rate
        data.push(85); // MET 8.5
        data.extend_from_slice(&3600u16.to_le_bytes());
        data.extend_from_slice(&60u16.to_le_bytes());

        let bike = IndoorBikeData::parse(&data).unwrap();
        assert_eq!(bike.instantaneous_speed_kmh, None);
        assert!((bike.average_speed_kmh.unwrap() - 15.0).abs() < 1e-9);
        assert!((bike.instantaneous_cadence_rpm.unwrap() - 90.0).abs() < 1e-9);
        assert!((bike.average_cadence_rpm.unwrap() - 85.0).abs() < 1e-9);
        assert_eq!(bike.total_distance_m, Some(75_536));
        assert_eq!(bike.resistance_level, Some(-5));
        assert_eq!(bike.instantaneous_power_w, Some(250));
        assert_eq!(bike.average_power_w, Some(200));
        assert_eq!(
            bike.expended_energy,
            Some(ExpendedEnergy {
                total_kcal: 120,
                per_hour_kcal: 600,
                per_minute_kcal: 10,
            })
        );
        assert_eq!(bike.heart_rate_bpm, Some(142));
        assert!((bike.metabolic_equivalent.unwrap() - 8.5).abs() < 1e-9);
        assert_eq!(bike.elapsed_time_s, Some(3600));
        assert_eq!(bike.remaining_time_s, Some(60));

        // Dropping the last byte truncates the remaining time
        assert_eq!(IndoorBikeData::parse(&data[..data.len() - 1]), None);
    }
}
