//! Heart Rate Measurement (0x2A37)
//!
//! ```text
//! [0]     : Flags
//!           bit 0   : heart rate value is u16 (else u8)
//!           bit 1-2 : sensor contact status
//!           bit 3   : energy expended present
//!           bit 4   : RR intervals present
//! [1..]   : Heart rate (u8 or u16)
//!           Energy expended (u16, kJ)           if bit 3
//!           RR interval (u16, 1/1024 s) * n     if bit 4
//! ```

use super::cursor::FieldCursor;
use serde::Serialize;

const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_MASK: u8 = 0x06;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

const RR_INTERVAL_RESOLUTION: f64 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorContact {
    NotSupported,
    NotDetected,
    Detected,
}

impl SensorContact {
    fn from_flags(flags: u8) -> Self {
        match (flags & FLAG_CONTACT_MASK) >> 1 {
            0b10 => Self::NotDetected,
            0b11 => Self::Detected,
            _ => Self::NotSupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartRateMeasurement {
    /// Beats per minute
    pub heart_rate: u16,
    pub sensor_contact: SensorContact,
    /// Kilojoules since the last reset
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in seconds, oldest first
    pub rr_intervals: Vec<f64>,
}

impl HeartRateMeasurement {
    /// Decode a measurement; `None` when the payload is shorter than its
    /// flags claim
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let mut cursor = FieldCursor::new(data);
        let flags = cursor.u8()?;

        let heart_rate = if flags & FLAG_HR_U16 != 0 {
            cursor.u16()?
        } else {
            u16::from(cursor.u8()?)
        };

        let energy_expended_kj = if flags & FLAG_ENERGY_EXPENDED != 0 {
            Some(cursor.u16()?)
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_INTERVALS != 0 {
            while cursor.remaining() >= 2 {
                let raw = cursor.u16()?;
                rr_intervals.push(f64::from(raw) / RR_INTERVAL_RESOLUTION);
            }
        }

        Some(Self {
            heart_rate,
            sensor_contact: SensorContact::from_flags(flags),
            energy_expended_kj,
            rr_intervals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payloads_rejected() {
        assert_eq!(HeartRateMeasurement::parse(&[]), None);
        assert_eq!(HeartRateMeasurement::parse(&[0x00]), None);
        // 16-bit value claimed but only one byte follows
        assert_eq!(HeartRateMeasurement::parse(&[0x01, 0x48]), None);
        // Energy expended claimed but missing
        assert_eq!(HeartRateMeasurement::parse(&[0x08, 0x48, 0x01]), None);
    }

    #[test]
    fn test_u8_heart_rate() {
        let hr = HeartRateMeasurement::parse(&[0x00, 0x48]).unwrap();
        assert_eq!(hr.heart_rate, 72);
        assert_eq!(hr.energy_expended_kj, None);
        assert!(hr.rr_intervals.is_empty());
        assert_eq!(hr.sensor_contact, SensorContact::NotSupported);
    }

    #[test]
    fn test_u16_heart_rate() {
        let hr = HeartRateMeasurement::parse(&[0x01, 0x00, 0x01]).unwrap();
        assert_eq!(hr.heart_rate, 256);
    }

    #[test]
    fn test_rr_interval() {
        let hr = HeartRateMeasurement::parse(&[0x10, 0x3C, 0x00, 0x04]).unwrap();
        assert_eq!(hr.heart_rate, 60);
        assert_eq!(hr.rr_intervals.len(), 1);
        assert!((hr.rr_intervals[0] - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_contact_energy_and_multiple_rr() {
        let data = [0x1E, 0x50, 0x10, 0x00, 0x00, 0x02, 0x00, 0x04, 0x01];
        let hr = HeartRateMeasurement::parse(&data).unwrap();
        assert_eq!(hr.heart_rate, 80);
        assert_eq!(hr.sensor_contact, SensorContact::Detected);
        assert_eq!(hr.energy_expended_kj, Some(16));
        // Trailing odd byte is not an interval
        assert_eq!(hr.rr_intervals, vec![0.5, 1.0]);

        let hr = HeartRateMeasurement::parse(&[0x04, 0x50]).unwrap();
        assert_eq!(hr.sensor_contact, SensorContact::NotDetected);
        let hr = HeartRateMeasurement::parse(&[0x02, 0x50]).unwrap();
        assert_eq!(hr.sensor_contact, SensorContact::NotSupported);
    }
}
