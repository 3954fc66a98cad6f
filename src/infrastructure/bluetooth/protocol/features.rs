//! Fitness Machine Feature (0x2ACC): two little-endian u32 bitmasks, the
//! supported data fields followed by the supported target settings.

use super::cursor::FieldCursor;
use serde::Serialize;

const MACHINE_FEATURES: &[&str] = &[
    "Average Speed",
    "Cadence",
    "Total Distance",
    "Inclination",
    "Elevation Gain",
    "Pace",
    "Step Count",
    "Resistance Level",
    "Stride Count",
    "Expended Energy",
    "Heart Rate Measurement",
    "Metabolic Equivalent",
    "Elapsed Time",
    "Remaining Time",
    "Power Measurement",
    "Force on Belt and Power Output",
    "User Data Retention",
];

const TARGET_SETTING_FEATURES: &[&str] = &[
    "Speed Target",
    "Inclination Target",
    "Resistance Target",
    "Power Target",
    "Heart Rate Target",
    "Targeted Expended Energy",
    "Targeted Step Number",
    "Targeted Stride Number",
    "Targeted Distance",
    "Targeted Training Time",
    "Targeted Time in Two Heart Rate Zones",
    "Targeted Time in Three Heart Rate Zones",
    "Targeted Time in Five Heart Rate Zones",
    "Indoor Bike Simulation Parameters",
    "Wheel Circumference",
    "Spin Down Control",
    "Targeted Cadence",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FtmsFeatures {
    pub machine_flags: u32,
    pub target_setting_flags: u32,
    pub machine_features: Vec<&'static str>,
    pub target_settings: Vec<&'static str>,
}

impl FtmsFeatures {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = FieldCursor::new(data);
        let machine_flags = cursor.u32()?;
        let target_setting_flags = cursor.u32()?;

        Some(Self {
            machine_flags,
            target_setting_flags,
            machine_features: names_for(machine_flags, MACHINE_FEATURES),
            target_settings: names_for(target_setting_flags, TARGET_SETTING_FEATURES),
        })
    }

    pub fn supports_target(&self, name: &str) -> bool {
        self.target_settings.iter().any(|n| *n == name)
    }
}

fn names_for(flags: u32, table: &[&'static str]) -> Vec<&'static str> {
    table
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}
