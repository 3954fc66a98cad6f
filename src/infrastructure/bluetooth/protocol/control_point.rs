//! Fitness Machine Control Point (0x2AD9) command layout: one opcode byte
//! followed by little-endian parameters.

use super::cursor::FieldCursor;

pub const OP_REQUEST_CONTROL: u8 = 0x00;
pub const OP_RESET: u8 = 0x01;
pub const OP_SET_TARGET_POWER: u8 = 0x05;
pub const OP_START_OR_RESUME: u8 = 0x07;
pub const OP_STOP_OR_PAUSE: u8 = 0x08;
pub const OP_SET_INDOOR_BIKE_SIMULATION: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Stop,
    Pause,
}

impl StopKind {
    fn as_byte(self) -> u8 {
        match self {
            Self::Stop => 0x01,
            Self::Pause => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Stop),
            0x02 => Some(Self::Pause),
            _ => None,
        }
    }
}

/// Indoor bike simulation parameters in wire units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationParameters {
    /// 0.001 m/s
    pub wind_speed: i16,
    /// 0.01 %
    pub grade: i16,
    /// Coefficient of rolling resistance, 0.0001
    pub rolling_resistance: u8,
    /// Wind resistance coefficient, 0.01 kg/m
    pub wind_resistance: u8,
}

impl SimulationParameters {
    /// Convert from physical units, saturating at the wire ranges
    pub fn from_physical(
        wind_speed_mps: f64,
        grade_percent: f64,
        rolling_resistance: f64,
        wind_resistance_kg_per_m: f64,
    ) -> Self {
        Self {
            wind_speed: (wind_speed_mps * 1000.0).round() as i16,
            grade: (grade_percent * 100.0).round() as i16,
            rolling_resistance: (rolling_resistance * 10_000.0).round() as u8,
            wind_resistance: (wind_resistance_kg_per_m * 100.0).round() as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointCommand {
    RequestControl,
    Reset,
    /// Watts
    SetTargetPower(i16),
    StartOrResume,
    StopOrPause(StopKind),
    SetIndoorBikeSimulation(SimulationParameters),
}

impl ControlPointCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::RequestControl => OP_REQUEST_CONTROL,
            Self::Reset => OP_RESET,
            Self::SetTargetPower(_) => OP_SET_TARGET_POWER,
            Self::StartOrResume => OP_START_OR_RESUME,
            Self::StopOrPause(_) => OP_STOP_OR_PAUSE,
            Self::SetIndoorBikeSimulation(_) => OP_SET_INDOOR_BIKE_SIMULATION,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            Self::RequestControl | Self::Reset | Self::StartOrResume => {}
            Self::SetTargetPower(watts) => buf.extend_from_slice(&watts.to_le_bytes()),
            Self::StopOrPause(kind) => buf.push(kind.as_byte()),
            Self::SetIndoorBikeSimulation(params) => {
                buf.extend_from_slice(&params.wind_speed.to_le_bytes());
                buf.extend_from_slice(&params.grade.to_le_bytes());
                buf.push(params.rolling_resistance);
                buf.push(params.wind_resistance);
            }
        }
        buf
    }

    /// Recover a command from its wire form. Trailing bytes are rejected so
    /// that a decode always re-encodes to the same payload.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut cursor = FieldCursor::new(data);
        let command = match cursor.u8()? {
            OP_REQUEST_CONTROL => Self::RequestControl,
            OP_RESET => Self::Reset,
            OP_SET_TARGET_POWER => Self::SetTargetPower(cursor.i16()?),
            OP_START_OR_RESUME => Self::StartOrResume,
            OP_STOP_OR_PAUSE => Self::StopOrPause(StopKind::from_byte(cursor.u8()?)?),
            OP_SET_INDOOR_BIKE_SIMULATION => {
                Self::SetIndoorBikeSimulation(SimulationParameters {
                    wind_speed: cursor.i16()?,
                    grade: cursor.i16()?,
                    rolling_resistance: cursor.u8()?,
                    wind_resistance: cursor.u8()?,
                })
            }
            _ => return None,
        };
        if cursor.remaining() != 0 {
            return None;
        }
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        assert_eq!(ControlPointCommand::RequestControl.encode(), vec![0x00]);
        assert_eq!(ControlPointCommand::Reset.encode(), vec![0x01]);
        assert_eq!(ControlPointCommand::StartOrResume.encode(), vec![0x07]);
        assert_eq!(
            ControlPointCommand::SetTargetPower(150).encode(),
            vec![0x05, 0x96, 0x00]
        );
        assert_eq!(
            ControlPointCommand::StopOrPause(StopKind::Stop).encode(),
            vec![0x08, 0x01]
        );
        assert_eq!(
            ControlPointCommand::StopOrPause(StopKind::Pause).encode(),
            vec![0x08, 0x02]
        );
    }

    #[test]
    fn test_decode_recovers_opcode_and_value() {
        let commands = [
            ControlPointCommand::SetTargetPower(150),
            ControlPointCommand::SetTargetPower(-1),
            ControlPointCommand::StopOrPause(StopKind::Pause),
            ControlPointCommand::SetIndoorBikeSimulation(SimulationParameters::from_physical(
                -2.5, 4.25, 0.004, 0.51,
            )),
        ];
        for command in commands {
            let decoded = ControlPointCommand::decode(&command.encode()).unwrap();
            assert_eq!(decoded, command);
            assert_eq!(decoded.opcode(), command.opcode());
        }
    }

    #[test]
    fn test_simulation_layout() {
        let params = SimulationParameters::from_physical(-2.5, 4.25, 0.004, 0.51);
        assert_eq!(params.wind_speed, -2500);
        assert_eq!(params.grade, 425);
        assert_eq!(params.rolling_resistance, 40);
        assert_eq!(params.wind_resistance, 51);
        assert_eq!(
            ControlPointCommand::SetIndoorBikeSimulation(params).encode(),
            vec![0x11, 0x3C, 0xF6, 0xA9, 0x01, 40, 51]
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(ControlPointCommand::decode(&[]), None);
        assert_eq!(ControlPointCommand::decode(&[0x05, 0x96]), None);
        assert_eq!(ControlPointCommand::decode(&[0x08, 0x03]), None);
        assert_eq!(ControlPointCommand::decode(&[0x07, 0x00]), None);
        assert_eq!(ControlPointCommand::decode(&[0x42]), None);
    }
}
