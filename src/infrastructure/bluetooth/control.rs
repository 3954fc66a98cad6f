//! FTMS control commands
//!
//! Builds Control Point payloads and writes them (with response) through the
//! session. Control grant is not tracked: callers request control first.

use crate::domain::models::WriteMode;
use crate::error::BleResult;
use crate::infrastructure::bluetooth::protocol::{
    uuids, ControlPointCommand, SimulationParameters, StopKind,
};
use crate::infrastructure::bluetooth::service::BluetoothService;
use tracing::{debug, info};

/// Saturate a wattage to the signed 16-bit range carried on the wire
pub fn clamp_power(watts: i64) -> i16 {
    watts.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// Issues control point commands for the connected fitness machine
#[derive(Clone)]
pub struct FitnessMachineControl {
    service: BluetoothService,
}

impl FitnessMachineControl {
    pub fn new(service: BluetoothService) -> Self {
        Self { service }
    }

    /// Write `command` and return the bytes sent
    pub async fn send(&self, command: ControlPointCommand) -> BleResult<Vec<u8>> {
        let payload = command.encode();
        debug!("Control point command {:?} -> {:02X?}", command, payload);
        self.service
            .write(
                uuids::FITNESS_MACHINE_CONTROL_POINT,
                &payload,
                WriteMode::WithResponse,
            )
            .await?;
        Ok(payload)
    }

    pub async fn request_control(&self) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::RequestControl).await
    }

    pub async fn reset(&self) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::Reset).await
    }

    /// ERG target. Out-of-range values are clamped, not rejected.
    pub async fn set_target_power(&self, watts: i64) -> BleResult<Vec<u8>> {
        let clamped = clamp_power(watts);
        if i64::from(clamped) != watts {
            info!("Target power {}W clamped to {}W", watts, clamped);
        }
        self.send(ControlPointCommand::SetTargetPower(clamped)).await
    }

    pub async fn start(&self) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::StartOrResume).await
    }

    pub async fn stop(&self) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::StopOrPause(StopKind::Stop))
            .await
    }

    pub async fn pause(&self) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::StopOrPause(StopKind::Pause))
            .await
    }

    pub async fn set_simulation(&self, params: SimulationParameters) -> BleResult<Vec<u8>> {
        self.send(ControlPointCommand::SetIndoorBikeSimulation(params))
            .await
    }
}
