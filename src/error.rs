use crate::domain::models::{ConnectionState, RadioState};
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the BLE session.
///
/// Decode failures are not part of this enum: the codec returns `None` and
/// callers fall back to the raw bytes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleError {
    #[error("bluetooth radio unavailable ({0})")]
    RadioUnavailable(RadioState),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionState),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("read timed out after {}ms", .0.as_millis())]
    ReadTimeout(Duration),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("RSSI unavailable: {0}")]
    RssiUnavailable(String),

    #[error("invalid identifier: {0}")]
    InvalidUuid(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("host controller error: {0}")]
    Host(String),

    #[error("log session error: {0}")]
    Log(String),

    #[error("session closed")]
    SessionClosed,
}

impl BleError {
    /// Stable machine-readable name used by the RPC layer
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RadioUnavailable(_) => "RadioUnavailable",
            Self::DeviceNotFound(_) => "DeviceNotFound",
            Self::ConnectTimeout(_) => "ConnectTimeout",
            Self::ConnectFailed(_) => "ConnectFailed",
            Self::NotConnected => "NotConnected",
            Self::InvalidState(_) => "InvalidState",
            Self::CharacteristicNotFound(_) => "CharacteristicNotFound",
            Self::ReadTimeout(_) => "ReadTimeout",
            Self::WriteFailed(_) => "WriteFailed",
            Self::RssiUnavailable(_) => "RssiUnavailable",
            Self::InvalidUuid(_) => "InvalidUuid",
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::Host(_) => "HostError",
            Self::Log(_) => "LogError",
            Self::SessionClosed => "SessionClosed",
        }
    }
}

pub type BleResult<T> = Result<T, BleError>;
