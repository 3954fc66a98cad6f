//! Host Controller Interface
//!
//! The radio stack is request/callback shaped: every method here only
//! *issues* a request and returns immediately. Completions arrive later as
//! [`HostEvent`]s on the channel handed to the implementation at
//! construction, from whatever thread the stack uses. The session actor is
//! the only consumer of that channel.

use crate::domain::models::{CharacteristicInfo, DiscoveredDevice, RadioState, WriteMode};
use crate::error::BleError;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Asynchronous completion delivered by the host stack
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    PowerStateChanged(RadioState),
    DeviceDiscovered(DiscoveredDevice),
    Connected {
        peripheral: String,
    },
    Disconnected {
        peripheral: String,
    },
    ConnectFailed {
        peripheral: String,
        reason: String,
    },
    ServicesDiscovered {
        peripheral: String,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        peripheral: String,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    ValueUpdated {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: Uuid,
        result: Result<(), String>,
    },
    RssiRead {
        peripheral: String,
        result: Result<i16, String>,
    },
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Channel pair connecting a host implementation to the session
pub fn host_event_channel() -> (HostEventSender, HostEventReceiver) {
    mpsc::unbounded_channel()
}

/// Requests the session issues to the radio stack
pub trait HostController: Send + Sync {
    fn start_scan(&self, service_filter: Option<Uuid>) -> Result<(), BleError>;
    fn stop_scan(&self) -> Result<(), BleError>;

    fn connect(&self, peripheral: &str) -> Result<(), BleError>;
    /// Abort a pending connect or drop an established link
    fn cancel_connection(&self, peripheral: &str) -> Result<(), BleError>;

    fn discover_services(&self, peripheral: &str) -> Result<(), BleError>;
    fn discover_characteristics(&self, peripheral: &str, service: Uuid) -> Result<(), BleError>;

    fn read_value(&self, peripheral: &str, characteristic: Uuid) -> Result<(), BleError>;
    fn write_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;
    fn set_notify_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BleError>;

    fn read_rssi(&self, peripheral: &str) -> Result<(), BleError>;
}
