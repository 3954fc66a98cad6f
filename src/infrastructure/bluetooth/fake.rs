//! Scripted host controller
//!
//! Answers every request immediately with a canned event and records the
//! call. Backs the session tests and the `--fake` demo mode.

use crate::domain::models::{
    CharacteristicInfo, CharacteristicProperties, DiscoveredDevice, RadioState, WriteMode,
};
use crate::error::BleError;
use crate::infrastructure::bluetooth::host::{HostController, HostEvent, HostEventSender};
use crate::infrastructure::bluetooth::protocol::uuids;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;
use uuid::Uuid;

/// A request the session issued
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    StartScan(Option<Uuid>),
    StopScan,
    Connect(String),
    CancelConnection(String),
    DiscoverServices(String),
    DiscoverCharacteristics(String, Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteMode),
    SetNotify(Uuid, bool),
    ReadRssi(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehaviour {
    Succeed,
    Fail(String),
    /// Never answer, so the caller's timeout fires
    Ignore,
}

#[derive(Debug)]
struct Script {
    calls: Vec<HostCall>,
    devices: Vec<DiscoveredDevice>,
    connect: ConnectBehaviour,
    connected: Option<String>,
    services: Vec<(Uuid, Vec<CharacteristicInfo>)>,
    read_values: HashMap<Uuid, Vec<u8>>,
    notification_payloads: HashMap<Uuid, Vec<u8>>,
    write_result: Result<(), String>,
    rssi: Option<i16>,
    silent_disconnect: bool,
}

pub struct FakeHost {
    events: HostEventSender,
    script: Mutex<Script>,
}

fn props(read: bool, write: bool, notify: bool, indicate: bool) -> CharacteristicProperties {
    CharacteristicProperties {
        read,
        write,
        write_without_response: false,
        notify,
        indicate,
    }
}

impl FakeHost {
    pub const BIKE_ID: &'static str = "fake-kickr-0001";
    pub const HRM_ID: &'static str = "fake-hrm-0002";

    /// An empty host with the radio powered on
    pub fn new(events: HostEventSender) -> Self {
        let host = Self {
            events,
            script: Mutex::new(Script {
                calls: Vec::new(),
                devices: Vec::new(),
                connect: ConnectBehaviour::Succeed,
                connected: None,
                services: Vec::new(),
                read_values: HashMap::new(),
                notification_payloads: HashMap::new(),
                write_result: Ok(()),
                rssi: Some(-60),
                silent_disconnect: false,
            }),
        };
        host.emit(HostEvent::PowerStateChanged(RadioState::PoweredOn));
        host
    }

    /// A smart trainer exposing FTMS and HRS, plus a strap advertising HRS.
    /// Connecting to either exposes the trainer's table.
    pub fn fitness_bike(events: HostEventSender) -> Self {
        let bike = DiscoveredDevice::new(Self::BIKE_ID, Some("KICKR CORE 1A2B".into()), -58)
            .with_services(vec![uuids::FITNESS_MACHINE_SERVICE]);
        let strap = DiscoveredDevice::new(Self::HRM_ID, Some("HRM-Pro".into()), -71)
            .with_services(vec![uuids::HEART_RATE_SERVICE]);

        let ftms = uuids::FITNESS_MACHINE_SERVICE;
        let hrs = uuids::HEART_RATE_SERVICE;
        Self::new(events)
            .with_device(bike)
            .with_device(strap)
            .with_service(
                ftms,
                vec![
                    CharacteristicInfo {
                        uuid: uuids::FITNESS_MACHINE_FEATURE,
                        service: ftms,
                        properties: props(true, false, false, false),
                    },
                    CharacteristicInfo {
                        uuid: uuids::INDOOR_BIKE_DATA,
                        service: ftms,
                        properties: props(false, false, true, false),
                    },
                    CharacteristicInfo {
                        uuid: uuids::FITNESS_MACHINE_CONTROL_POINT,
                        service: ftms,
                        properties: props(false, true, false, true),
                    },
                ],
            )
            .with_service(
                hrs,
                vec![CharacteristicInfo {
                    uuid: uuids::HEART_RATE_MEASUREMENT,
                    service: hrs,
                    properties: props(false, false, true, false),
                }],
            )
    }

    pub fn with_radio(self, radio: RadioState) -> Self {
        self.emit(HostEvent::PowerStateChanged(radio));
        self
    }

    pub fn with_device(self, device: DiscoveredDevice) -> Self {
        self.script().devices.push(device);
        self
    }

    pub fn with_service(self, service: Uuid, characteristics: Vec<CharacteristicInfo>) -> Self {
        self.script().services.push((service, characteristics));
        self
    }

    pub fn with_connect_behaviour(self, behaviour: ConnectBehaviour) -> Self {
        self.script().connect = behaviour;
        self
    }

    /// Value reported in response to a read request
    pub fn with_read_value(self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.script().read_values.insert(characteristic, value);
        self
    }

    /// Value pushed once each time notifications are enabled
    pub fn with_notification_payload(self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.script()
            .notification_payloads
            .insert(characteristic, value);
        self
    }

    pub fn with_write_result(self, result: Result<(), String>) -> Self {
        self.script().write_result = result;
        self
    }

    pub fn with_rssi(self, rssi: Option<i16>) -> Self {
        self.script().rssi = rssi;
        self
    }

    /// Accept disconnect requests without ever confirming them
    pub fn with_silent_disconnect(self) -> Self {
        self.script().silent_disconnect = true;
        self
    }

    /// Every request issued so far, in order
    pub fn calls(&self) -> Vec<HostCall> {
        self.script().calls.clone()
    }

    pub fn emit(&self, event: HostEvent) {
        trace!("Fake host event: {:?}", event);
        let _ = self.events.send(event);
    }

    pub fn emit_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(HostEvent::ValueUpdated {
            characteristic,
            value,
        });
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self) {
        if let Some(peripheral) = self.script().connected.take() {
            self.emit(HostEvent::Disconnected { peripheral });
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: HostCall) -> MutexGuard<'_, Script> {
        let mut script = self.script();
        script.calls.push(call);
        script
    }
}

impl HostController for FakeHost {
    fn start_scan(&self, service_filter: Option<Uuid>) -> Result<(), BleError> {
        let devices = self.record(HostCall::StartScan(service_filter)).devices.clone();
        for device in devices {
            self.emit(HostEvent::DeviceDiscovered(device));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), BleError> {
        self.record(HostCall::StopScan);
        Ok(())
    }

    fn connect(&self, peripheral: &str) -> Result<(), BleError> {
        let mut script = self.record(HostCall::Connect(peripheral.to_string()));
        let peripheral = peripheral.to_string();
        let event = match script.connect.clone() {
            ConnectBehaviour::Succeed => {
                script.connected = Some(peripheral.clone());
                Some(HostEvent::Connected { peripheral })
            }
            ConnectBehaviour::Fail(reason) => Some(HostEvent::ConnectFailed { peripheral, reason }),
            ConnectBehaviour::Ignore => None,
        };
        drop(script);
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    fn cancel_connection(&self, peripheral: &str) -> Result<(), BleError> {
        let was_connected = {
            let mut script = self.record(HostCall::CancelConnection(peripheral.to_string()));
            !script.silent_disconnect && script.connected.take().is_some()
        };
        if was_connected {
            self.emit(HostEvent::Disconnected {
                peripheral: peripheral.to_string(),
            });
        }
        Ok(())
    }

    fn discover_services(&self, peripheral: &str) -> Result<(), BleError> {
        let services = self
            .record(HostCall::DiscoverServices(peripheral.to_string()))
            .services
            .iter()
            .map(|(uuid, _)| *uuid)
            .collect();
        self.emit(HostEvent::ServicesDiscovered {
            peripheral: peripheral.to_string(),
            services,
        });
        Ok(())
    }

    fn discover_characteristics(&self, peripheral: &str, service: Uuid) -> Result<(), BleError> {
        let characteristics = self
            .record(HostCall::DiscoverCharacteristics(peripheral.to_string(), service))
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, chars)| chars.clone())
            .unwrap_or_default();
        self.emit(HostEvent::CharacteristicsDiscovered {
            peripheral: peripheral.to_string(),
            service,
            characteristics,
        });
        Ok(())
    }

    fn read_value(&self, _peripheral: &str, characteristic: Uuid) -> Result<(), BleError> {
        let value = self
            .record(HostCall::Read(characteristic))
            .read_values
            .get(&characteristic)
            .cloned();
        if let Some(value) = value {
            self.emit_value(characteristic, value);
        }
        Ok(())
    }

    fn write_value(
        &self,
        _peripheral: &str,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let result = self
            .record(HostCall::Write(characteristic, data.to_vec(), mode))
            .write_result
            .clone();
        if mode == WriteMode::WithResponse {
            self.emit(HostEvent::WriteCompleted {
                characteristic,
                result,
            });
        }
        Ok(())
    }

    fn set_notify_value(
        &self,
        _peripheral: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BleError> {
        let payload = self
            .record(HostCall::SetNotify(characteristic, enabled))
            .notification_payloads
            .get(&characteristic)
            .cloned();
        if let (true, Some(value)) = (enabled, payload) {
            self.emit_value(characteristic, value);
        }
        Ok(())
    }

    fn read_rssi(&self, peripheral: &str) -> Result<(), BleError> {
        let rssi = self.record(HostCall::ReadRssi(peripheral.to_string())).rssi;
        self.emit(HostEvent::RssiRead {
            peripheral: peripheral.to_string(),
            result: rssi.ok_or_else(|| "controller did not report RSSI".to_string()),
        });
        Ok(())
    }
}
