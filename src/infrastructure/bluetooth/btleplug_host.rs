//! btleplug host controller
//!
//! Turns btleplug's async API into the request/callback shape the session
//! expects: each request spawns a task that reports its outcome as a
//! [`HostEvent`]. Adapter events (power, discovery, disconnects) are pumped
//! by a long-lived task started in [`BtleplugHost::new`].

use crate::domain::models::{
    Advertisement, CharacteristicInfo, CharacteristicProperties, DiscoveredDevice, RadioState,
    WriteMode,
};
use crate::error::BleError;
use crate::infrastructure::bluetooth::host::{HostController, HostEvent, HostEventSender};
use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Reported when the advertisement carried no signal strength
const RSSI_UNAVAILABLE: i16 = -127;

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn discovered_device(identifier: String, props: PeripheralProperties) -> DiscoveredDevice {
    let mut device = DiscoveredDevice::new(
        identifier,
        props.local_name,
        props.rssi.unwrap_or(RSSI_UNAVAILABLE),
    )
    .with_services(props.services);
    device.advertisement = Advertisement {
        manufacturer_data: props.manufacturer_data.into_iter().collect(),
        service_data: props.service_data.into_iter().collect(),
    };
    device
}

fn host_error(e: btleplug::Error) -> BleError {
    BleError::Host(e.to_string())
}

pub struct BtleplugHost {
    adapter: Adapter,
    events: HostEventSender,
    peripherals: PeripheralMap,
    /// Connect attempt, then notification forwarding, for the current link
    link: Mutex<Option<JoinHandle<()>>>,
    pump: JoinHandle<()>,
}

impl BtleplugHost {
    /// Open the first adapter and start forwarding its events
    pub async fn new(events: HostEventSender) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to initialise Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to enumerate Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let radio = match adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                warn!("Could not query adapter state: {}", e);
                RadioState::Unknown
            }
        };
        let _ = events.send(HostEvent::PowerStateChanged(radio));

        let stream = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let peripherals = PeripheralMap::default();
        let pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            stream,
            events.clone(),
            peripherals.clone(),
        ));

        Ok(Self {
            adapter,
            events,
            peripherals,
            link: Mutex::new(None),
            pump,
        })
    }

    fn peripheral(&self, identifier: &str) -> Result<Peripheral, BleError> {
        lock(&self.peripherals)
            .get(identifier)
            .cloned()
            .ok_or_else(|| BleError::Host(format!("unknown peripheral {}", identifier)))
    }

    fn characteristic(
        &self,
        identifier: &str,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic), BleError> {
        let peripheral = self.peripheral(identifier)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleError::CharacteristicNotFound(uuid.to_string()))?;
        Ok((peripheral, characteristic))
    }

    fn replace_link(&self, task: Option<JoinHandle<()>>) {
        if let Some(previous) = std::mem::replace(&mut *lock(&self.link), task) {
            previous.abort();
        }
    }
}

impl Drop for BtleplugHost {
    fn drop(&mut self) {
        self.replace_link(None);
        self.pump.abort();
    }
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: HostEventSender,
    peripherals: PeripheralMap,
) {
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let props = match peripheral.properties().await {
                    Ok(Some(props)) => props,
                    Ok(None) => continue,
                    Err(e) => {
                        trace!("No properties for {:?}: {}", id, e);
                        continue;
                    }
                };
                let identifier = id.to_string();
                lock(&peripherals).insert(identifier.clone(), peripheral);
                let _ = events.send(HostEvent::DeviceDiscovered(discovered_device(
                    identifier, props,
                )));
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = events.send(HostEvent::Disconnected {
                    peripheral: id.to_string(),
                });
            }
            CentralEvent::StateUpdate(state) => {
                let _ = events.send(HostEvent::PowerStateChanged(radio_state(state)));
            }
            other => trace!("Adapter event: {:?}", other),
        }
    }
    debug!("Adapter event stream ended");
}

impl HostController for BtleplugHost {
    fn start_scan(&self, service_filter: Option<Uuid>) -> Result<(), BleError> {
        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                warn!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), BleError> {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, identifier: &str) -> Result<(), BleError> {
        let peripheral = self.peripheral(identifier)?;
        let events = self.events.clone();
        let identifier = identifier.to_string();

        let task = tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                let _ = events.send(HostEvent::ConnectFailed {
                    peripheral: identifier,
                    reason: e.to_string(),
                });
                return;
            }
            let notifications = peripheral.notifications().await;
            let _ = events.send(HostEvent::Connected {
                peripheral: identifier.clone(),
            });

            let mut notifications = match notifications {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Notification stream unavailable for {}: {}", identifier, e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let _ = events.send(HostEvent::ValueUpdated {
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream for {} ended", identifier);
        });
        self.replace_link(Some(task));
        Ok(())
    }

    fn cancel_connection(&self, identifier: &str) -> Result<(), BleError> {
        self.replace_link(None);
        let peripheral = self.peripheral(identifier)?;
        let events = self.events.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect of {} reported: {}", identifier, e);
            }
            let _ = events.send(HostEvent::Disconnected {
                peripheral: identifier,
            });
        });
        Ok(())
    }

    fn discover_services(&self, identifier: &str) -> Result<(), BleError> {
        let peripheral = self.peripheral(identifier)?;
        let events = self.events.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery on {} failed: {}", identifier, e);
                return;
            }
            let services = peripheral.services().iter().map(|s| s.uuid).collect();
            let _ = events.send(HostEvent::ServicesDiscovered {
                peripheral: identifier,
                services,
            });
        });
        Ok(())
    }

    fn discover_characteristics(&self, identifier: &str, service: Uuid) -> Result<(), BleError> {
        // btleplug discovers the whole table in one pass
        let peripheral = self.peripheral(identifier)?;
        let characteristics = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        service: c.service_uuid,
                        properties: properties(c.properties),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let _ = self.events.send(HostEvent::CharacteristicsDiscovered {
            peripheral: identifier.to_string(),
            service,
            characteristics,
        });
        Ok(())
    }

    fn read_value(&self, identifier: &str, uuid: Uuid) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(identifier, uuid)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => {
                    let _ = events.send(HostEvent::ValueUpdated {
                        characteristic: uuid,
                        value,
                    });
                }
                Err(e) => warn!("Read of {} failed: {}", uuid, e),
            }
        });
        Ok(())
    }

    fn write_value(
        &self,
        identifier: &str,
        uuid: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(identifier, uuid)?;
        let events = self.events.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            let result = peripheral
                .write(&characteristic, &data, write_type)
                .await
                .map_err(|e| e.to_string());
            match mode {
                WriteMode::WithResponse => {
                    let _ = events.send(HostEvent::WriteCompleted {
                        characteristic: uuid,
                        result,
                    });
                }
                WriteMode::WithoutResponse => {
                    if let Err(e) = result {
                        warn!("Write without response to {} failed: {}", uuid, e);
                    }
                }
            }
        });
        Ok(())
    }

    fn set_notify_value(
        &self,
        identifier: &str,
        uuid: Uuid,
        enabled: bool,
    ) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(identifier, uuid)?;
        tokio::spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = result.map_err(host_error) {
                warn!("Changing notifications on {} failed: {}", uuid, e);
            }
        });
        Ok(())
    }

    fn read_rssi(&self, identifier: &str) -> Result<(), BleError> {
        let peripheral = self.peripheral(identifier)?;
        let events = self.events.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            let result = match peripheral.properties().await {
                Ok(Some(props)) => props
                    .rssi
                    .ok_or_else(|| "controller did not report RSSI".to_string()),
                Ok(None) => Err("no properties for peripheral".to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(HostEvent::RssiRead {
                peripheral: identifier,
                result,
            });
        });
        Ok(())
    }
}
