//! Discovery Set
//!
//! Peripherals seen since the last scan started. Cleared at the start of
//! every scan; connect targets are resolved against it.

use crate::domain::models::DiscoveredDevice;
use std::collections::HashMap;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DiscoverySet {
    devices: HashMap<String, DiscoveredDevice>,
    filter: Option<Uuid>,
    scanning: bool,
}

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget previous results and start accepting discoveries
    pub fn begin(&mut self, service_filter: Option<Uuid>) {
        self.devices.clear();
        self.filter = service_filter;
        self.scanning = true;
    }

    /// Stop accepting discoveries and return what was collected
    pub fn end(&mut self) -> Vec<DiscoveredDevice> {
        self.scanning = false;
        self.devices()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record a discovery event. Repeated sightings refresh signal strength
    /// and merge advertisement content. Returns `false` when ignored.
    pub fn record(&mut self, device: DiscoveredDevice) -> bool {
        if !self.scanning {
            return false;
        }
        if let Some(filter) = &self.filter {
            let known_match = self
                .devices
                .get(&device.identifier)
                .map(|d| d.advertises(filter))
                .unwrap_or(false);
            if !device.advertises(filter) && !known_match {
                trace!("Ignoring {} (does not advertise {})", device.identifier, filter);
                return false;
            }
        }

        match self.devices.get_mut(&device.identifier) {
            Some(existing) => {
                existing.rssi = device.rssi;
                if device.name.is_some() {
                    existing.name = device.name;
                }
                for service in device.services {
                    if !existing.services.contains(&service) {
                        existing.services.push(service);
                    }
                }
                existing
                    .advertisement
                    .manufacturer_data
                    .extend(device.advertisement.manufacturer_data);
                existing
                    .advertisement
                    .service_data
                    .extend(device.advertisement.service_data);
            }
            None => {
                self.devices.insert(device.identifier.clone(), device);
            }
        }
        true
    }

    pub fn get(&self, identifier: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(identifier)
    }

    /// Resolve a connect target: exact identifier first, then a
    /// case-insensitive name substring (strongest signal wins on ties)
    pub fn resolve(&self, target: &str) -> Option<&DiscoveredDevice> {
        if let Some(device) = self.devices.get(target) {
            return Some(device);
        }
        if let Some(device) = self
            .devices
            .values()
            .find(|d| d.identifier.eq_ignore_ascii_case(target))
        {
            return Some(device);
        }

        let needle = target.to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.devices
            .values()
            .filter(|d| {
                d.name
                    .as_ref()
                    .map(|name| name.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .max_by_key(|d| d.rssi)
    }

    pub fn update_rssi(&mut self, identifier: &str, rssi: i16) {
        if let Some(device) = self.devices.get_mut(identifier) {
            device.rssi = rssi;
        }
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
