//! Connection lifecycle and GATT catalog
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! The catalog is only populated while `Connected` and is cleared on every
//! return to `Disconnected`.

use crate::domain::models::{CharacteristicInfo, ConnectionState, ServiceInfo};
use crate::error::BleError;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Catalog {
    services: BTreeMap<Uuid, ServiceInfo>,
    characteristics: BTreeMap<Uuid, CharacteristicInfo>,
}

impl Catalog {
    fn clear(&mut self) {
        self.services.clear();
        self.characteristics.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.characteristics.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Connection {
    state: ConnectionState,
    peripheral: Option<String>,
    catalog: Catalog,
    pending_discoveries: usize,
    discovery_complete: bool,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_current(&self, peripheral: &str) -> bool {
        self.peripheral.as_deref() == Some(peripheral)
    }

    /// The connected peripheral, or `NotConnected`
    pub fn require_connected(&self) -> Result<&str, BleError> {
        match (self.state, self.peripheral.as_deref()) {
            (ConnectionState::Connected, Some(peripheral)) => Ok(peripheral),
            _ => Err(BleError::NotConnected),
        }
    }

    pub fn begin_connect(&mut self, peripheral: &str) -> Result<(), BleError> {
        if self.state != ConnectionState::Disconnected {
            return Err(BleError::InvalidState(self.state));
        }
        self.state = ConnectionState::Connecting;
        self.peripheral = Some(peripheral.to_string());
        self.pending_discoveries = 0;
        self.discovery_complete = false;
        Ok(())
    }

    /// Apply a connected callback. Only a pending connect to the same
    /// peripheral moves the machine forward.
    pub fn mark_connected(&mut self, peripheral: &str) -> bool {
        if self.state == ConnectionState::Connecting && self.is_current(peripheral) {
            self.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Start tearing down. Returns the peripheral to drop, or `None` when
    /// already disconnected.
    pub fn begin_disconnect(&mut self) -> Option<String> {
        match self.state {
            ConnectionState::Disconnected => None,
            _ => {
                self.state = ConnectionState::Disconnecting;
                self.peripheral.clone()
            }
        }
    }

    /// Return to `Disconnected`, dropping the catalog
    pub fn reset(&mut self) -> Option<String> {
        self.state = ConnectionState::Disconnected;
        self.catalog.clear();
        self.pending_discoveries = 0;
        self.discovery_complete = false;
        self.peripheral.take()
    }

    /// Record discovered services; returns the ones whose characteristics
    /// still need discovering
    pub fn record_services(&mut self, peripheral: &str, services: &[Uuid]) -> Vec<Uuid> {
        if self.state != ConnectionState::Connected || !self.is_current(peripheral) {
            debug!("Ignoring services for {} in state {}", peripheral, self.state);
            return Vec::new();
        }
        let mut pending = Vec::new();
        for uuid in services {
            if self.catalog.services.contains_key(uuid) {
                continue;
            }
            self.catalog.services.insert(
                *uuid,
                ServiceInfo {
                    uuid: *uuid,
                    peripheral: peripheral.to_string(),
                    characteristics: Vec::new(),
                },
            );
            pending.push(*uuid);
        }
        self.pending_discoveries += pending.len();
        if self.pending_discoveries == 0 {
            self.discovery_complete = true;
        }
        pending
    }

    /// Record a service's characteristics; returns `true` when this
    /// completed discovery
    pub fn record_characteristics(
        &mut self,
        peripheral: &str,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    ) -> bool {
        if self.state != ConnectionState::Connected || !self.is_current(peripheral) {
            return false;
        }
        let Some(entry) = self.catalog.services.get_mut(&service) else {
            debug!("Characteristics for unknown service {}", service);
            return false;
        };
        for characteristic in characteristics {
            if !entry.characteristics.contains(&characteristic.uuid) {
                entry.characteristics.push(characteristic.uuid);
            }
            self.catalog
                .characteristics
                .insert(characteristic.uuid, characteristic);
        }

        if self.pending_discoveries > 0 {
            self.pending_discoveries -= 1;
            if self.pending_discoveries == 0 && !self.discovery_complete {
                self.discovery_complete = true;
                return true;
            }
        }
        false
    }

    pub fn discovery_complete(&self) -> bool {
        self.discovery_complete
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.catalog.characteristics.get(uuid)
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.catalog.services.values().cloned().collect()
    }

    pub fn characteristics(&self, service: Option<&Uuid>) -> Vec<CharacteristicInfo> {
        self.catalog
            .characteristics
            .values()
            .filter(|c| service.map(|s| c.service == *s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn service_count(&self) -> usize {
        self.catalog.services.len()
    }

    pub fn characteristic_count(&self) -> usize {
        self.catalog.characteristics.len()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::CharacteristicProperties;
    use crate::infrastructure::bluetooth::protocol::uuids;

    fn characteristic(uuid: Uuid, service: Uuid) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid,
            service,
            properties: CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut conn = Connection::new();
        assert_eq!(conn.begin_disconnect(), None);
        conn.begin_connect("bike").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(
            conn.begin_connect("other"),
            Err(BleError::InvalidState(ConnectionState::Connecting))
        );
        assert!(!conn.mark_connected("other"));
        assert!(conn.mark_connected("bike"));
        assert_eq!(conn.require_connected().unwrap(), "bike");
        assert_eq!(conn.begin_disconnect().as_deref(), Some("bike"));
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        assert_eq!(conn.require_connected(), Err(BleError::NotConnected));
        assert_eq!(conn.reset().as_deref(), Some("bike"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_catalog_only_while_connected() {
        let mut conn = Connection::new();
        conn.begin_connect("bike").unwrap();
        assert!(conn
            .record_services("bike", &[uuids::FITNESS_MACHINE_SERVICE])
            .is_empty());
        conn.mark_connected("bike");

        let pending = conn.record_services(
            "bike",
            &[uuids::FITNESS_MACHINE_SERVICE, uuids::HEART_RATE_SERVICE],
        );
        assert_eq!(pending.len(), 2);
        assert!(!conn.discovery_complete());

        assert!(!conn.record_characteristics(
            "bike",
            uuids::FITNESS_MACHINE_SERVICE,
            vec![characteristic(uuids::INDOOR_BIKE_DATA, uuids::FITNESS_MACHINE_SERVICE)],
        ));
        assert!(conn.record_characteristics(
            "bike",
            uuids::HEART_RATE_SERVICE,
            vec![characteristic(uuids::HEART_RATE_MEASUREMENT, uuids::HEART_RATE_SERVICE)],
        ));
        assert!(conn.discovery_complete());
        assert_eq!(conn.service_count(), 2);
        assert_eq!(
            conn.characteristics(Some(&uuids::HEART_RATE_SERVICE)).len(),
            1
        );
        assert!(conn.characteristic(&uuids::INDOOR_BIKE_DATA).is_some());

        conn.reset();
        assert!(conn.catalog().is_empty());
        assert!(conn.characteristic(&uuids::INDOOR_BIKE_DATA).is_none());
    }

    #[test]
    fn test_no_services_completes_discovery() {
        let mut conn = Connection::new();
        conn.begin_connect("p").unwrap();
        conn.mark_connected("p");
        assert!(conn.record_services("p", &[]).is_empty());
        assert!(conn.discovery_complete());
    }
}
