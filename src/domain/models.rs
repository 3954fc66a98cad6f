use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Power state of the host Bluetooth radio as last reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::PoweredOn => "powered on",
            Self::PoweredOff => "powered off",
            Self::Unauthorized => "unauthorized",
        };
        f.write_str(s)
    }
}

/// Lifecycle of the single supported peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Advertisement payload captured with a discovery event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Advertisement {
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    pub fn is_empty(&self) -> bool {
        self.manufacturer_data.is_empty() && self.service_data.is_empty()
    }
}

/// A peripheral seen during the current scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    /// Stable handle assigned by the host controller
    pub identifier: String,
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    pub services: Vec<Uuid>,
    pub advertisement: Advertisement,
}

impl DiscoveredDevice {
    pub fn new(identifier: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            identifier: identifier.into(),
            name,
            rssi,
            services: Vec::new(),
            advertisement: Advertisement::default(),
        }
    }

    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Capability flags declared by a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.read {
            names.push("read");
        }
        if self.write {
            names.push("write");
        }
        if self.write_without_response {
            names.push("write_without_response");
        }
        if self.notify {
            names.push("notify");
        }
        if self.indicate {
            names.push("indicate");
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub peripheral: String,
    pub characteristics: Vec<Uuid>,
}

/// Summary of the connected peripheral
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub state: ConnectionState,
    pub service_count: usize,
    pub characteristic_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    pub fn from_response_flag(with_response: bool) -> Self {
        if with_response {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }
}
