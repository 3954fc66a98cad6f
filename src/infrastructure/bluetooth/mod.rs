//! Bluetooth Module
//!
//! BLE central session for FTMS trainers, heart-rate straps and generic
//! GATT peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (handle - async request/response and streams)           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ commands
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Session actor                         │
//! │  owns all state, driven by commands and host events      │
//! └──────┬──────────────┬──────────────┬───────────────┬────┘
//!        │              │              │               │
//!        ▼              ▼              ▼               ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Notification │  │ Recorder │
//! │           │  │            │  │     Hub      │  │          │
//! │ - discovery│ │ - lifecycle│  │ - buffers    │  │ - CSV    │
//! │   set     │  │ - catalog  │  │ - streams    │  │   log    │
//! └───────────┘  └────────────┘  └──────────────┘  └──────────┘
//!        ▲
//!        │ HostEvent                       ┌──────────┐
//! ┌──────┴──────────────────────┐          │ Protocol │
//! │  HostController             │          │ - UUIDs  │
//! │  (btleplug / fake)          │          │ - codecs │
//! └─────────────────────────────┘          └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - FTMS/HRS identifiers and wire formats
//! - [`host`] - Host controller interface and its event vocabulary
//! - [`btleplug_host`] - Host controller backed by btleplug
//! - [`fake`] - Scripted host controller
//! - [`scanner`] - Discovery set and target resolution
//! - [`connection`] - Connection lifecycle and GATT catalog
//! - [`notifications`] - Per-characteristic buffers and streams
//! - [`recorder`] - CSV log of received values
//! - [`service`] - Session actor and its handle
//! - [`control`] - Fitness machine control point commands

pub mod btleplug_host;
pub mod connection;
pub mod control;
pub mod fake;
pub mod host;
pub mod notifications;
pub mod protocol;
pub mod recorder;
pub mod scanner;
pub mod service;

// Re-export main service for convenience
pub use control::FitnessMachineControl;
pub use host::{host_event_channel, HostController, HostEvent};
pub use service::{BluetoothService, SessionConfig};
