//! BLE fitness bridge
//!
//! Scan, connect and talk to BLE peripherals, with first-class support for
//! FTMS trainers and HRS heart-rate straps. The session lives in
//! [`infrastructure::bluetooth`]; [`rpc`] exposes it as JSON-RPC tools.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod rpc;

pub use error::{BleError, BleResult};
