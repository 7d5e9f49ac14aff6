//! Bluetooth transport layer for the device-sync protocol stack.
//!
//! This crate mirrors the BlueZ daemon's live device objects, registers the
//! sync service's RFCOMM profile and negotiates inbound profile connections
//! into channels for a higher-level device manager. The multiplexer and the
//! device manager are external collaborators consumed through the traits in
//! [`mux`]. Everything else lives here: daemon presence tracking, profile
//! re-registration across bluetoothd restarts and enforcement of the
//! one-channel-per-device invariant.

pub mod bluetooth;
pub mod config;
pub mod daemon;
pub mod dbus;
pub mod error;
pub mod event;
pub mod mux;

pub use bluetooth::{orchestrator::BluetoothTransport, profile::SERVICE_UUID};
pub use config::Config;
pub use error::{Result, TransportError};
pub use event::{EventBus, EventSender, TransportEvent};
pub use mux::{Channel, DeviceHandle, DeviceManager, Identity, Muxer, Provenance};
