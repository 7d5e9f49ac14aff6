//! Error types for the Bluetooth transport daemon.
//!
//! No error in this subsystem is fatal to the process: failures degrade a
//! single device's availability and are logged at the call site.

use bluer::Address;
use thiserror::Error;

/// Main error type for the transport daemon.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not paired: {0}")]
   DeviceNotPaired(Address),

   #[error("Profile not registered with bluetoothd")]
   ProfileNotRegistered,

   #[error("Channel negotiation failed: {0}")]
   Negotiation(String),

   #[error("Device manager rejected identity: {0}")]
   DeviceManager(String),

   #[error("Channel closed")]
   ChannelClosed,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Transport has been shut down")]
   TransportShutdown,
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;
