//! Bluetooth transport layer.
//!
//! This module mirrors the BlueZ daemon's device objects, manages the sync
//! profile's registration lifecycle and orchestrates channel negotiation on
//! inbound profile connections.

pub mod orchestrator;
pub mod profile;
pub mod registry;
