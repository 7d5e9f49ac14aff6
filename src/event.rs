//! Event handling system for transport state updates.
//!
//! The orchestrator emits these events whenever the filtered device view or
//! a device's channel state changes; [`crate::daemon`] dispatches them to
//! D-Bus signals.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

/// Events emitted by the Bluetooth transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
   /// The filtered `devices` view gained or lost an entry.
   DevicesChanged,
   /// A channel was negotiated and attached for this device.
   ChannelAttached(Address, SmolStr),
   /// A device's channel was closed or its negotiation failed.
   ChannelClosed(Address),
   /// A per-device failure that released the channel slot.
   DeviceError(Address, SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: TransportEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
