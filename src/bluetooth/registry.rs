//! Mirror of the Bluetooth daemon's live device objects.
//!
//! The registry tracks one `RemoteDevice` per BlueZ device object, updated
//! purely from asynchronous notifications, and owns each device's single
//! channel slot. It holds no bus handles itself; the orchestrator feeds it
//! observed events and executes the actions it returns.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use bluer::Address;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::mux::Channel;

/// Typed change-set for the watched subset of the device property contract.
#[derive(Debug, Clone)]
pub enum PropertyUpdate {
   Paired(bool),
   Connected(bool),
   ServicesResolved(bool),
   Uuids(HashSet<Uuid>),
   Alias(SmolStr),
}

/// What the orchestrator should do after a property change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
   /// `connected` or `services_resolved` transitioned to true.
   Attempt,
   /// `connected` transitioned to false.
   Disconnect,
   None,
}

/// Channel slot of a single device.
///
/// `Requested`, `Negotiating` and `Active` all occupy the slot, so a second
/// connect attempt while any of them holds it is a no-op.
pub enum LinkState {
   Idle,
   /// `ConnectProfile` issued; waiting for the daemon to deliver a stream.
   Requested,
   /// Inbound stream being negotiated. The generation stamp ties the task's
   /// eventual completion message to the negotiation that produced it.
   Negotiating { task: JoinHandle<()>, generation: u64 },
   /// Negotiated channel attached to the device manager.
   Active { channel: Arc<dyn Channel> },
}

impl LinkState {
   pub fn occupies_slot(&self) -> bool {
      !matches!(self, Self::Idle)
   }
}

/// Mirrors one remote Bluetooth device object.
pub struct RemoteDevice {
   pub address: Address,
   pub object_path: String,
   pub alias: SmolStr,
   pub adapter: SmolStr,
   pub paired: bool,
   pub connected: bool,
   pub services_resolved: bool,
   pub uuids: HashSet<Uuid>,
   pub link: LinkState,
   /// Monotonic stamp for negotiations started on this device.
   pub negotiation_seq: u64,
   /// Property-change watch task, aborted when the device is dropped.
   pub monitor: Option<JoinHandle<()>>,
}

impl RemoteDevice {
   /// Claims the channel slot for an outbound connect request.
   /// Returns false if the slot is already occupied.
   pub fn begin_request(&mut self) -> bool {
      if self.link.occupies_slot() {
         return false;
      }
      self.link = LinkState::Requested;
      true
   }

   /// Releases the channel slot, returning whatever held it so the caller
   /// can close the channel or abort the negotiation task.
   pub fn release_link(&mut self) -> LinkState {
      std::mem::replace(&mut self.link, LinkState::Idle)
   }

   pub fn has_active_channel(&self) -> bool {
      matches!(self.link, LinkState::Active { .. })
   }

   /// Stops the property watch; the monitor outlives nothing else.
   pub fn abort_monitor(&mut self) {
      if let Some(handle) = self.monitor.take() {
         handle.abort();
      }
   }
}

impl Drop for RemoteDevice {
   fn drop(&mut self) {
      self.abort_monitor();
      if let LinkState::Negotiating { task, .. } = &self.link {
         task.abort();
      }
   }
}

/// Snapshot of a device's properties, materialized when the object appears.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
   pub address: Address,
   pub object_path: String,
   pub alias: SmolStr,
   pub adapter: SmolStr,
   pub paired: bool,
   pub connected: bool,
   pub services_resolved: bool,
   pub uuids: HashSet<Uuid>,
}

/// A claimed inbound negotiation: what the slot held before, plus the stamp
/// the eventual completion message must carry to be honored.
pub struct NegotiationClaim {
   pub object_path: String,
   pub alias: SmolStr,
   pub generation: u64,
   pub displaced: LinkState,
}

/// How a completed negotiation settled against the current slot state.
pub enum SettledChannel {
   /// The slot was still waiting on this negotiation; the channel is live.
   Attached(SmolStr),
   /// The slot moved on in the meantime; the caller must close the channel.
   Orphaned(Arc<dyn Channel>),
}

/// Externally visible view of one tracked device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
   pub address: String,
   pub alias: SmolStr,
   pub paired: bool,
   pub connected: bool,
   pub services_resolved: bool,
   pub has_channel: bool,
}

/// The device table, filtered externally to the target service UUID.
pub struct DeviceRegistry {
   service_uuid: Uuid,
   devices: HashMap<Address, RemoteDevice>,
}

impl DeviceRegistry {
   pub fn new(service_uuid: Uuid) -> Self {
      Self {
         service_uuid,
         devices: HashMap::new(),
      }
   }

   /// Starts tracking a newly observed device object. Idempotent: an
   /// already-tracked address is left untouched and `false` returned.
   pub fn observe_added(&mut self, snapshot: DeviceSnapshot) -> bool {
      if self.devices.contains_key(&snapshot.address) {
         return false;
      }
      let DeviceSnapshot {
         address,
         object_path,
         alias,
         adapter,
         paired,
         connected,
         services_resolved,
         uuids,
      } = snapshot;
      self.devices.insert(
         address,
         RemoteDevice {
            address,
            object_path,
            alias,
            adapter,
            paired,
            connected,
            services_resolved,
            uuids,
            link: LinkState::Idle,
            negotiation_seq: 0,
            monitor: None,
         },
      );
      true
   }

   /// Stops tracking a removed device object. Unknown addresses are a no-op.
   /// The returned device still holds its link so the caller can close it.
   pub fn observe_removed(&mut self, address: Address) -> Option<RemoteDevice> {
      self.devices.remove(&address)
   }

   /// Applies a property change and reports the resulting action.
   /// Only transitions count: a repeated `connected = true` yields nothing.
   pub fn apply_change(&mut self, address: Address, update: PropertyUpdate) -> ConnectAction {
      let Some(device) = self.devices.get_mut(&address) else {
         return ConnectAction::None;
      };

      match update {
         PropertyUpdate::Paired(paired) => {
            device.paired = paired;
            ConnectAction::None
         },
         PropertyUpdate::Connected(connected) => {
            let was = device.connected;
            device.connected = connected;
            match (was, connected) {
               (false, true) => ConnectAction::Attempt,
               (true, false) => ConnectAction::Disconnect,
               _ => ConnectAction::None,
            }
         },
         PropertyUpdate::ServicesResolved(resolved) => {
            let was = device.services_resolved;
            device.services_resolved = resolved;
            if !was && resolved {
               ConnectAction::Attempt
            } else {
               ConnectAction::None
            }
         },
         PropertyUpdate::Uuids(uuids) => {
            device.uuids = uuids;
            ConnectAction::None
         },
         PropertyUpdate::Alias(alias) => {
            device.alias = alias;
            ConnectAction::None
         },
      }
   }

   /// Claims the device's channel slot for an inbound negotiation,
   /// displacing whatever held it. The daemon redelivering a connection
   /// means the previous stream is stale, so the new one wins. `None` for
   /// untracked devices; the caller drops the stream unopened.
   pub fn claim_negotiation(&mut self, address: Address) -> Option<NegotiationClaim> {
      let device = self.devices.get_mut(&address)?;
      let displaced = device.release_link();
      device.negotiation_seq += 1;
      Some(NegotiationClaim {
         object_path: device.object_path.clone(),
         alias: device.alias.clone(),
         generation: device.negotiation_seq,
         displaced,
      })
   }

   /// Applies a successful negotiation. A completion whose stamp no longer
   /// matches the slot (released or reclaimed since the task started) hands
   /// the channel back for closing instead of attaching it.
   pub fn settle_established(
      &mut self,
      address: Address,
      generation: u64,
      channel: Arc<dyn Channel>,
   ) -> SettledChannel {
      match self.devices.get_mut(&address) {
         Some(device)
            if matches!(
               device.link,
               LinkState::Negotiating { generation: g, .. } if g == generation
            ) =>
         {
            device.link = LinkState::Active { channel };
            SettledChannel::Attached(device.alias.clone())
         },
         _ => SettledChannel::Orphaned(channel),
      }
   }

   /// Applies a failed negotiation, releasing the slot it claimed. Stale
   /// failures are ignored so they cannot release a successor's slot.
   pub fn settle_failed(&mut self, address: Address, generation: u64) -> Option<SmolStr> {
      let device = self.devices.get_mut(&address)?;
      if matches!(
         device.link,
         LinkState::Negotiating { generation: g, .. } if g == generation
      ) {
         device.release_link();
         Some(device.alias.clone())
      } else {
         None
      }
   }

   pub fn get(&self, address: Address) -> Option<&RemoteDevice> {
      self.devices.get(&address)
   }

   pub fn get_mut(&mut self, address: Address) -> Option<&mut RemoteDevice> {
      self.devices.get_mut(&address)
   }

   pub fn contains(&self, address: Address) -> bool {
      self.devices.contains_key(&address)
   }

   pub fn iter(&self) -> impl Iterator<Item = &RemoteDevice> {
      self.devices.values()
   }

   /// Whether a device advertises the target service, i.e. belongs to the
   /// filtered `devices` view.
   pub fn advertises_service(&self, address: Address) -> bool {
      self
         .devices
         .get(&address)
         .is_some_and(|d| d.uuids.contains(&self.service_uuid))
   }

   /// The filtered `devices` view.
   pub fn enumerate(&self) -> Vec<DeviceInfo> {
      self
         .devices
         .values()
         .filter(|d| d.uuids.contains(&self.service_uuid))
         .map(|d| DeviceInfo {
            address: d.address.to_string(),
            alias: d.alias.clone(),
            paired: d.paired,
            connected: d.connected,
            services_resolved: d.services_resolved,
            has_channel: d.has_active_channel(),
         })
         .collect()
   }

   /// Removes every device, returning them with their links intact so the
   /// caller can close channels. Used on daemon unbind and at teardown.
   pub fn drain(&mut self) -> Vec<RemoteDevice> {
      self.devices.drain().map(|(_, device)| device).collect()
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }
}
