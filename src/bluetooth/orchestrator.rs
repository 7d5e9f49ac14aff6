//! Connection orchestrator for the Bluetooth transport.
//!
//! One actor task owns the device registry, the profile registration state
//! and every watch task. It is fed by an mpsc inbox plus a loopback channel
//! for self-scheduled work; bus round-trips and channel negotiations run in
//! spawned tasks that report back through the loopback. Idempotent guards on
//! the registry resolve racing notifications, so no locks are needed.

use std::{collections::HashMap, sync::Arc};

use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session,
   SessionEvent, rfcomm::ProfileHandle};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};
use zbus::{fdo::DBusProxy, names::BusName};

use crate::{
   bluetooth::{
      profile::{SERVICE_UUID, build_profile},
      registry::{
         ConnectAction, DeviceInfo, DeviceRegistry, DeviceSnapshot, LinkState, PropertyUpdate,
         SettledChannel,
      },
   },
   config::Config,
   error::{Result, TransportError},
   event::{EventSender, TransportEvent},
   mux::{BoxStream, Channel, DeviceManager, Muxer, PendingConnection, establish_channel},
};

/// Bus name whose presence gates the whole transport.
const BLUEZ_BUS_NAME: &str = "org.bluez";
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Profile Registration ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileState {
   Unregistered,
   Registering,
   Registered,
}

// === Commands ===

enum Command {
   // Daemon presence
   DaemonBound,
   DaemonUnbound,

   // Adapter events
   AdapterAvailable(SmolStr),
   AdapterLost(SmolStr),

   // Device events
   DeviceAdded(Address, SmolStr), // address, adapter name
   DeviceRemoved(Address),
   DeviceProperty(Address, PropertyUpdate),

   // Profile events
   InboundConnection(Address, BoxStream),
   ProfileLost,

   // Negotiation outcomes, stamped with the generation that produced them
   ConnectRequestFailed(Address),
   ChannelEstablished(Address, u64, Arc<dyn Channel>),
   ChannelFailed(Address, u64),

   // User commands
   Broadcast(Address, oneshot::Sender<Result<()>>),
   RequestDisconnect(Address, oneshot::Sender<Result<()>>),
   GetDevices(oneshot::Sender<Vec<DeviceInfo>>),
   CountDevices(oneshot::Sender<u32>),
   Shutdown(oneshot::Sender<()>),
}

// === Main Transport ===

/// Handle to the Bluetooth transport actor.
///
/// Cheap to clone; all operations are forwarded to the actor task.
#[derive(Clone)]
pub struct BluetoothTransport {
   inbox: mpsc::Sender<Command>,
}

impl BluetoothTransport {
   pub async fn new(
      event_tx: EventSender,
      config: Config,
      muxer: Arc<dyn Muxer>,
      device_manager: Arc<dyn DeviceManager>,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor =
         OrchestratorActor::new(config, event_tx, command_rx, muxer, device_manager).await?;
      tokio::spawn(actor.run());
      Ok(Self { inbox: command_tx })
   }

   /// Proactively attempts a connection to a specific device.
   pub async fn broadcast(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::Broadcast(address, tx))
         .await
         .map_err(|_| TransportError::TransportShutdown)?;
      rx.await.map_err(|_| TransportError::TransportShutdown)?
   }

   /// Closes the device's channel, if any.
   pub async fn request_disconnect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Command::RequestDisconnect(address, tx))
         .await
         .map_err(|_| TransportError::TransportShutdown)?;
      rx.await.map_err(|_| TransportError::TransportShutdown)?
   }

   /// The filtered `devices` view.
   pub async fn devices(&self) -> Vec<DeviceInfo> {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(Command::GetDevices(tx)).await.is_err() {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn count_devices(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(Command::CountDevices(tx)).await.is_err() {
         return 0;
      }
      rx.await.unwrap_or_default()
   }

   /// Tears the transport down: closes every channel, releases the profile
   /// registration and stops all watch tasks. Safe to call more than once.
   pub async fn shutdown(&self) {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(Command::Shutdown(tx)).await.is_ok() {
         let _ = rx.await;
      }
   }
}

// === Orchestrator Actor ===

struct OrchestratorActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<Command>,
   loopback_tx: mpsc::Sender<Command>,
   session: Session,
   muxer: Arc<dyn Muxer>,
   device_manager: Arc<dyn DeviceManager>,

   // State
   registry: DeviceRegistry,
   daemon_bound: bool,
   profile_state: ProfileState,
   profile_task: Option<JoinHandle<()>>,
   daemon_watch: Option<JoinHandle<()>>,
   session_monitor: Option<JoinHandle<()>>,
   adapter_monitors: HashMap<SmolStr, JoinHandle<()>>,
}

impl OrchestratorActor {
   async fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<Command>,
      muxer: Arc<dyn Muxer>,
      device_manager: Arc<dyn DeviceManager>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Ok(Self {
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         session,
         muxer,
         device_manager,
         registry: DeviceRegistry::new(SERVICE_UUID),
         daemon_bound: false,
         profile_state: ProfileState::Unregistered,
         profile_task: None,
         daemon_watch: None,
         session_monitor: None,
         adapter_monitors: HashMap::new(),
      })
   }

   async fn run(mut self) {
      info!("Bluetooth transport starting up");

      self.daemon_watch = Some(spawn_daemon_watch(self.loopback_tx.clone()));

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth transport shutting down");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::DaemonBound => {
            self.handle_daemon_bound().await;
         },
         Command::DaemonUnbound => {
            self.handle_daemon_unbound().await;
         },
         Command::AdapterAvailable(name) => {
            if self.daemon_bound {
               self.initialize_adapter(name).await;
            }
         },
         Command::AdapterLost(name) => {
            self.handle_adapter_lost(name).await;
         },
         Command::DeviceAdded(address, adapter_name) => {
            self.handle_device_added(address, adapter_name).await;
         },
         Command::DeviceRemoved(address) => {
            self.handle_device_removed(address).await;
         },
         Command::DeviceProperty(address, update) => {
            self.handle_device_property(address, update).await;
         },
         Command::InboundConnection(address, stream) => {
            self.handle_inbound_connection(address, stream).await;
         },
         Command::ProfileLost => {
            self.handle_profile_lost();
         },
         Command::ConnectRequestFailed(address) => {
            self.handle_connect_request_failed(address);
         },
         Command::ChannelEstablished(address, generation, channel) => {
            self.handle_channel_established(address, generation, channel);
         },
         Command::ChannelFailed(address, generation) => {
            self.handle_channel_failed(address, generation);
         },
         Command::Broadcast(address, reply) => {
            let result = self.attempt_connect(address);
            let _ = reply.send(result);
         },
         Command::RequestDisconnect(address, reply) => {
            self.request_disconnect(address).await;
            let _ = reply.send(Ok(()));
         },
         Command::GetDevices(reply) => {
            let _ = reply.send(self.registry.enumerate());
         },
         Command::CountDevices(reply) => {
            let _ = reply.send(self.registry.enumerate().len() as u32);
         },
         Command::Shutdown(reply) => {
            self.cleanup().await;
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   // === Daemon presence ===

   async fn handle_daemon_bound(&mut self) {
      if self.daemon_bound {
         return;
      }
      info!("bluetoothd is available");
      self.daemon_bound = true;

      self.session_monitor = Some(spawn_session_monitor(
         self.loopback_tx.clone(),
         self.session.clone(),
      ));

      // Catch up on adapters and devices that existed before we attached,
      // then register the profile. Exactly one registration attempt per bind.
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      self.register_profile().await;
   }

   async fn handle_daemon_unbound(&mut self) {
      if !self.daemon_bound {
         return;
      }
      warn!("bluetoothd went away; clearing transport state");
      self.daemon_bound = false;
      self.profile_state = ProfileState::Unregistered;

      if let Some(task) = self.profile_task.take() {
         task.abort();
      }
      if let Some(task) = self.session_monitor.take() {
         task.abort();
      }
      for (_, task) in self.adapter_monitors.drain() {
         task.abort();
      }

      // The daemon's device objects belong to its session; none of them, and
      // no channel negotiated under them, survive a restart.
      clear_devices(&mut self.registry, &self.event_tx).await;
   }

   // === Adapters ===

   async fn initialize_adapter(&mut self, name: SmolStr) {
      if self.adapter_monitors.contains_key(&name) {
         return;
      }
      let adapter = match self.session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Failed to open adapter {name}: {e}");
            return;
         },
      };
      info!("Watching adapter {name}");

      self.adapter_monitors.insert(
         name.clone(),
         spawn_adapter_monitor(self.loopback_tx.clone(), name.clone(), adapter.clone()),
      );

      // Feed pre-existing devices through the same added path.
      match adapter.device_addresses().await {
         Ok(addresses) => {
            for address in addresses {
               self.handle_device_added(address, name.clone()).await;
            }
         },
         Err(e) => {
            warn!("Failed to enumerate devices on {name}: {e}");
         },
      }
   }

   async fn handle_adapter_lost(&mut self, name: SmolStr) {
      if let Some(task) = self.adapter_monitors.remove(&name) {
         task.abort();
         warn!("Adapter lost: {name}");
      }

      let orphaned: Vec<Address> = self
         .registry
         .iter()
         .filter(|d| d.adapter == name)
         .map(|d| d.address)
         .collect();
      for address in orphaned {
         self.handle_device_removed(address).await;
      }
   }

   // === Remote object mirror ===

   async fn handle_device_added(&mut self, address: Address, adapter_name: SmolStr) {
      if self.registry.contains(address) {
         return;
      }

      let Ok(adapter) = self.session.adapter(&adapter_name) else {
         return;
      };
      let (device, snapshot) = match snapshot_device(&adapter, address, &adapter_name).await {
         Ok(materialized) => materialized,
         Err(e) => {
            // Not fatal to the mirror; the object is skipped.
            warn!("Failed to read properties of {address}: {e}");
            return;
         },
      };

      let connected = snapshot.connected;
      let resolved = snapshot.services_resolved;
      debug!("Tracking device {} ({address})", snapshot.alias);
      self.registry.observe_added(snapshot);

      let monitor = spawn_device_monitor(self.loopback_tx.clone(), device, address);
      if let Some(tracked) = self.registry.get_mut(address) {
         tracked.monitor = Some(monitor);
      }

      if self.registry.advertises_service(address) {
         self.event_tx.emit(TransportEvent::DevicesChanged);
      }

      if self.config.auto_connect && (connected || resolved) {
         if let Err(e) = self.attempt_connect(address) {
            debug!("Connect attempt for {address} not made: {e}");
         }
      }
   }

   async fn handle_device_removed(&mut self, address: Address) {
      let advertised = self.registry.advertises_service(address);
      let Some(mut device) = self.registry.observe_removed(address) else {
         return;
      };
      debug!("Untracking device {} ({address})", device.alias);
      device.abort_monitor();
      close_link(&self.event_tx, address, device.release_link()).await;

      if advertised {
         self.event_tx.emit(TransportEvent::DevicesChanged);
      }
   }

   async fn handle_device_property(&mut self, address: Address, update: PropertyUpdate) {
      match self.registry.apply_change(address, update) {
         ConnectAction::Attempt => {
            if self.config.auto_connect {
               if let Err(e) = self.attempt_connect(address) {
                  debug!("Connect attempt for {address} not made: {e}");
               }
            }
         },
         ConnectAction::Disconnect => {
            self.request_disconnect(address).await;
         },
         ConnectAction::None => {},
      }
   }

   // === Connection orchestration ===

   /// Issues a `ConnectProfile` request for the service UUID.
   ///
   /// No-op while the device's channel slot is occupied, so bursts of
   /// property changes cannot produce duplicate requests. Request errors are
   /// reported back through the loopback and only release the slot; the next
   /// qualifying property change retriggers an attempt.
   fn attempt_connect(&mut self, address: Address) -> Result<()> {
      if !self.daemon_bound || self.profile_state != ProfileState::Registered {
         return Err(TransportError::ProfileNotRegistered);
      }

      let Some(device) = self.registry.get_mut(address) else {
         return Err(TransportError::DeviceNotFound(address));
      };
      if device.link.occupies_slot() {
         return Ok(());
      }
      if !device.paired {
         return Err(TransportError::DeviceNotPaired(address));
      }

      let adapter = self.session.adapter(&device.adapter)?;
      let bluer_device = adapter.device(address)?;
      let alias = device.alias.clone();
      device.begin_request();

      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         debug!("ConnectProfile {SERVICE_UUID} -> {alias} ({address})");
         if let Err(e) = bluer_device.connect_profile(&SERVICE_UUID).await {
            debug!("ConnectProfile for {alias} failed: {e}");
            let _ = loopback.send(Command::ConnectRequestFailed(address)).await;
         }
      });

      Ok(())
   }

   /// Closes the device's channel, if any. Silent no-op for unknown devices
   /// and idle links.
   async fn request_disconnect(&mut self, address: Address) {
      let Some(device) = self.registry.get_mut(address) else {
         return;
      };
      let link = device.release_link();
      if link.occupies_slot() {
         close_link(&self.event_tx, address, link).await;
      }
   }

   fn handle_connect_request_failed(&mut self, address: Address) {
      if let Some(device) = self.registry.get_mut(address)
         && matches!(device.link, LinkState::Requested)
      {
         device.release_link();
      }
   }

   // === Channel negotiation ===

   async fn handle_inbound_connection(&mut self, address: Address, stream: BoxStream) {
      // A redelivered connection supersedes whatever holds the slot: the
      // daemon handing us a new stream means the previous one is stale.
      let Some(claim) = self.registry.claim_negotiation(address) else {
         // Unattributable connection; dropping the stream closes it.
         warn!("Inbound connection from untracked device {address}; closing stream");
         return;
      };
      close_link(&self.event_tx, address, claim.displaced).await;

      let pending = PendingConnection {
         address,
         object_path: claim.object_path,
         alias: claim.alias.clone(),
         stream,
      };
      info!("Negotiating inbound connection from {} ({address})", claim.alias);

      let generation = claim.generation;
      let muxer = self.muxer.clone();
      let manager = self.device_manager.clone();
      let loopback = self.loopback_tx.clone();
      let task = tokio::spawn(async move {
         let cmd = match establish_channel(&*muxer, &*manager, pending).await {
            Ok(channel) => Command::ChannelEstablished(address, generation, channel),
            Err(_) => Command::ChannelFailed(address, generation),
         };
         let _ = loopback.send(cmd).await;
      });
      if let Some(device) = self.registry.get_mut(address) {
         device.link = LinkState::Negotiating { task, generation };
      }
   }

   fn handle_channel_established(
      &mut self,
      address: Address,
      generation: u64,
      channel: Arc<dyn Channel>,
   ) {
      match self.registry.settle_established(address, generation, channel) {
         SettledChannel::Attached(alias) => {
            info!("Channel attached for {alias} ({address})");
            self
               .event_tx
               .emit(TransportEvent::ChannelAttached(address, alias));
         },
         SettledChannel::Orphaned(channel) => {
            // Device vanished or the negotiation was superseded.
            tokio::spawn(async move { channel.close().await });
         },
      }
   }

   fn handle_channel_failed(&mut self, address: Address, generation: u64) {
      if let Some(alias) = self.registry.settle_failed(address, generation) {
         self.event_tx.emit(TransportEvent::DeviceError(address, alias));
      }
   }

   // === Profile lifecycle ===

   async fn register_profile(&mut self) {
      if self.profile_state != ProfileState::Unregistered {
         return;
      }
      self.profile_state = ProfileState::Registering;

      let profile = build_profile(&self.config.profile_name, self.config.rfcomm_channel);
      match self.session.register_profile(profile).await {
         Ok(handle) => {
            info!("Profile {SERVICE_UUID} registered with bluetoothd");
            self.profile_task = Some(spawn_accept_loop(handle, self.loopback_tx.clone()));
            self.profile_state = ProfileState::Registered;
            // Attempts are gated on registration, so devices caught up
            // before this point get their first attempt here.
            self.attempt_eligible();
         },
         Err(e) => {
            // Degraded: no profile connections until the next daemon rebind.
            error!("Profile registration failed: {e}");
            self.profile_state = ProfileState::Unregistered;
         },
      }
   }

   fn attempt_eligible(&mut self) {
      if !self.config.auto_connect {
         return;
      }
      let eligible: Vec<Address> = self
         .registry
         .iter()
         .filter(|d| d.paired && (d.connected || d.services_resolved) && !d.link.occupies_slot())
         .map(|d| d.address)
         .collect();
      for address in eligible {
         if let Err(e) = self.attempt_connect(address) {
            debug!("Connect attempt for {address} not made: {e}");
         }
      }
   }

   fn handle_profile_lost(&mut self) {
      if !self.daemon_bound {
         return;
      }
      warn!("Profile registration lost; waiting for bluetoothd rebind");
      if let Some(task) = self.profile_task.take() {
         task.abort();
      }
      self.profile_state = ProfileState::Unregistered;
   }

   // === Teardown ===

   /// Idempotent: every released resource is guarded by a take/drain.
   async fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth transport");

      if let Some(task) = self.daemon_watch.take() {
         task.abort();
      }
      if let Some(task) = self.session_monitor.take() {
         task.abort();
      }
      for (_, task) in self.adapter_monitors.drain() {
         task.abort();
      }
      // Dropping the profile handle unregisters the endpoint.
      if let Some(task) = self.profile_task.take() {
         task.abort();
      }
      self.profile_state = ProfileState::Unregistered;
      self.daemon_bound = false;

      clear_devices(&mut self.registry, &self.event_tx).await;
   }
}

// === Link teardown ===

async fn close_link(event_tx: &EventSender, address: Address, link: LinkState) {
   match link {
      LinkState::Negotiating { task, .. } => {
         task.abort();
         event_tx.emit(TransportEvent::ChannelClosed(address));
      },
      LinkState::Active { channel } => {
         channel.close().await;
         event_tx.emit(TransportEvent::ChannelClosed(address));
      },
      LinkState::Idle | LinkState::Requested => {},
   }
}

/// Removes every mirrored device, closing whatever holds its channel slot.
/// Nothing negotiated before this point survives.
async fn clear_devices(registry: &mut DeviceRegistry, event_tx: &EventSender) {
   let view_populated = !registry.enumerate().is_empty();
   for mut device in registry.drain() {
      device.abort_monitor();
      let address = device.address;
      close_link(event_tx, address, device.release_link()).await;
   }
   if view_populated {
      event_tx.emit(TransportEvent::DevicesChanged);
   }
}

// === Watch tasks ===

fn spawn_daemon_watch(loopback: mpsc::Sender<Command>) -> JoinHandle<()> {
   tokio::spawn(async move {
      if let Err(e) = watch_daemon(&loopback).await {
         error!("bluetoothd presence watch failed: {e}");
      }
   })
}

async fn watch_daemon(loopback: &mpsc::Sender<Command>) -> Result<()> {
   let connection = zbus::Connection::system().await?;
   let dbus = DBusProxy::new(&connection).await?;

   // Subscribe before probing so a flap between the two is not missed.
   let mut owner_changes = dbus.receive_name_owner_changed().await?;

   let bluez = BusName::try_from(BLUEZ_BUS_NAME).map_err(zbus::Error::from)?;
   if dbus.name_has_owner(bluez).await? {
      let _ = loopback.send(Command::DaemonBound).await;
   }

   while let Some(signal) = owner_changes.next().await {
      let Ok(args) = signal.args() else {
         continue;
      };
      if args.name().as_str() != BLUEZ_BUS_NAME {
         continue;
      }
      for cmd in presence_transition(args.old_owner().is_some(), args.new_owner().is_some()) {
         if loopback.send(cmd).await.is_err() {
            return Ok(());
         }
      }
   }
   Ok(())
}

/// Maps a `NameOwnerChanged` on the daemon's name to presence commands.
/// A direct ownership transfer is an unbind followed by a bind; nothing
/// mirrored from the previous owner is valid under the new one.
fn presence_transition(old_owner: bool, new_owner: bool) -> impl Iterator<Item = Command> {
   let unbind = old_owner.then_some(Command::DaemonUnbound);
   let bind = new_owner.then_some(Command::DaemonBound);
   unbind.into_iter().chain(bind)
}

fn spawn_session_monitor(loopback: mpsc::Sender<Command>, session: Session) -> JoinHandle<()> {
   tokio::spawn(async move {
      let Ok(events) = session.events().await else {
         warn!("Failed to watch session for adapter changes");
         return;
      };
      let mut events = std::pin::pin!(events);
      while let Some(event) = events.next().await {
         let cmd = match event {
            SessionEvent::AdapterAdded(name) => Command::AdapterAvailable(name.into()),
            SessionEvent::AdapterRemoved(name) => Command::AdapterLost(name.into()),
         };
         if loopback.send(cmd).await.is_err() {
            return;
         }
      }
   })
}

fn spawn_adapter_monitor(
   loopback: mpsc::Sender<Command>,
   name: SmolStr,
   adapter: Adapter,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let Ok(mut events) = adapter.events().await else {
         warn!("Failed to get adapter events for {name}");
         return;
      };

      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::DeviceAdded(address) => {
               debug!("Device added on {name}: {address}");
               if loopback
                  .send(Command::DeviceAdded(address, name.clone()))
                  .await
                  .is_err()
               {
                  return;
               }
            },
            AdapterEvent::DeviceRemoved(address) => {
               debug!("Device removed on {name}: {address}");
               if loopback.send(Command::DeviceRemoved(address)).await.is_err() {
                  return;
               }
            },
            _ => {},
         }
      }

      let _ = loopback.send(Command::AdapterLost(name)).await;
   })
}

fn spawn_device_monitor(
   loopback: mpsc::Sender<Command>,
   device: Device,
   address: Address,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let Ok(mut events) = device.events().await else {
         warn!("Failed to get property events for {address}");
         return;
      };

      while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
         let Some(update) = watched_update(property) else {
            continue;
         };
         if loopback
            .send(Command::DeviceProperty(address, update))
            .await
            .is_err()
         {
            return;
         }
      }
   })
}

fn spawn_accept_loop(mut handle: ProfileHandle, loopback: mpsc::Sender<Command>) -> JoinHandle<()> {
   tokio::spawn(async move {
      while let Some(request) = handle.next().await {
         let address = request.device();
         debug!("Inbound profile connection from {address}");
         match request.accept() {
            Ok(stream) => {
               if loopback
                  .send(Command::InboundConnection(address, Box::new(stream)))
                  .await
                  .is_err()
               {
                  return;
               }
            },
            Err(e) => {
               warn!("Failed to accept connection from {address}: {e}");
            },
         }
      }

      // The request stream ends when bluetoothd drops our registration.
      let _ = loopback.send(Command::ProfileLost).await;
   })
}

// === Helpers ===

/// Filters the raw BlueZ property notification down to the watched contract.
fn watched_update(property: DeviceProperty) -> Option<PropertyUpdate> {
   match property {
      DeviceProperty::Paired(paired) => Some(PropertyUpdate::Paired(paired)),
      DeviceProperty::Connected(connected) => Some(PropertyUpdate::Connected(connected)),
      DeviceProperty::ServicesResolved(resolved) => {
         Some(PropertyUpdate::ServicesResolved(resolved))
      },
      DeviceProperty::Uuids(uuids) => Some(PropertyUpdate::Uuids(uuids)),
      DeviceProperty::Alias(alias) => Some(PropertyUpdate::Alias(alias.into())),
      _ => None,
   }
}

/// Materializes a device snapshot from the daemon. Any lookup failure makes
/// the whole snapshot fail; the caller logs and skips the object.
async fn snapshot_device(
   adapter: &Adapter,
   address: Address,
   adapter_name: &SmolStr,
) -> Result<(Device, DeviceSnapshot)> {
   let device = adapter.device(address)?;
   let alias = device.alias().await?;
   let paired = device.is_paired().await?;
   let connected = device.is_connected().await?;
   let services_resolved = device.is_services_resolved().await?;
   let uuids = device.uuids().await?.unwrap_or_default();

   let snapshot = DeviceSnapshot {
      address,
      object_path: device_object_path(adapter_name, address),
      alias: alias.into(),
      adapter: adapter_name.clone(),
      paired,
      connected,
      services_resolved,
      uuids,
   };
   Ok((device, snapshot))
}

fn device_object_path(adapter: &str, address: Address) -> String {
   format!(
      "/org/bluez/{adapter}/dev_{}",
      address.to_string().replace(':', "_")
   )
}

#[cfg(test)]
mod tests {
   use std::{
      collections::HashSet,
      sync::{Mutex, atomic::Ordering},
   };

   use super::*;
   use crate::{event::EventBus, mux::testing::MockChannel};

   const D1: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const D2: Address = Address([0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);

   #[derive(Default)]
   struct RecordingBus {
      events: Mutex<Vec<TransportEvent>>,
   }

   impl EventBus for RecordingBus {
      fn emit(&self, event: TransportEvent) {
         self.events.lock().unwrap().push(event);
      }
   }

   fn snapshot(address: Address, advertises: bool) -> DeviceSnapshot {
      let mut uuids = HashSet::new();
      if advertises {
         uuids.insert(SERVICE_UUID);
      }
      DeviceSnapshot {
         address,
         object_path: device_object_path("hci0", address),
         alias: SmolStr::new_static("Pixel"),
         adapter: SmolStr::new_static("hci0"),
         paired: true,
         connected: true,
         services_resolved: true,
         uuids,
      }
   }

   #[test]
   fn test_owner_transfer_unbinds_before_binding() {
      let transfer: Vec<Command> = presence_transition(true, true).collect();
      assert!(matches!(
         transfer.as_slice(),
         [Command::DaemonUnbound, Command::DaemonBound]
      ));

      let appeared: Vec<Command> = presence_transition(false, true).collect();
      assert!(matches!(appeared.as_slice(), [Command::DaemonBound]));

      let vanished: Vec<Command> = presence_transition(true, false).collect();
      assert!(matches!(vanished.as_slice(), [Command::DaemonUnbound]));
   }

   #[tokio::test]
   async fn test_clear_devices_closes_every_link() {
      let mut registry = DeviceRegistry::new(SERVICE_UUID);
      registry.observe_added(snapshot(D1, true));
      registry.observe_added(snapshot(D2, false));

      let channel = Arc::new(MockChannel::default());
      registry.get_mut(D1).unwrap().link = LinkState::Active {
         channel: channel.clone(),
      };
      let claim = registry.claim_negotiation(D2).unwrap();
      registry.get_mut(D2).unwrap().link = LinkState::Negotiating {
         task: tokio::spawn(std::future::pending::<()>()),
         generation: claim.generation,
      };

      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      clear_devices(&mut registry, &event_tx).await;

      assert!(registry.is_empty());
      assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
      {
         let recorded = bus.events.lock().unwrap();
         let closed = recorded
            .iter()
            .filter(|e| matches!(e, TransportEvent::ChannelClosed(_)))
            .count();
         assert_eq!(closed, 2);
         assert!(matches!(recorded.last(), Some(TransportEvent::DevicesChanged)));
      }

      // clearing an already-empty mirror emits nothing
      let before = bus.events.lock().unwrap().len();
      clear_devices(&mut registry, &event_tx).await;
      assert_eq!(bus.events.lock().unwrap().len(), before);
   }

   #[test]
   fn test_device_object_path() {
      let address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      assert_eq!(
         device_object_path("hci0", address),
         "/org/bluez/hci0/dev_00_11_22_33_44_55"
      );
   }

   #[test]
   fn test_watched_update_ignores_unwatched_properties() {
      assert!(watched_update(DeviceProperty::Rssi(-40)).is_none());
      assert!(matches!(
         watched_update(DeviceProperty::Connected(true)),
         Some(PropertyUpdate::Connected(true))
      ));
      assert!(matches!(
         watched_update(DeviceProperty::ServicesResolved(true)),
         Some(PropertyUpdate::ServicesResolved(true))
      ));
   }
}
