//! Daemon wiring for embedders.
//!
//! [`run`] owns the whole lifecycle: it builds the transport, exports the
//! D-Bus control interface, forwards transport events to D-Bus signals and
//! tears everything down on interrupt. The caller supplies the two external
//! collaborators, the multiplexer and the device manager.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use crate::{
   bluetooth::orchestrator::BluetoothTransport,
   config::Config,
   dbus::{TransportService, TransportServiceSignals},
   error::Result,
   event::{EventBus, TransportEvent},
   mux::{DeviceManager, Muxer},
};

const BUS_NAME: &str = "org.btlinkd";
const OBJECT_PATH: &str = "/org/btlinkd/transport";

/// Runs the transport daemon until interrupted.
pub async fn run(
   config: Config,
   muxer: Arc<dyn Muxer>,
   device_manager: Arc<dyn DeviceManager>,
) -> Result<()> {
   let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
      .try_init();

   info!("Starting btlinkd transport daemon...");

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create Bluetooth transport with event sender and config
   let transport =
      BluetoothTransport::new(event_bus.clone(), config, muxer, device_manager).await?;

   // Export D-Bus control interface
   let service = TransportService::new(transport.clone());
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btlinkd D-Bus interface available at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btlinkd...");
   transport.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<TransportEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<TransportEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<TransportService>,
      event: TransportEvent,
   ) -> Result<()> {
      match event {
         TransportEvent::DevicesChanged => {
            iface.device_list_changed().await?;
         },
         TransportEvent::ChannelAttached(address, alias) => {
            iface
               .channel_attached(&address.to_string(), &alias)
               .await?;
         },
         TransportEvent::ChannelClosed(address) => {
            iface.channel_closed(&address.to_string()).await?;
         },
         TransportEvent::DeviceError(address, alias) => {
            iface.device_error(&address.to_string(), &alias).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, TransportService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: TransportEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
