use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::orchestrator::BluetoothTransport;

pub struct TransportService {
   transport: BluetoothTransport,
}

impl TransportService {
   pub const fn new(transport: BluetoothTransport) -> Self {
      Self { transport }
   }
}

#[interface(name = "org.btlinkd.Transport")]
impl TransportService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices = self.transport.devices().await;
      serde_json::to_string(&devices).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   /// Proactively attempt a connection to a specific device.
   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .transport
         .broadcast(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Broadcast connect requested for {address}");
      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .transport
         .request_disconnect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_list_changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn channel_attached(
      emitter: &SignalEmitter<'_>,
      address: &str,
      alias: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn channel_closed(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(
      emitter: &SignalEmitter<'_>,
      address: &str,
      alias: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn device_count(&self) -> u32 {
      self.transport.count_devices().await
   }
}
