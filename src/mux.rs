//! Collaborator seams for channel multiplexing and device management.
//!
//! The multiplexing/handshake library and the application-level device
//! manager are external to this daemon; they are consumed through the traits
//! defined here. `establish_channel` drives an inbound raw stream through
//! mux-open, identity negotiation, provenance tagging and attachment.

use std::sync::Arc;

use async_trait::async_trait;
use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Raw byte stream handed to the multiplexer.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Boxed stream as delivered by the profile's connection callback.
pub type BoxStream = Box<dyn TransportStream>;

/// Identity payload exchanged during negotiation.
///
/// Produced by the multiplexer's handshake; this transport only annotates it
/// with provenance before handing it upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
   pub device_id: String,
   pub device_name: String,

   /// Opaque remainder of the identity packet, passed through untouched.
   #[serde(default)]
   pub payload: serde_json::Value,

   /// Physical-transport provenance, filled in by this daemon.
   #[serde(skip_serializing_if = "Option::is_none")]
   pub provenance: Option<Provenance>,
}

/// Correlates a negotiated channel with its physical transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
   /// Hardware address of the remote device.
   pub address: String,
   /// BlueZ object path of the remote device.
   pub object_path: String,
}

/// Application-level device handle resolved by the device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
   pub id: String,
   pub name: String,
}

/// Multiplexer over a raw stream.
#[async_trait]
pub trait Muxer: Send + Sync {
   /// Wraps the raw stream, returning its default channel.
   async fn open(&self, stream: BoxStream) -> Result<Arc<dyn Channel>>;
}

/// A negotiated, identified, attachable communication stream.
///
/// Negotiation exchanges identity payloads over the stream; whichever side
/// sends first determines the protocol role. This transport does not
/// distinguish local- from remote-initiated channels and defers role
/// determination entirely to the handshake. Known protocol simplification.
#[async_trait]
pub trait Channel: Send + Sync {
   /// Performs the identity handshake on this channel.
   async fn negotiate(&self) -> Result<Identity>;

   /// Attaches the channel to an application-level device. One-way handoff:
   /// after this call the device manager owns session state.
   async fn attach(&self, handle: DeviceHandle) -> Result<()>;

   /// Closes the channel, interrupting any in-flight negotiation and
   /// releasing the underlying stream. Idempotent.
   async fn close(&self);
}

/// Owner of paired-device identities and session state.
#[async_trait]
pub trait DeviceManager: Send + Sync {
   /// Resolves or creates the application-level device for an identity.
   async fn ensure_device(&self, identity: Identity) -> Result<DeviceHandle>;
}

/// An inbound raw stream awaiting negotiation, scoped to a single device.
pub struct PendingConnection {
   pub address: Address,
   pub object_path: String,
   pub alias: SmolStr,
   pub stream: BoxStream,
}

/// Drives an inbound stream to an attached channel.
///
/// On any failure the channel is closed and the partially-negotiated state
/// discarded; no retry is attempted here. Retry, if any, is driven by the
/// next orchestrator-triggered attempt or a subsequent inbound connection.
pub async fn establish_channel(
   muxer: &dyn Muxer,
   manager: &dyn DeviceManager,
   pending: PendingConnection,
) -> Result<Arc<dyn Channel>> {
   let PendingConnection {
      address,
      object_path,
      alias,
      stream,
   } = pending;

   let channel = muxer.open(stream).await?;

   let negotiated = async {
      let mut identity = channel.negotiate().await?;
      identity.provenance = Some(Provenance {
         address: address.to_string(),
         object_path,
      });

      let handle = manager.ensure_device(identity).await?;
      channel.attach(handle).await
   }
   .await;

   match negotiated {
      Ok(()) => Ok(channel),
      Err(e) => {
         warn!("Channel negotiation with {alias} failed: {e}");
         channel.close().await;
         Err(e)
      },
   }
}

#[cfg(test)]
pub(crate) mod testing {
   //! Mock collaborators shared by the unit tests.

   use std::sync::{
      Mutex,
      atomic::{AtomicUsize, Ordering},
   };

   use super::*;
   use crate::error::TransportError;

   #[derive(Default)]
   pub struct MockChannel {
      pub fail_negotiate: bool,
      pub fail_attach: bool,
      pub attached: Mutex<Option<DeviceHandle>>,
      pub closed: AtomicUsize,
   }

   #[async_trait]
   impl Channel for MockChannel {
      async fn negotiate(&self) -> Result<Identity> {
         if self.fail_negotiate {
            return Err(TransportError::Negotiation("handshake refused".into()));
         }
         Ok(Identity {
            device_id: "remote-1".to_string(),
            device_name: "Remote One".to_string(),
            payload: serde_json::json!({ "protocolVersion": 8 }),
            provenance: None,
         })
      }

      async fn attach(&self, handle: DeviceHandle) -> Result<()> {
         if self.fail_attach {
            return Err(TransportError::ChannelClosed);
         }
         *self.attached.lock().unwrap() = Some(handle);
         Ok(())
      }

      async fn close(&self) {
         self.closed.fetch_add(1, Ordering::SeqCst);
      }
   }

   pub struct MockMuxer {
      pub channel: Arc<MockChannel>,
   }

   #[async_trait]
   impl Muxer for MockMuxer {
      async fn open(&self, _stream: BoxStream) -> Result<Arc<dyn Channel>> {
         Ok(self.channel.clone())
      }
   }

   #[derive(Default)]
   pub struct MockDeviceManager {
      pub reject: bool,
      pub ensured: Mutex<Vec<Identity>>,
   }

   #[async_trait]
   impl DeviceManager for MockDeviceManager {
      async fn ensure_device(&self, identity: Identity) -> Result<DeviceHandle> {
         if self.reject {
            return Err(TransportError::DeviceManager("untrusted identity".into()));
         }
         let handle = DeviceHandle {
            id: identity.device_id.clone(),
            name: identity.device_name.clone(),
         };
         self.ensured.lock().unwrap().push(identity);
         Ok(handle)
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use super::{testing::*, *};

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33]);

   fn pending() -> PendingConnection {
      let (local, _peer) = tokio::io::duplex(256);
      PendingConnection {
         address: TEST_ADDRESS,
         object_path: "/org/bluez/hci0/dev_AA_BB_CC_11_22_33".to_string(),
         alias: SmolStr::new_static("Remote One"),
         stream: Box::new(local),
      }
   }

   #[tokio::test]
   async fn test_successful_negotiation_attaches_once() {
      let channel = Arc::new(MockChannel::default());
      let muxer = MockMuxer {
         channel: channel.clone(),
      };
      let manager = MockDeviceManager::default();

      let result = establish_channel(&muxer, &manager, pending()).await;
      assert!(result.is_ok());

      let ensured = manager.ensured.lock().unwrap();
      assert_eq!(ensured.len(), 1);
      let provenance = ensured[0].provenance.as_ref().unwrap();
      assert_eq!(provenance.address, TEST_ADDRESS.to_string());
      assert_eq!(
         provenance.object_path,
         "/org/bluez/hci0/dev_AA_BB_CC_11_22_33"
      );

      let attached = channel.attached.lock().unwrap();
      assert_eq!(attached.as_ref().unwrap().id, "remote-1");
      assert_eq!(channel.closed.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn test_failed_handshake_closes_channel() {
      let channel = Arc::new(MockChannel {
         fail_negotiate: true,
         ..Default::default()
      });
      let muxer = MockMuxer {
         channel: channel.clone(),
      };
      let manager = MockDeviceManager::default();

      let result = establish_channel(&muxer, &manager, pending()).await;
      assert!(result.is_err());
      assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
      assert!(manager.ensured.lock().unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_rejected_identity_closes_channel() {
      let channel = Arc::new(MockChannel::default());
      let muxer = MockMuxer {
         channel: channel.clone(),
      };
      let manager = MockDeviceManager {
         reject: true,
         ..Default::default()
      };

      let result = establish_channel(&muxer, &manager, pending()).await;
      assert!(result.is_err());
      assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
      assert!(channel.attached.lock().unwrap().is_none());
   }

   #[tokio::test]
   async fn test_failed_attach_closes_channel() {
      let channel = Arc::new(MockChannel {
         fail_attach: true,
         ..Default::default()
      });
      let muxer = MockMuxer {
         channel: channel.clone(),
      };
      let manager = MockDeviceManager::default();

      let result = establish_channel(&muxer, &manager, pending()).await;
      assert!(result.is_err());
      // ensure_device ran, but the failed attach must release the channel
      assert_eq!(manager.ensured.lock().unwrap().len(), 1);
      assert_eq!(channel.closed.load(Ordering::SeqCst), 1);
   }
}
