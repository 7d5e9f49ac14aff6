//! RFCOMM profile definition for the sync service.
//!
//! The profile is registered with bluetoothd so that remote devices can
//! resolve the service via SDP and so the daemon delivers their inbound
//! connections to this process. Registration itself is driven by the
//! orchestrator, which re-registers on every daemon rebind.

use bluer::rfcomm::Profile;
use uuid::Uuid;

/// Service UUID of the sync protocol's Bluetooth profile.
pub const SERVICE_UUID: Uuid = uuid::uuid!("185f3df4-3268-4e3f-9fca-d4d5059915bd");

/// Builds the profile registration request.
///
/// The link must be authenticated (the platform's pairing), but no per-use
/// authorization prompt is wanted. The profile listens on a fixed channel
/// and a static SDP record advertising it is always published; remote peers
/// resolve the channel from the record.
pub fn build_profile(name: &str, channel: u16) -> Profile {
   Profile {
      uuid: SERVICE_UUID,
      name: Some(name.to_string()),
      channel: Some(channel),
      require_authentication: Some(true),
      require_authorization: Some(false),
      auto_connect: Some(false),
      service_record: Some(service_record(name, channel)),
      ..Default::default()
   }
}

/// Static SDP record for a fixed-channel registration.
fn service_record(name: &str, channel: u16) -> String {
   format!(
      r#"<?xml version="1.0" encoding="UTF-8" ?>
<record>
  <attribute id="0x0001">
    <sequence>
      <uuid value="{SERVICE_UUID}" />
    </sequence>
  </attribute>
  <attribute id="0x0003">
    <uuid value="{SERVICE_UUID}" />
  </attribute>
  <attribute id="0x0004">
    <sequence>
      <sequence>
        <uuid value="0x0100" />
      </sequence>
      <sequence>
        <uuid value="0x0003" />
        <uint8 value="{channel}" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0005">
    <sequence>
      <uuid value="0x1002" />
    </sequence>
  </attribute>
  <attribute id="0x0100">
    <text value="{name}" />
  </attribute>
</record>
"#
   )
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_service_uuid() {
      assert_eq!(
         SERVICE_UUID.to_string(),
         "185f3df4-3268-4e3f-9fca-d4d5059915bd"
      );
   }

   #[test]
   fn test_profile_options() {
      let profile = build_profile("Device Sync", 6);
      assert_eq!(profile.uuid, SERVICE_UUID);
      assert_eq!(profile.require_authentication, Some(true));
      assert_eq!(profile.require_authorization, Some(false));
      assert_eq!(profile.channel, Some(6));

      let record = profile.service_record.unwrap();
      assert!(record.contains("185f3df4-3268-4e3f-9fca-d4d5059915bd"));
      assert!(record.contains(r#"<uint8 value="6" />"#));
      assert!(record.contains("Device Sync"));
   }

   #[test]
   fn test_record_is_always_published() {
      let profile = build_profile("Device Sync", 1);
      let record = profile.service_record.expect("static record must be set");
      assert!(record.contains(r#"<uint8 value="1" />"#));
   }
}
