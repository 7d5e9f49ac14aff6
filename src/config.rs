//! Configuration management for the transport daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the profile display name and RFCOMM channel selection.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Main configuration structure for the daemon.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Display name published in the profile's SDP record.
   #[serde(default = "default_profile_name")]
   pub profile_name: String,

   /// Fixed RFCOMM channel, advertised in the profile's static SDP record.
   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u16,

   /// Attempt `ConnectProfile` automatically on qualifying property changes.
   /// When disabled, connections happen only via explicit broadcast or
   /// inbound profile connections.
   #[serde(default = "default_auto_connect")]
   pub auto_connect: bool,
}

fn default_profile_name() -> String {
   "Device Sync".to_string()
}

// Android allocates dynamically via SDP; channel 1 is commonly available
// for our own listening side.
const fn default_rfcomm_channel() -> u16 {
   1
}

const fn default_auto_connect() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         profile_name: default_profile_name(),
         rfcomm_channel: default_rfcomm_channel(),
         auto_connect: default_auto_connect(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(btlinkd_home) = env::var("BTLINKD_HOME") {
         PathBuf::from(btlinkd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(TransportError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btlinkd").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_roundtrip_through_disk() -> Result<()> {
      let temp_dir = TempDir::new().unwrap();
      unsafe {
         std::env::set_var("BTLINKD_HOME", temp_dir.path());
      }

      let mut config = Config::default();
      config.profile_name = "Test Sync".to_string();
      config.rfcomm_channel = 6;
      config.save()?;

      let loaded = Config::load()?;
      assert_eq!(loaded.profile_name, "Test Sync");
      assert_eq!(loaded.rfcomm_channel, 6);
      assert!(loaded.auto_connect);

      Ok(())
   }

   #[test]
   fn test_defaults_from_empty_document() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.profile_name, "Device Sync");
      assert_eq!(config.rfcomm_channel, 1);
      assert!(config.auto_connect);
   }
}
