//! Configuration management for the HID device service.
//!
//! This module handles loading and saving configuration from disk,
//! including reconnect policy, channel parameters and record locations.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use bluer::Address;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
   error::{HiddError, Result},
   hid::{
      SessionConfig,
      message::ActivateRequest,
      protocol::{DEFAULT_MTU, FLUSH_TIMEOUT_INFINITE, Security},
   },
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default = "default_max_reconnect_attempts")]
   pub max_reconnect_attempts: u32,

   #[serde(default = "default_accept_timeout")]
   pub accept_timeout_sec: u64,

   #[serde(default = "default_connect_retry_delay")]
   pub connect_retry_delay_ms: u64,

   #[serde(default = "default_local_mtu")]
   pub local_mtu: u16,

   #[serde(default = "default_flush_timeout")]
   pub flush_timeout: u16,

   #[serde(default)]
   pub security: Security,

   #[serde(default = "default_true")]
   pub auto_reactivate: bool,

   /// Activate a session as soon as the daemon starts.
   #[serde(default = "default_true")]
   pub auto_activate: bool,

   /// Binary SDP record describing the HID device.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub hid_record: Option<PathBuf>,

   /// Binary SDP Device ID record.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub device_id_record: Option<PathBuf>,

   /// Host to reconnect to; unset waits for any host.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub peer_address: Option<String>,
}

const fn default_max_reconnect_attempts() -> u32 {
   7
}

const fn default_accept_timeout() -> u64 {
   60
}

const fn default_connect_retry_delay() -> u64 {
   2000
}

const fn default_local_mtu() -> u16 {
   DEFAULT_MTU
}

const fn default_flush_timeout() -> u16 {
   FLUSH_TIMEOUT_INFINITE
}

const fn default_true() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         max_reconnect_attempts: default_max_reconnect_attempts(),
         accept_timeout_sec: default_accept_timeout(),
         connect_retry_delay_ms: default_connect_retry_delay(),
         local_mtu: default_local_mtu(),
         flush_timeout: default_flush_timeout(),
         security: Security::default(),
         auto_reactivate: true,
         auto_activate: true,
         hid_record: None,
         device_id_record: None,
         peer_address: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         debug!("Writing default configuration to {}", path.display());
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(hidd_home) = env::var("HIDD_HOME") {
         PathBuf::from(hidd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(HiddError::ConfigDirNotFound);
      };

      Ok(config_dir.join("hidd").join("config.toml"))
   }

   /// Parses the configured peer, `None` if the device waits for any host.
   pub fn peer(&self) -> Result<Option<Address>> {
      self
         .peer_address
         .as_deref()
         .map(|s| s.parse().map_err(|_| HiddError::InvalidAddress(s.to_owned())))
         .transpose()
   }

   /// Reads the configured HID and Device ID records.
   pub fn read_records(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
      let read = |path: &Option<PathBuf>| path.as_deref().map(fs::read).transpose();
      Ok((read(&self.hid_record)?, read(&self.device_id_record)?))
   }

   /// Activation parameters built from the configured peer and records.
   pub fn activation(&self) -> Result<ActivateRequest> {
      let (hid_record, device_id_record) = self.read_records()?;
      Ok(ActivateRequest {
         peer: self.peer()?.unwrap_or_else(Address::any),
         hid_record,
         device_id_record,
         qos_control: None,
         qos_interrupt: None,
         flush_timeout: self.flush_timeout,
      })
   }

   pub fn session_config(&self) -> SessionConfig {
      SessionConfig {
         max_retries: self.max_reconnect_attempts,
         accept_window: Duration::from_secs(self.accept_timeout_sec),
         retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
         local_mtu: self.local_mtu,
         security: self.security,
         auto_reactivate: self.auto_reactivate,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_default_written_when_missing() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("hidd").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "max_reconnect_attempts = 3\nsecurity = \"high\"\npeer_address = \"00:1A:7D:DA:71:13\"\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.max_reconnect_attempts, 3);
      assert_eq!(config.security, Security::High);
      assert_eq!(config.local_mtu, 672);
      assert!(config.auto_reactivate);
      assert_eq!(
         config.peer().unwrap(),
         Some(Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]))
      );

      let session = config.session_config();
      assert_eq!(session.max_retries, 3);
      assert_eq!(session.retry_delay, Duration::from_secs(2));
   }

   #[test]
   fn test_bad_peer_rejected() {
      let config = Config {
         peer_address: Some("not-an-address".into()),
         ..Config::default()
      };
      assert!(matches!(config.peer(), Err(HiddError::InvalidAddress(_))));
   }

   #[test]
   fn test_records_read_from_disk() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("hid.bin");
      fs::write(&path, [0x35, 0x00]).unwrap();
      let config = Config {
         hid_record: Some(path),
         ..Config::default()
      };
      assert_eq!(config.read_records().unwrap(), (Some(vec![0x35, 0x00]), None));

      let request = config.activation().unwrap();
      assert_eq!(request.peer, Address::any());
      assert_eq!(request.hid_record, Some(vec![0x35, 0x00]));
      assert_eq!(request.flush_timeout, FLUSH_TIMEOUT_INFINITE);
   }
}
