//! Configuration management for the transport.
//!
//! Ring capacities, the ACL buffer pool size and the fragment tolerance
//! policy are read from a TOML file. Missing keys fall back to the values
//! used by the production firmware layout.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Main configuration structure for a transport session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub rings: RingSizes,

   #[serde(default = "default_acl_tx_buffers")]
   pub acl_tx_buffers: usize,

   #[serde(default = "default_connection_table_size")]
   pub connection_table_size: usize,

   #[serde(default = "default_sync_timeout_ms")]
   pub sync_timeout_ms: u64,

   #[serde(default = "default_tolerate_fragment_overrun")]
   pub tolerate_fragment_overrun: bool,

   #[serde(default)]
   pub nonblocking: bool,
}

/// Capacity of every transfer ring, in descriptors.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RingSizes {
   #[serde(default = "default_command_ring")]
   pub command: usize,
   #[serde(default = "default_event_ring")]
   pub event: usize,
   #[serde(default = "default_acl_ring")]
   pub acl_rx: usize,
   #[serde(default = "default_acl_ring")]
   pub acl_tx: usize,
   #[serde(default = "default_acl_ring")]
   pub acl_free: usize,
   #[serde(default = "default_avdtp_ring")]
   pub avdtp: usize,
   #[serde(default = "default_iq_report_ring")]
   pub iq_report: usize,
}

const fn default_command_ring() -> usize {
   8
}

const fn default_event_ring() -> usize {
   32
}

const fn default_acl_ring() -> usize {
   32
}

const fn default_avdtp_ring() -> usize {
   16
}

const fn default_iq_report_ring() -> usize {
   8
}

const fn default_acl_tx_buffers() -> usize {
   default_acl_ring() - 2
}

const fn default_connection_table_size() -> usize {
   0x1000
}

const fn default_sync_timeout_ms() -> u64 {
   1000
}

const fn default_tolerate_fragment_overrun() -> bool {
   true
}

impl Default for RingSizes {
   fn default() -> Self {
      Self {
         command: default_command_ring(),
         event: default_event_ring(),
         acl_rx: default_acl_ring(),
         acl_tx: default_acl_ring(),
         acl_free: default_acl_ring(),
         avdtp: default_avdtp_ring(),
         iq_report: default_iq_report_ring(),
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         rings: RingSizes::default(),
         acl_tx_buffers: default_acl_tx_buffers(),
         connection_table_size: default_connection_table_size(),
         sync_timeout_ms: default_sync_timeout_ms(),
         tolerate_fragment_overrun: default_tolerate_fragment_overrun(),
         nonblocking: false,
      }
   }
}

impl Config {
   /// Loads configuration from the default location, or defaults if absent.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         Ok(Self::default())
      }
   }

   /// Loads and validates configuration from a specific file.
   pub fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Self::from_toml_str(&contents)
   }

   /// Parses and validates configuration from TOML text.
   pub fn from_toml_str(contents: &str) -> Result<Self> {
      let config: Self = toml::from_str(contents)?;
      config.validate()?;
      Ok(config)
   }

   /// Saves the configuration to the given file.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   /// Checks that the layout can actually be built.
   pub fn validate(&self) -> Result<()> {
      let r = &self.rings;
      let sizes = [r.command, r.event, r.acl_rx, r.acl_tx, r.acl_free, r.avdtp, r.iq_report];
      if sizes.iter().any(|&n| n < 2) {
         return Err(TransportError::InvalidConfig("ring capacity must be at least 2"));
      }
      if sizes.iter().any(|&n| n > u32::MAX as usize) {
         return Err(TransportError::InvalidConfig("ring capacity does not fit an index"));
      }
      // Buffer indices travel as a single byte.
      if self.acl_tx_buffers == 0 || self.acl_tx_buffers > 256 {
         return Err(TransportError::InvalidConfig("acl_tx_buffers must be in 1..=256"));
      }
      if self.connection_table_size == 0 || self.connection_table_size > 0x1000 {
         return Err(TransportError::InvalidConfig(
            "connection_table_size must be in 1..=4096",
         ));
      }
      Ok(())
   }

   /// Sync helper wait bound.
   pub const fn sync_timeout(&self) -> Duration {
      Duration::from_millis(self.sync_timeout_ms)
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(path) = env::var("BSMHCP_CONFIG") {
         return Ok(PathBuf::from(path));
      }
      let config_dir = dirs::config_dir().ok_or(TransportError::ConfigDirNotFound)?;
      Ok(config_dir.join("bsmhcp").join("config.toml"))
   }
}
