//! Feeder configuration types
//!
//! Everything `Feeder::start` needs to build its pipelines: where the frames
//! come from, which DBC and mapping files describe them, and how strictly
//! the DBC files are checked.

use crate::decoder::DecodeMode;
use crate::types::{FeederError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one feeder run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederConfig {
    /// CAN interface name (e.g. `can0`, `vcan0`)
    pub bus_channel: String,

    /// Open the interface in CAN-FD mode
    #[serde(default)]
    pub fd_mode: bool,

    /// DBC files, loaded in order
    pub dbc_files: Vec<PathBuf>,

    /// VSS mapping file
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,

    /// Default signal values for vss2dbc encoding
    #[serde(default)]
    pub default_values_file: Option<PathBuf>,

    /// candump log replayed instead of reading the live bus
    #[serde(default)]
    pub replay_file: Option<PathBuf>,

    /// How frames are matched against the DBC
    #[serde(default)]
    pub decode_mode: DecodeMode,

    /// Reject DBC messages whose signals exceed the declared size
    #[serde(default = "default_true")]
    pub strict_parsing: bool,
}

fn default_true() -> bool {
    true
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("mapping/vss_4.0/vss_dbc.json")
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            bus_channel: "vcan0".to_string(),
            fd_mode: false,
            dbc_files: Vec::new(),
            mapping_file: default_mapping_file(),
            default_values_file: None,
            replay_file: None,
            decode_mode: DecodeMode::Dbc,
            strict_parsing: true,
        }
    }
}

impl FeederConfig {
    /// Create a configuration for a bus channel with default settings
    pub fn new(bus_channel: impl Into<String>) -> Self {
        Self {
            bus_channel: bus_channel.into(),
            ..Self::default()
        }
    }

    /// Builder method: add a DBC file
    pub fn add_dbc_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dbc_files.push(path.into());
        self
    }

    /// Builder method: set the mapping file
    pub fn with_mapping_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mapping_file = path.into();
        self
    }

    /// Builder method: set the default-value file
    pub fn with_default_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_values_file = Some(path.into());
        self
    }

    /// Builder method: replay a candump log instead of reading the bus
    pub fn with_replay_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.replay_file = Some(path.into());
        self
    }

    /// Builder method: enable or disable CAN-FD
    pub fn with_fd_mode(mut self, enabled: bool) -> Self {
        self.fd_mode = enabled;
        self
    }

    /// Builder method: set the decode mode
    pub fn with_decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    /// Builder method: strict or lax DBC layout checks
    pub fn with_strict_parsing(mut self, strict: bool) -> Self {
        self.strict_parsing = strict;
        self
    }

    /// Check the configuration for missing pieces
    pub fn validate(&self) -> Result<()> {
        if self.bus_channel.trim().is_empty() {
            return Err(FeederError::Configuration("No CAN port specified".to_string()));
        }
        if self.dbc_files.is_empty() {
            return Err(FeederError::Configuration("No DBC file specified".to_string()));
        }
        Ok(())
    }
}
