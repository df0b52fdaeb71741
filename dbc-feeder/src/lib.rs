//! DBC Feeder Library
//!
//! Moves signal values between a CAN bus and a VSS (Vehicle Signal
//! Specification) datapoint backend, using DBC files to describe the frames
//! and a VSS mapping file to connect DBC signals to VSS paths.
//!
//! # Architecture
//!
//! - **dbc2vss**: a reader thread decodes frames (plain DBC or SAE J1939),
//!   filters them and queues signal observations; the receiver pipeline
//!   transforms them and writes them to the backend
//! - **vss2dbc**: the transmitter pipeline subscribes to target values,
//!   maps them back to DBC signals, encodes the affected messages and sends
//!   them on the bus
//!
//! Live buses are read through SocketCAN; recorded candump logs can be
//! replayed instead.
//!
//! # Example Usage
//!
//! ```no_run
//! use dbc_feeder::backend::{create_client, BackendConfig, BackendKind};
//! use dbc_feeder::{Feeder, FeederConfig};
//!
//! let kind = BackendKind::LocalBroker;
//! let client = create_client(kind, &BackendConfig::default())?;
//! let feeder = Feeder::new(client, true, true);
//!
//! let config = FeederConfig::new("can0")
//!     .add_dbc_file("Model3CAN.dbc")
//!     .with_mapping_file("mapping/vss_4.0/vss_dbc.json")
//!     .with_default_values_file("dbc_default_values.json");
//!
//! // Blocks until feeder.stop() is called from another thread
//! feeder.start(&config)?;
//! # Ok::<(), dbc_feeder::FeederError>(())
//! ```

pub mod backend;
pub mod bus;
pub mod config;
pub mod decoder;
pub mod feeder;
pub mod formats;
pub mod j1939;
pub mod mapping;
pub mod message_decoder;
pub mod message_encoder;
pub mod shutdown;
pub mod signals;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendClient, BackendConfig, BackendKind, EntryUpdate};
pub use bus::{Bus, CanTransmitter};
pub use config::FeederConfig;
pub use decoder::DecodeMode;
pub use feeder::{ConnectionState, Feeder, FeederStats};
pub use formats::FrameSource;
pub use mapping::Mapper;
pub use message_encoder::EncodeError;
pub use shutdown::Shutdown;
pub use signals::{load_database, SignalDatabase};
pub use types::{CanFrame, FeederError, Result, SignalObservation, SignalValue, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
