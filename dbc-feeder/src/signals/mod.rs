//! Signal database and DBC parser
//!
//! This module contains the DBC file parser and the unified signal database
//! shared by the decoder, the encoder and the mapper.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    BitLayout, ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition, ValueType,
};

use crate::types::Result;
use std::path::Path;

/// Load one or more DBC files into a single database
///
/// Files are loaded in order; a frame ID defined by an earlier file takes
/// precedence over a later definition.
pub fn load_database<P: AsRef<Path>>(paths: &[P], strict: bool) -> Result<SignalDatabase> {
    let mut database = SignalDatabase::new();

    for path in paths {
        for message in dbc::parse_dbc_file(path.as_ref(), strict)? {
            database.add_message(message);
        }
    }

    let stats = database.stats();
    log::info!(
        "Signal database ready: {} messages, {} signals from {} file(s)",
        stats.num_messages,
        stats.num_signals,
        paths.len()
    );

    Ok(database)
}
