//! DBC import
//!
//! Reads Vector DBC files through `can-dbc` and converts them into
//! [`MessageDefinition`]s, including value tables and multiplexing.

use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{FeederError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Bit 31 of a DBC message id marks an extended frame
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;
const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// Load every message of one DBC file
///
/// With `strict` set, a message declaring a signal that does not fit into
/// the declared message size rejects the whole file. Otherwise the mismatch
/// is logged and the message is kept.
pub fn parse_dbc_file(path: &Path, strict: bool) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path)
        .map_err(|e| FeederError::DbcParse(format!("Cannot read {:?}: {}", path, e)))?;
    // Files exported on Windows are often Latin-1; every byte maps to one char
    let text = String::from_utf8(bytes).unwrap_or_else(|e| {
        log::warn!("{:?} is not valid UTF-8, reading it as Latin-1", path);
        e.into_bytes().into_iter().map(char::from).collect()
    });

    let source = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown.dbc".to_string());
    let messages = parse_dbc_str(&text, &source, strict)?;

    log::info!("{} messages defined in {}", messages.len(), source);
    Ok(messages)
}

/// Parse DBC text; `source` names it in messages and errors
pub fn parse_dbc_str(content: &str, source: &str, strict: bool) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| FeederError::DbcParse(format!("{} is not a valid DBC file: {:?}", source, e)))?;

    dbc.messages()
        .iter()
        .map(|msg| {
            let message = convert_message(&dbc, msg, source)?;
            check_layout(&message, strict)?;
            Ok(message)
        })
        .collect()
}

fn check_layout(message: &MessageDefinition, strict: bool) -> Result<()> {
    let oversized: Vec<&str> = message
        .oversized_signals()
        .into_iter()
        .map(|signal| signal.name.as_str())
        .collect();
    if oversized.is_empty() {
        return Ok(());
    }

    let problem = format!(
        "{} (0x{:X}) is {} bytes long, too short for {:?}",
        message.name, message.id, message.size, oversized
    );
    if strict {
        return Err(FeederError::DbcParse(problem));
    }
    log::warn!("{}; keeping it anyway", problem);
    Ok(())
}

fn convert_message(
    dbc: &can_dbc::DBC,
    msg: &can_dbc::Message,
    source: &str,
) -> Result<MessageDefinition> {
    let switch = msg
        .signals()
        .iter()
        .find(|sig| matches!(sig.multiplexer_indicator(), can_dbc::MultiplexIndicator::Multiplexor))
        .map(|sig| sig.name().clone());
    let has_muxed = msg.signals().iter().any(|sig| {
        matches!(
            sig.multiplexer_indicator(),
            can_dbc::MultiplexIndicator::MultiplexedSignal(_)
        )
    });

    let signals = msg
        .signals()
        .iter()
        .map(|sig| {
            let labels = dbc
                .value_descriptions_for_signal(*msg.message_id(), sig.name())
                .map(|descriptions| {
                    descriptions
                        .iter()
                        .map(|d| (*d.a() as i64, d.b().clone()))
                        .collect::<HashMap<_, _>>()
                })
                .filter(|table| !table.is_empty());
            convert_signal(sig, switch.as_deref(), labels)
        })
        .collect::<Result<Vec<_>>>()?;

    let raw_id = msg.message_id().0;
    let sender = match msg.transmitter() {
        can_dbc::Transmitter::NodeName(name) => Some(name.clone()),
        _ => None,
    };

    Ok(MessageDefinition {
        id: raw_id & EXTENDED_ID_MASK,
        is_extended: raw_id & EXTENDED_ID_FLAG != 0,
        name: msg.message_name().clone(),
        size: *msg.message_size() as usize,
        sender,
        signals,
        is_multiplexed: switch.is_some() || has_muxed,
        multiplexer_signal: switch,
        source: source.to_string(),
    })
}

fn convert_signal(
    sig: &can_dbc::Signal,
    switch: Option<&str>,
    value_table: Option<HashMap<i64, String>>,
) -> Result<SignalDefinition> {
    let multiplexer_info = match *sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(selector) => {
            let Some(switch) = switch else {
                return Err(FeederError::DbcParse(format!(
                    "Signal '{}' is multiplexed but its message has no multiplexer",
                    sig.name()
                )));
            };
            Some(MultiplexerInfo {
                multiplexer_signal: switch.to_string(),
                multiplexer_values: vec![selector],
            })
        }
        _ => None,
    };

    Ok(SignalDefinition {
        name: sig.name().clone(),
        start_bit: *sig.start_bit() as u16,
        length: *sig.signal_size() as u16,
        byte_order: match sig.byte_order() {
            can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
            can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
        },
        value_type: match sig.value_type() {
            can_dbc::ValueType::Signed => ValueType::Signed,
            can_dbc::ValueType::Unsigned => ValueType::Unsigned,
        },
        factor: *sig.factor(),
        offset: *sig.offset(),
        min: *sig.min(),
        max: *sig.max(),
        unit: Some(sig.unit().clone()).filter(|unit| !unit.is_empty()),
        value_table,
        multiplexer_info,
    })
}
