//! Frame payload decoding
//!
//! Turns a payload into signal values using a message definition: bits are
//! gathered along each signal's layout, multiplexed signals are filtered by
//! the current switch value and raw values are scaled to physical units.

use crate::signals::database::{MessageDefinition, SignalDefinition, ValueType};
use crate::types::SignalValue;

/// A message decoded from one frame payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Message name from the DBC
    pub name: String,
    /// Value of the multiplexer signal, for multiplexed messages
    pub multiplexer_value: Option<u64>,
    /// Every signal that was present in the payload
    pub signals: Vec<DecodedSignal>,
}

/// A single decoded signal
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    pub name: String,
    /// Reported value: value-table label, boolean, integer or scaled float
    pub value: SignalValue,
    /// Physical value (`raw * factor + offset`)
    pub physical: f64,
    /// Raw integer value after sign extension
    pub raw_value: i64,
}

pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every signal present in `data`
    ///
    /// Signals that do not fit in `data` are skipped. `None` when no signal
    /// of the message could be decoded.
    pub fn decode_message(data: &[u8], message_def: &MessageDefinition) -> Option<DecodedMessage> {
        let multiplexer_value = message_def
            .multiplexer_signal
            .as_deref()
            .filter(|_| message_def.is_multiplexed)
            .and_then(|name| message_def.signal(name))
            .and_then(|switch| Self::extract_signal_value(data, switch))
            .map(|raw| raw as u64);

        let signals: Vec<DecodedSignal> = message_def
            .signals
            .iter()
            .filter(|signal| match &signal.multiplexer_info {
                Some(mux) => multiplexer_value.is_some_and(|v| mux.multiplexer_values.contains(&v)),
                None => true,
            })
            .filter_map(|signal| Self::decode_signal(data, signal))
            .collect();

        if signals.is_empty() {
            return None;
        }
        Some(DecodedMessage {
            name: message_def.name.clone(),
            multiplexer_value,
            signals,
        })
    }

    /// Decode one signal, choosing how its value is reported
    pub fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        let raw_value = Self::extract_signal_value(data, signal)?;
        let physical = signal.offset + signal.factor * (raw_value as f64);

        let label = signal
            .value_table
            .as_ref()
            .and_then(|table| table.get(&raw_value))
            .cloned();

        let value = if let Some(label) = label {
            SignalValue::String(label)
        } else if signal.factor == 1.0 && signal.offset == 0.0 && signal.length == 1 {
            SignalValue::Boolean(raw_value != 0)
        } else if signal.factor != 1.0 || signal.offset != 0.0 {
            SignalValue::Float(physical)
        } else {
            SignalValue::Integer(raw_value)
        };

        Some(DecodedSignal {
            name: signal.name.clone(),
            value,
            physical,
            raw_value,
        })
    }

    /// Raw value of a signal, sign-extended for signed signals
    ///
    /// `None` if the signal does not fit into `data`.
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let length = u32::from(signal.length);
        if length == 0 || length > 64 {
            log::warn!("Signal '{}' has unsupported length {}", signal.name, length);
            return None;
        }

        let needed = signal.required_bytes();
        if needed > data.len() {
            log::debug!(
                "Skipping '{}': needs {} bytes, frame has {}",
                signal.name,
                needed,
                data.len()
            );
            return None;
        }

        let bits = signal
            .bit_layout()
            .fold(0u64, |acc, pos| (acc << 1) | u64::from((data[pos / 8] >> (pos % 8)) & 1));

        Some(match signal.value_type {
            ValueType::Unsigned => bits as i64,
            ValueType::Signed => {
                let unused = 64 - length;
                ((bits << unused) as i64) >> unused
            }
        })
    }
}
