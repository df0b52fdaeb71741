//! Frame payload encoding
//!
//! The inverse of the decoder: packs physical signal values into a frame
//! payload according to the message definition.

use crate::signals::database::{MessageDefinition, SignalDefinition, ValueType};
use crate::types::SignalValue;
use std::collections::HashMap;

/// Errors raised while encoding a message
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("message {message} requires signal '{signal}' but no value is available")]
    MissingSignal { message: String, signal: String },

    #[error("value {value} for signal '{signal}' is outside its range")]
    ValueOutOfRange { signal: String, value: f64 },

    #[error("signal '{signal}' has no value-table entry '{label}'")]
    UnknownLabel { signal: String, label: String },

    #[error("signal '{signal}' cannot carry a {kind} value")]
    UnsupportedValue { signal: String, kind: &'static str },
}

/// Message encoder - packs signal values into CAN payloads
pub struct MessageEncoder;

impl MessageEncoder {
    /// Encode every signal of a message into a payload of the declared size
    ///
    /// All signals must be present in `values`, except multiplexed signals
    /// whose switch value is not selected.
    pub fn encode_message(
        message_def: &MessageDefinition,
        values: &HashMap<String, SignalValue>,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut data = vec![0u8; message_def.size];

        let multiplexer_value = match message_def.multiplexer_signal.as_deref() {
            Some(mux_name) => {
                let mux_signal = message_def.signal(mux_name).ok_or_else(|| EncodeError::MissingSignal {
                    message: message_def.name.clone(),
                    signal: mux_name.to_string(),
                })?;
                let value = Self::lookup(message_def, values, mux_name)?;
                Some(Self::raw_value(mux_signal, value)? as u64)
            }
            None => None,
        };

        for signal in &message_def.signals {
            if let Some(ref mux_info) = signal.multiplexer_info {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            let value = Self::lookup(message_def, values, &signal.name)?;
            let raw = Self::raw_value(signal, value)?;
            Self::insert_signal(&mut data, signal, raw);
        }

        Ok(data)
    }

    fn lookup<'a>(
        message_def: &MessageDefinition,
        values: &'a HashMap<String, SignalValue>,
        signal: &str,
    ) -> Result<&'a SignalValue, EncodeError> {
        values.get(signal).ok_or_else(|| EncodeError::MissingSignal {
            message: message_def.name.clone(),
            signal: signal.to_string(),
        })
    }

    /// Convert a physical value into the raw integer stored in the frame
    fn raw_value(signal: &SignalDefinition, value: &SignalValue) -> Result<i64, EncodeError> {
        let physical = match value {
            SignalValue::String(label) => {
                let raw = signal.raw_for_label(label).ok_or_else(|| EncodeError::UnknownLabel {
                    signal: signal.name.clone(),
                    label: label.clone(),
                })?;
                return Self::check_width(signal, raw);
            }
            other => other.as_f64().ok_or(EncodeError::UnsupportedValue {
                signal: signal.name.clone(),
                kind: other.type_name(),
            })?,
        };

        if !physical.is_finite() || !signal.in_range(physical) {
            return Err(EncodeError::ValueOutOfRange {
                signal: signal.name.clone(),
                value: physical,
            });
        }

        let factor = if signal.factor == 0.0 { 1.0 } else { signal.factor };
        let raw = ((physical - signal.offset) / factor).round() as i64;
        Self::check_width(signal, raw)
    }

    /// Reject raw values that do not fit into the signal's bit length
    fn check_width(signal: &SignalDefinition, raw: i64) -> Result<i64, EncodeError> {
        let length = u32::from(signal.length.min(64));
        let fits = match signal.value_type {
            ValueType::Unsigned => raw >= 0 && (length >= 63 || raw < (1i64 << length)),
            ValueType::Signed if length >= 64 => true,
            ValueType::Signed => {
                length > 0 && {
                    let half = 1i64 << (length - 1);
                    raw >= -half && raw < half
                }
            }
        };

        if fits {
            Ok(raw)
        } else {
            Err(EncodeError::ValueOutOfRange {
                signal: signal.name.clone(),
                value: raw as f64,
            })
        }
    }

    /// Write a raw value into the payload along the signal's bit layout
    fn insert_signal(data: &mut [u8], signal: &SignalDefinition, raw: i64) {
        let bits = raw as u64;
        let mut layout = signal.bit_layout();
        while let Some(pos) = layout.next() {
            // `len()` is now the number of less significant bits still to come
            set_bit(data, pos, (bits >> layout.len()) & 1 == 1);
        }
    }
}

fn set_bit(data: &mut [u8], bit_pos: usize, value: bool) {
    if let Some(byte) = data.get_mut(bit_pos / 8) {
        let mask = 1u8 << (bit_pos % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}
