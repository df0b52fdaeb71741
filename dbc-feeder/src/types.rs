//! Core types for the DBC feeder library
//!
//! This module defines the values that travel through the feeder: raw CAN
//! frames coming off the bus, decoded signal observations waiting in the
//! queue, and the signal values exchanged with the VSS backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type used throughout the feeder
pub type Timestamp = DateTime<Utc>;

/// Result type for feeder operations
pub type Result<T> = std::result::Result<T, FeederError>;

/// A frame read from the bus or from a candump log
#[derive(Debug, Clone, PartialEq)]
pub struct CanFrame {
    /// Reception time, nanoseconds since the Unix epoch
    pub timestamp_ns: u64,
    /// Arbitration id without EFF/RTR/ERR flag bits
    pub can_id: u32,
    /// Payload, up to 8 bytes (64 with CAN-FD)
    pub data: Vec<u8>,
    pub is_extended: bool,
    pub is_fd: bool,
    pub is_error_frame: bool,
    pub is_remote_frame: bool,
}

impl CanFrame {
    /// Create a classic data frame stamped with the current time
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        let timestamp_ns = now
            .timestamp_nanos_opt()
            .map(|ns| ns.max(0) as u64)
            .unwrap_or_default();

        Self {
            timestamp_ns,
            can_id,
            data: data.into(),
            is_extended: can_id > 0x7FF,
            is_fd: false,
            is_error_frame: false,
            is_remote_frame: false,
        }
    }

    /// Override the id-based guess of the frame format
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.is_extended = extended;
        self
    }

    pub fn with_fd(mut self, fd: bool) -> Self {
        self.is_fd = fd;
        self
    }

    /// Reception time as a UTC timestamp
    pub fn timestamp(&self) -> Timestamp {
        i64::try_from(self.timestamp_ns)
            .map(DateTime::from_timestamp_nanos)
            .unwrap_or_else(|_| Utc::now())
    }
}

/// Errors that can occur while feeding
#[derive(Debug, thiserror::Error)]
pub enum FeederError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Feeder is already running")]
    AlreadyRunning,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Failed to parse mapping definitions: {0}")]
    MappingParse(String),

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] crate::message_encoder::EncodeError),

    #[error("No dbc2vss mapping for signal '{0}'")]
    UnmappedSignal(String),

    #[error("VSS paths not registered in backend: {}", .0.join(", "))]
    Registration(Vec<String>),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("CAN bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A signal value, used both for decoded CAN signals and VSS datapoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Boolean(bool),
    Integer(i64),
    /// Scaled physical value
    Float(f64),
    /// Text, e.g. a DBC value-table label
    String(String),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Boolean(b) => fmt::Display::fmt(b, f),
            SignalValue::Integer(i) => fmt::Display::fmt(i, f),
            SignalValue::Float(x) => fmt::Display::fmt(x, f),
            SignalValue::String(text) => f.write_str(text),
        }
    }
}

impl SignalValue {
    /// Numeric view of the value; booleans count as 0 and 1
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Integer(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
            SignalValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            SignalValue::String(_) => None,
        }
    }

    /// Integer view of the value; floats are truncated
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SignalValue::Integer(v) => Some(*v),
            SignalValue::Float(v) => Some(v.trunc() as i64),
            SignalValue::Boolean(v) => Some(i64::from(*v)),
            SignalValue::String(_) => None,
        }
    }

    /// Interpret the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Boolean(v) => Some(*v),
            SignalValue::Integer(v) => Some(*v != 0),
            SignalValue::Float(v) => Some(*v != 0.0),
            SignalValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }

    /// Everything but text counts as numeric
    pub fn is_numeric(&self) -> bool {
        !matches!(self, SignalValue::String(_))
    }

    /// Name of the variant, for log messages
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalValue::Boolean(_) => "bool",
            SignalValue::Integer(_) => "int",
            SignalValue::Float(_) => "float",
            SignalValue::String(_) => "string",
        }
    }

    /// Compare two values, treating numbers of different variants as equal
    /// when they denote the same quantity
    pub fn same_as(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (SignalValue::String(a), SignalValue::String(b)) => a == b,
            (SignalValue::String(_), _) | (_, SignalValue::String(_)) => false,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self {
        SignalValue::Boolean(v)
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        SignalValue::Integer(v)
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Float(v)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        SignalValue::String(v.to_string())
    }
}

/// A decoded signal value waiting in the queue for the receiver pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct SignalObservation {
    /// Name of the DBC message the signal was decoded from
    pub message_name: String,
    /// DBC signal name
    pub signal_name: String,
    /// VSS path the signal is mapped to
    pub vss_path: String,
    /// Decoded (physical) value before the mapping transform
    pub raw_value: SignalValue,
    /// Time the frame was received
    pub timestamp: Timestamp,
}
