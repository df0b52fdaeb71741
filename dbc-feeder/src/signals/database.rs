//! Signal database
//!
//! Message and signal definitions gathered from every loaded DBC file,
//! looked up by frame id, message name or signal name.

use std::collections::HashMap;

/// One DBC message (`BO_`) with its signals
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// Frame id with the DBC extended-frame flag (bit 31) cleared
    pub id: u32,
    pub is_extended: bool,
    pub name: String,
    /// Declared payload length in bytes
    pub size: usize,
    pub sender: Option<String>,
    pub signals: Vec<SignalDefinition>,
    pub is_multiplexed: bool,
    /// Name of the switch signal (`M`), if any
    pub multiplexer_signal: Option<String>,
    /// DBC file the message was read from
    pub source: String,
}

impl MessageDefinition {
    /// Signal of this message called `name`
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Signals whose layout extends beyond the declared message size
    pub fn oversized_signals(&self) -> Vec<&SignalDefinition> {
        self.signals
            .iter()
            .filter(|s| s.required_bytes() > self.size)
            .collect()
    }
}

/// One DBC signal (`SG_`)
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    pub name: String,
    /// LSB for Intel signals, MSB for Motorola signals
    pub start_bit: u16,
    pub length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// `physical = raw * factor + offset`
    pub factor: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    pub unit: Option<String>,
    /// `VAL_` entries: raw value to label
    pub value_table: Option<HashMap<i64, String>>,
    /// Set for signals that are only present for some multiplexer values
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// False for `[0|0]`, which DBC files use to mean "no declared range"
    pub fn has_range(&self) -> bool {
        self.min < self.max
    }

    /// Whether `value` lies within the declared physical range, if any
    pub fn in_range(&self, value: f64) -> bool {
        !self.has_range() || (value >= self.min && value <= self.max)
    }

    /// Raw value whose value-table label is `label`
    pub fn raw_for_label(&self, label: &str) -> Option<i64> {
        self.value_table.as_ref().and_then(|table| {
            table
                .iter()
                .find(|(_, description)| description.as_str() == label)
                .map(|(raw, _)| *raw)
        })
    }

    /// Payload bit positions occupied by the signal, MSB first
    ///
    /// Positions use the DBC numbering: bit `n` is bit `n % 8` of byte `n / 8`.
    pub fn bit_layout(&self) -> BitLayout {
        let length = usize::from(self.length);
        let start = usize::from(self.start_bit);
        let msb = match self.byte_order {
            ByteOrder::LittleEndian => (start + length).saturating_sub(1),
            ByteOrder::BigEndian => start,
        };
        BitLayout {
            next: msb,
            remaining: length,
            byte_order: self.byte_order,
        }
    }

    /// Smallest payload length that holds every bit of the signal
    pub fn required_bytes(&self) -> usize {
        self.bit_layout().max().map_or(0, |pos| pos / 8 + 1)
    }
}

/// Iterator over the payload bit positions of one signal
#[derive(Debug, Clone)]
pub struct BitLayout {
    next: usize,
    remaining: usize,
    byte_order: ByteOrder,
}

impl Iterator for BitLayout {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        if self.remaining > 0 {
            // Motorola signals continue at bit 7 of the following byte
            self.next = match self.byte_order {
                ByteOrder::BigEndian if current % 8 == 0 => current + 15,
                _ => current - 1,
            };
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BitLayout {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Intel (`@1`)
    LittleEndian,
    /// Motorola (`@0`)
    BigEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Switch signal and switch values under which a signal is present
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    pub multiplexer_signal: String,
    pub multiplexer_values: Vec<u64>,
}

/// Every message known to the feeder
#[derive(Debug, Default)]
pub struct SignalDatabase {
    /// Load order is kept; the maps below index into it
    messages: Vec<MessageDefinition>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
    /// Signal name to every message carrying a signal of that name
    signal_lookup: HashMap<String, Vec<usize>>,
}

impl SignalDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message
    ///
    /// A message whose ID is already known replaces nothing: the first
    /// definition loaded wins and the duplicate is reported.
    pub fn add_message(&mut self, message: MessageDefinition) {
        if let Some(&existing) = self.by_id.get(&message.id) {
            log::warn!(
                "Ignoring duplicate definition of frame 0x{:X} ({} from {}), keeping {} from {}",
                message.id,
                message.name,
                message.source,
                self.messages[existing].name,
                self.messages[existing].source
            );
            return;
        }

        let idx = self.messages.len();

        for signal in &message.signals {
            self.signal_lookup
                .entry(signal.name.clone())
                .or_default()
                .push(idx);
        }

        self.by_id.insert(message.id, idx);
        self.by_name.insert(message.name.clone(), idx);
        self.messages.push(message);
    }

    /// Message sent with frame id `can_id`
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.by_id.get(&can_id).map(|&idx| &self.messages[idx])
    }

    pub fn get_message_by_name(&self, message_name: &str) -> Option<&MessageDefinition> {
        self.by_name.get(message_name).map(|&idx| &self.messages[idx])
    }

    /// Messages carrying a signal called `signal_name`
    pub fn messages_with_signal(&self, signal_name: &str) -> Vec<&MessageDefinition> {
        self.signal_lookup
            .get(signal_name)
            .map(|indices| indices.iter().map(|&idx| &self.messages[idx]).collect())
            .unwrap_or_default()
    }

    /// First message carrying `signal_name`, with the signal itself
    pub fn find_signal(&self, signal_name: &str) -> Option<(&MessageDefinition, &SignalDefinition)> {
        self.messages_with_signal(signal_name)
            .into_iter()
            .find_map(|msg| msg.signal(signal_name).map(|sig| (msg, sig)))
    }

    /// All messages in load order
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.iter()
    }

    /// Message and signal counts
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|msg| msg.signals.len()).sum(),
        }
    }

    /// Known frame ids, ascending
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub num_messages: usize,
    pub num_signals: usize,
}
