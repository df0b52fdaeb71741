//! Frame decoder thread
//!
//! The `CanReader` reads frames from a `FrameSource`, keeps only frames
//! carrying forward-mapped signals, decodes them with the DBC database and
//! queues one `SignalObservation` per mapped signal for the receiver
//! pipeline.

use crate::formats::FrameSource;
use crate::j1939::{pgn_of, J1939Id, TransportReassembler, TP_CM_PGN, TP_DT_PGN};
use crate::mapping::Mapper;
use crate::message_decoder::{DecodedMessage, MessageDecoder};
use crate::shutdown::Shutdown;
use crate::signals::MessageDefinition;
use crate::types::{CanFrame, SignalObservation, SignalValue, Timestamp};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long one read may block before the shutdown flag is checked again
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause after a failed read before trying again
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How frame identifiers are matched against the DBC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Plain CAN: frame ID equals the DBC message ID
    #[default]
    Dbc,
    /// SAE J1939: messages are matched by PGN, long messages reassembled
    J1939,
}

/// Decodes frames into queued signal observations
pub struct CanReader {
    mapper: Arc<Mapper>,
    mode: DecodeMode,
    queue: Sender<SignalObservation>,
    whitelist: HashSet<u32>,
    /// Key: PGN, Value: DBC message ID (J1939 mode only)
    pgn_index: HashMap<u32, u32>,
    reassembler: TransportReassembler,
}

impl CanReader {
    pub fn new(mapper: Arc<Mapper>, mode: DecodeMode, queue: Sender<SignalObservation>) -> Self {
        let whitelist: HashSet<u32> = mapper.frame_id_whitelist().into_iter().collect();
        log::info!("Using CAN frame ID whitelist: {:X?}", {
            let mut ids: Vec<&u32> = whitelist.iter().collect();
            ids.sort();
            ids
        });

        let pgn_index = match mode {
            DecodeMode::Dbc => HashMap::new(),
            DecodeMode::J1939 => whitelist
                .iter()
                .filter(|id| **id > 0x7FF)
                .map(|id| (pgn_of(*id), *id))
                .collect(),
        };

        Self {
            mapper,
            mode,
            queue,
            whitelist,
            pgn_index,
            reassembler: TransportReassembler::new(),
        }
    }

    /// Start reading on a dedicated thread
    ///
    /// The thread exits within one read timeout after `shutdown` triggers
    /// and closes the source before returning.
    pub fn spawn(self, source: Box<dyn FrameSource>, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("can-reader".to_string())
            .spawn(move || self.run(source, shutdown))
    }

    fn run(mut self, mut source: Box<dyn FrameSource>, shutdown: Shutdown) {
        log::info!("CAN reader started ({:?} mode)", self.mode);

        while !shutdown.is_triggered() {
            match source.receive(READ_TIMEOUT) {
                Ok(Some(frame)) => {
                    if self.process_frame(&frame).is_err() {
                        log::info!("Observation queue closed, stopping CAN reader");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Failed to read CAN frame: {}", e);
                    shutdown.wait(READ_RETRY_DELAY);
                }
            }
        }

        source.close();
        log::info!("CAN reader stopped");
    }

    /// Decode one frame and queue its mapped signals
    ///
    /// Returns the number of queued observations, or an error once the
    /// queue's consumer is gone.
    pub fn process_frame(&mut self, frame: &CanFrame) -> Result<usize, QueueClosed> {
        if frame.is_error_frame || frame.is_remote_frame {
            return Ok(0);
        }

        match self.mode {
            DecodeMode::J1939 if frame.is_extended => self.process_j1939(frame),
            _ => {
                if !self.whitelist.contains(&frame.can_id) {
                    return Ok(0);
                }
                self.decode_and_queue(frame.can_id, &frame.data, frame.timestamp())
            }
        }
    }

    fn process_j1939(&mut self, frame: &CanFrame) -> Result<usize, QueueClosed> {
        let id = J1939Id::from_can_id(frame.can_id);

        let (pgn, data) = match id.pgn {
            TP_CM_PGN | TP_DT_PGN => {
                match self.reassembler.handle_frame(&id, &frame.data, frame.timestamp_ns) {
                    Some(message) => {
                        log::trace!(
                            "Reassembled {} bytes of PGN 0x{:X} from 0x{:02X}",
                            message.data.len(),
                            message.pgn,
                            message.source_address
                        );
                        (message.pgn, message.data)
                    }
                    None => return Ok(0),
                }
            }
            pgn => (pgn, frame.data.clone()),
        };

        match self.pgn_index.get(&pgn) {
            Some(&message_id) => self.decode_and_queue(message_id, &data, frame.timestamp()),
            None => Ok(0),
        }
    }

    fn decode_and_queue(&self, message_id: u32, data: &[u8], timestamp: Timestamp) -> Result<usize, QueueClosed> {
        let Some(message) = self.mapper.database().get_message(message_id) else {
            return Ok(0);
        };

        let Some(decoded) = MessageDecoder::decode_message(data, message) else {
            log::debug!("Frame 0x{:X} carried none of the signals of {}", message_id, message.name);
            return Ok(0);
        };

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("Decoded message {}: {:?}", decoded.name, decoded.signals);
        }

        self.queue_signals(message, decoded, timestamp)
    }

    fn queue_signals(
        &self,
        message: &MessageDefinition,
        decoded: DecodedMessage,
        timestamp: Timestamp,
    ) -> Result<usize, QueueClosed> {
        let mut queued = 0;

        for signal in decoded.signals {
            let Some(rule) = self.mapper.forward_rule(&signal.name) else {
                continue;
            };

            // Out-of-range values usually mean "signal not available"
            if !matches!(signal.value, SignalValue::String(_)) {
                if let Some(definition) = message.signal(&signal.name) {
                    if !definition.in_range(signal.physical) {
                        log::debug!(
                            "Discarding out-of-range value [signal: {}, min: {}, max: {}, value: {}]",
                            signal.name,
                            definition.min,
                            definition.max,
                            signal.physical
                        );
                        continue;
                    }
                }
            }

            if !self.mapper.time_condition_fulfilled(rule, timestamp) {
                log::trace!("Ignoring {} for {}: interval not elapsed", signal.name, rule.vss_path);
                continue;
            }

            log::debug!("Queueing {}, triggered by {}, raw value {}", rule.vss_path, signal.name, signal.value);
            self.queue
                .send(SignalObservation {
                    message_name: message.name.clone(),
                    signal_name: signal.name,
                    vss_path: rule.vss_path.clone(),
                    raw_value: signal.value,
                    timestamp,
                })
                .map_err(|_| QueueClosed)?;
            queued += 1;
        }

        Ok(queued)
    }
}

/// The receiving end of the observation queue was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;
