//! J1939 transport protocol (TP.CM / TP.DT) reassembly
//!
//! Messages longer than 8 bytes are announced by a connection management
//! frame (BAM for broadcasts, RTS for point-to-point transfers) and then
//! carried in numbered data transfer frames of 7 payload bytes each.
//! The reassembler only listens; it never answers RTS with CTS.

use super::J1939Id;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::time::Duration;

/// Connection management PGN
pub const TP_CM_PGN: u32 = 0xEC00;

/// Data transfer PGN
pub const TP_DT_PGN: u32 = 0xEB00;

const CONTROL_RTS: u8 = 0x10;
const CONTROL_BAM: u8 = 0x20;
const CONTROL_ABORT: u8 = 0xFF;

/// Payload bytes per TP.DT packet
const PACKET_PAYLOAD: usize = 7;

/// Default time allowed between two packets of one transfer (J1939-21 T1)
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_millis(750);

/// A multi-packet message put back together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    /// PGN of the transported message
    pub pgn: u32,
    pub source_address: u8,
    pub destination_address: u8,
    /// Payload, truncated to the announced size
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    pgn: u32,
    total_size: usize,
    total_packets: u8,
    next_sequence: u8,
    data: Vec<u8>,
    last_activity_ns: u64,
}

/// Tracks open transport sessions, keyed by (source, destination)
#[derive(Debug)]
pub struct TransportReassembler {
    sessions: HashMap<(u8, u8), Session>,
    timeout: Duration,
}

impl Default for TransportReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportReassembler {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            timeout: DEFAULT_PACKET_TIMEOUT,
        }
    }

    /// Builder method: set the inter-packet timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of transfers in progress
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Feed a frame; returns the transported message once its last packet
    /// arrives
    ///
    /// Frames that are neither TP.CM nor TP.DT are ignored.
    pub fn handle_frame(
        &mut self,
        id: &J1939Id,
        data: &[u8],
        timestamp_ns: u64,
    ) -> Option<ReassembledMessage> {
        self.expire(timestamp_ns);

        match id.pgn {
            TP_CM_PGN => {
                self.handle_connection_management(id, data, timestamp_ns);
                None
            }
            TP_DT_PGN => self.handle_data_transfer(id, data, timestamp_ns),
            _ => None,
        }
    }

    fn handle_connection_management(&mut self, id: &J1939Id, data: &[u8], timestamp_ns: u64) {
        if data.len() < 8 {
            log::debug!("Ignoring short TP.CM frame from 0x{:02X}", id.source_address);
            return;
        }

        let key = (id.source_address, id.destination_address);
        let pgn = LittleEndian::read_u24(&data[5..8]);

        match data[0] {
            CONTROL_BAM | CONTROL_RTS => {
                let total_size = LittleEndian::read_u16(&data[1..3]) as usize;
                let total_packets = data[3];
                if total_packets == 0 || total_size > total_packets as usize * PACKET_PAYLOAD {
                    log::warn!(
                        "Invalid TP.CM announcement from 0x{:02X}: {} bytes in {} packets",
                        id.source_address,
                        total_size,
                        total_packets
                    );
                    return;
                }

                if let Some(previous) = self.sessions.get(&key) {
                    log::debug!(
                        "TP session 0x{:02X}->0x{:02X} for PGN 0x{:X} replaced before completion",
                        key.0,
                        key.1,
                        previous.pgn
                    );
                }

                log::trace!(
                    "TP session 0x{:02X}->0x{:02X} opened: PGN 0x{:X}, {} bytes",
                    key.0,
                    key.1,
                    pgn,
                    total_size
                );
                self.sessions.insert(
                    key,
                    Session {
                        pgn,
                        total_size,
                        total_packets,
                        next_sequence: 1,
                        data: Vec::with_capacity(total_packets as usize * PACKET_PAYLOAD),
                        last_activity_ns: timestamp_ns,
                    },
                );
            }
            CONTROL_ABORT => {
                if self.sessions.remove(&key).is_some() {
                    log::debug!("TP session 0x{:02X}->0x{:02X} aborted (PGN 0x{:X})", key.0, key.1, pgn);
                }
            }
            _ => {}
        }
    }

    fn handle_data_transfer(
        &mut self,
        id: &J1939Id,
        data: &[u8],
        timestamp_ns: u64,
    ) -> Option<ReassembledMessage> {
        let key = (id.source_address, id.destination_address);
        let session = self.sessions.get_mut(&key)?;

        if data.is_empty() || data[0] != session.next_sequence {
            log::warn!(
                "TP session 0x{:02X}->0x{:02X}: expected packet {}, got {:?}; dropping transfer",
                key.0,
                key.1,
                session.next_sequence,
                data.first()
            );
            self.sessions.remove(&key);
            return None;
        }

        session.data.extend_from_slice(&data[1..]);
        session.last_activity_ns = timestamp_ns;

        if session.next_sequence < session.total_packets {
            session.next_sequence += 1;
            return None;
        }

        let mut session = self.sessions.remove(&key)?;
        if session.data.len() < session.total_size {
            log::warn!(
                "TP transfer for PGN 0x{:X} ended with {} of {} bytes",
                session.pgn,
                session.data.len(),
                session.total_size
            );
            return None;
        }
        session.data.truncate(session.total_size);

        Some(ReassembledMessage {
            pgn: session.pgn,
            source_address: key.0,
            destination_address: key.1,
            data: session.data,
        })
    }

    /// Drop sessions that have been idle for longer than the timeout
    fn expire(&mut self, now_ns: u64) {
        let timeout_ns = self.timeout.as_nanos() as u64;
        self.sessions.retain(|key, session| {
            let alive = now_ns.saturating_sub(session.last_activity_ns) <= timeout_ns;
            if !alive {
                log::debug!(
                    "TP session 0x{:02X}->0x{:02X} for PGN 0x{:X} timed out",
                    key.0,
                    key.1,
                    session.pgn
                );
            }
            alive
        });
    }
}
