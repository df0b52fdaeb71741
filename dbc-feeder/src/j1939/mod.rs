//! SAE J1939 support
//!
//! Splits 29-bit identifiers into priority, PGN and addresses, and
//! reassembles multi-packet messages carried by the transport protocol.

pub mod transport;

pub use transport::{TransportReassembler, TP_CM_PGN, TP_DT_PGN};

/// Destination address meaning "all nodes"
pub const GLOBAL_ADDRESS: u8 = 0xFF;

/// Fields of a J1939 29-bit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Id {
    /// Message priority (0 = highest)
    pub priority: u8,
    /// Parameter group number
    pub pgn: u32,
    /// Sending node address
    pub source_address: u8,
    /// Target node address, `GLOBAL_ADDRESS` for broadcast (PDU2) groups
    pub destination_address: u8,
}

impl J1939Id {
    /// Decode a 29-bit arbitration ID
    pub fn from_can_id(can_id: u32) -> Self {
        let can_id = can_id & 0x1FFF_FFFF;
        let priority = ((can_id >> 26) & 0x07) as u8;
        let data_page = (can_id >> 24) & 0x03;
        let pdu_format = (can_id >> 16) & 0xFF;
        let pdu_specific = (can_id >> 8) & 0xFF;
        let source_address = (can_id & 0xFF) as u8;

        // PDU1 groups carry the destination in the PS field
        let (pgn, destination_address) = if pdu_format < 240 {
            ((data_page << 16) | (pdu_format << 8), pdu_specific as u8)
        } else {
            ((data_page << 16) | (pdu_format << 8) | pdu_specific, GLOBAL_ADDRESS)
        };

        Self {
            priority,
            pgn,
            source_address,
            destination_address,
        }
    }

    /// Build the arbitration ID for this priority, PGN and addresses
    pub fn to_can_id(&self) -> u32 {
        let pdu_format = (self.pgn >> 8) & 0xFF;
        let pgn = if pdu_format < 240 {
            (self.pgn & 0x3_FF00) | self.destination_address as u32
        } else {
            self.pgn & 0x3_FFFF
        };
        ((self.priority as u32 & 0x07) << 26) | (pgn << 8) | self.source_address as u32
    }
}

/// PGN of a DBC message ID that describes a J1939 group
pub fn pgn_of(can_id: u32) -> u32 {
    J1939Id::from_can_id(can_id).pgn
}
