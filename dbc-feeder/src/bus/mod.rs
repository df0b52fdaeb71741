//! CAN bus access
//!
//! Bundles the frame source read by the decoder with the transmitter used
//! by the vss2dbc pipeline. The two handles are independent so that each
//! pipeline owns its side of the bus.

use crate::formats::{CandumpReplay, FrameSource};
use crate::types::{CanFrame, FeederError, Result};
use crossbeam_channel::Sender;
use std::path::Path;

#[cfg(target_os = "linux")]
pub mod socketcan;

/// Anything that can put a frame on the bus
pub trait CanTransmitter: Send {
    /// Send `data` with the given arbitration ID
    fn send(&mut self, frame_id: u32, data: &[u8]) -> Result<()>;
}

/// Transmitter handing frames to another component through a channel
pub struct ChannelTransmitter {
    frames: Sender<CanFrame>,
}

impl ChannelTransmitter {
    pub fn new(frames: Sender<CanFrame>) -> Self {
        Self { frames }
    }
}

impl CanTransmitter for ChannelTransmitter {
    fn send(&mut self, frame_id: u32, data: &[u8]) -> Result<()> {
        self.frames
            .send(CanFrame::new(frame_id, data))
            .map_err(|_| FeederError::Bus("frame channel disconnected".to_string()))
    }
}

/// Both directions of a bus connection
pub struct Bus {
    /// Where the decoder reads frames from
    pub source: Box<dyn FrameSource>,
    /// Where the transmitter pipeline writes frames, if writing is possible
    pub transmitter: Option<Box<dyn CanTransmitter>>,
}

impl Bus {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            transmitter: None,
        }
    }

    /// Builder method: attach a transmitter
    pub fn with_transmitter(mut self, transmitter: Box<dyn CanTransmitter>) -> Self {
        self.transmitter = Some(transmitter);
        self
    }

    /// Open the bus described by a channel name or a dump file
    ///
    /// A dump file replaces the live bus for reading and leaves the bus
    /// without a transmitter.
    pub fn open(channel: &str, fd_mode: bool, replay_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = replay_file {
            log::info!("Replaying frames from {:?} instead of reading {}", path, channel);
            return Ok(Self::new(Box::new(CandumpReplay::open(path)?)));
        }

        Self::open_live(channel, fd_mode)
    }

    #[cfg(target_os = "linux")]
    fn open_live(channel: &str, fd_mode: bool) -> Result<Self> {
        let source = socketcan::SocketCanSource::open(channel, fd_mode)?;
        let transmitter = socketcan::SocketCanTransmitter::open(channel, fd_mode)?;
        Ok(Self::new(Box::new(source)).with_transmitter(Box::new(transmitter)))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_live(channel: &str, _fd_mode: bool) -> Result<Self> {
        Err(FeederError::Bus(format!(
            "Cannot open {}: SocketCAN is only available on Linux",
            channel
        )))
    }
}
