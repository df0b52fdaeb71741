//! Frame sources
//!
//! A frame source hands raw CAN frames to the decoder, one at a time, with
//! a bounded wait so the reading thread can notice shutdown requests.

use crate::types::{CanFrame, FeederError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::Duration;

pub mod candump;

pub use candump::{parse_candump_line, CandumpReplay};

/// Common trait for everything that produces CAN frames
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame
    ///
    /// `Ok(None)` means no frame arrived in time; the caller simply asks
    /// again.
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Release the underlying handle
    fn close(&mut self) {}
}

/// Frame source fed through a channel by another component
pub struct ChannelFrameSource {
    frames: Receiver<CanFrame>,
}

impl ChannelFrameSource {
    pub fn new(frames: Receiver<CanFrame>) -> Self {
        Self { frames }
    }
}

impl FrameSource for ChannelFrameSource {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FeederError::Bus("frame channel disconnected".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_source() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut source = ChannelFrameSource::new(rx);

        tx.send(CanFrame::new(0x10, vec![1])).unwrap();
        let frame = source.receive(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(frame.can_id, 0x10);

        assert!(source.receive(Duration::from_millis(10)).unwrap().is_none());

        drop(tx);
        assert!(source.receive(Duration::from_millis(10)).is_err());
    }
}
