//! SocketCAN bus handles (Linux only)
//!
//! Classic and CAN-FD sockets. The read side uses a socket read timeout so
//! the decoder thread never blocks longer than the requested wait.

use super::CanTransmitter;
use crate::formats::FrameSource;
use crate::types::{CanFrame, FeederError, Result};
use socketcan::{
    CanAnyFrame, CanFdFrame, CanFdSocket, CanFrame as SocketFrame, CanSocket, EmbeddedFrame,
    ExtendedId, Frame, Id, Socket, StandardId,
};
use std::io::ErrorKind;
use std::time::Duration;

const EFF_MASK: u32 = 0x1FFF_FFFF;

enum ReadSocket {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

/// Live frame source on a SocketCAN interface
pub struct SocketCanSource {
    interface: String,
    socket: Option<ReadSocket>,
    read_timeout: Option<Duration>,
}

impl SocketCanSource {
    /// Open `interface` (e.g. `can0`, `vcan0`) for reading
    pub fn open(interface: &str, fd_mode: bool) -> Result<Self> {
        let socket = if fd_mode {
            ReadSocket::Fd(CanFdSocket::open(interface).map_err(|e| open_error(interface, e))?)
        } else {
            ReadSocket::Classic(CanSocket::open(interface).map_err(|e| open_error(interface, e))?)
        };

        log::info!(
            "Listening on SocketCAN interface {} ({})",
            interface,
            if fd_mode { "CAN-FD" } else { "classic CAN" }
        );

        Ok(Self {
            interface: interface.to_string(),
            socket: Some(socket),
            read_timeout: None,
        })
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.read_timeout == Some(timeout) {
            return Ok(());
        }

        let result = match self.socket.as_ref() {
            Some(ReadSocket::Classic(socket)) => socket.set_read_timeout(timeout),
            Some(ReadSocket::Fd(socket)) => socket.set_read_timeout(timeout),
            None => return Ok(()),
        };
        result.map_err(|e| FeederError::Bus(format!("Failed to set read timeout on {}: {}", self.interface, e)))?;

        self.read_timeout = Some(timeout);
        Ok(())
    }
}

impl FrameSource for SocketCanSource {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        self.apply_timeout(timeout)?;

        let frame = match self.socket.as_ref() {
            Some(ReadSocket::Classic(socket)) => match socket.read_frame() {
                Ok(SocketFrame::Data(frame)) => Some(to_frame(&frame, false)),
                Ok(SocketFrame::Remote(_)) | Ok(SocketFrame::Error(_)) => None,
                Err(e) => return read_error(&self.interface, e),
            },
            Some(ReadSocket::Fd(socket)) => match socket.read_frame() {
                Ok(CanAnyFrame::Normal(frame)) => Some(to_frame(&frame, false)),
                Ok(CanAnyFrame::Fd(frame)) => Some(to_frame(&frame, true)),
                Ok(_) => None,
                Err(e) => return read_error(&self.interface, e),
            },
            None => {
                std::thread::sleep(timeout);
                None
            }
        };

        Ok(frame)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed SocketCAN interface {}", self.interface);
        }
    }
}

/// Live transmitter on a SocketCAN interface
pub struct SocketCanTransmitter {
    interface: String,
    classic: CanSocket,
    fd: Option<CanFdSocket>,
}

impl SocketCanTransmitter {
    /// Open `interface` for writing; FD mode allows payloads over 8 bytes
    pub fn open(interface: &str, fd_mode: bool) -> Result<Self> {
        let classic = CanSocket::open(interface).map_err(|e| open_error(interface, e))?;
        let fd = if fd_mode {
            Some(CanFdSocket::open(interface).map_err(|e| open_error(interface, e))?)
        } else {
            None
        };

        Ok(Self {
            interface: interface.to_string(),
            classic,
            fd,
        })
    }
}

impl CanTransmitter for SocketCanTransmitter {
    fn send(&mut self, frame_id: u32, data: &[u8]) -> Result<()> {
        let id = make_id(frame_id)?;

        let result = if data.len() > 8 {
            let socket = self.fd.as_ref().ok_or_else(|| {
                FeederError::Bus(format!(
                    "Frame 0x{:X} carries {} bytes but {} is not open in CAN-FD mode",
                    frame_id,
                    data.len(),
                    self.interface
                ))
            })?;
            let frame = CanFdFrame::new(id, data)
                .ok_or_else(|| FeederError::Bus(format!("Invalid CAN-FD payload for 0x{:X}", frame_id)))?;
            socket.write_frame(&frame)
        } else {
            let frame = SocketFrame::new(id, data)
                .ok_or_else(|| FeederError::Bus(format!("Invalid payload for 0x{:X}", frame_id)))?;
            self.classic.write_frame(&frame)
        };

        result.map_err(|e| FeederError::Bus(format!("Failed to send 0x{:X} on {}: {}", frame_id, self.interface, e)))?;
        log::trace!("Sent frame 0x{:X} ({} bytes) on {}", frame_id, data.len(), self.interface);
        Ok(())
    }
}

fn make_id(frame_id: u32) -> Result<Id> {
    let id = if frame_id > 0x7FF {
        ExtendedId::new(frame_id & EFF_MASK).map(Id::Extended)
    } else {
        StandardId::new(frame_id as u16).map(Id::Standard)
    };
    id.ok_or_else(|| FeederError::Bus(format!("Invalid CAN ID 0x{:X}", frame_id)))
}

fn to_frame<F: Frame>(frame: &F, is_fd: bool) -> CanFrame {
    CanFrame::new(frame.raw_id() & EFF_MASK, frame.data())
        .with_extended(frame.is_extended())
        .with_fd(is_fd)
}

fn open_error(interface: &str, e: std::io::Error) -> FeederError {
    FeederError::Bus(format!("Failed to open CAN interface '{}': {}", interface, e))
}

fn read_error(interface: &str, e: std::io::Error) -> Result<Option<CanFrame>> {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(None),
        _ => Err(FeederError::Bus(format!("Failed to read from {}: {}", interface, e))),
    }
}
