//! candump log replay
//!
//! Reads logs written by `candump -l` and plays them back with the original
//! inter-frame timing:
//!
//! ```text
//! (1436509052.249713) vcan0 044#2A366C2BBA
//! (1436509052.449847) vcan0 18FEF100##1112233
//! (1436509052.650004) vcan0 123#R
//! ```

use crate::formats::FrameSource;
use crate::types::{CanFrame, FeederError, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::{Duration, Instant};

/// Error frame flag in the candump identifier field
const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// A frame read from the log, with its recorded offset
#[derive(Debug, Clone)]
struct RecordedFrame {
    offset: Duration,
    frame: CanFrame,
}

/// Frame source replaying a candump log
pub struct CandumpReplay {
    frames: Vec<RecordedFrame>,
    position: usize,
    started: Instant,
    paced: bool,
    looping: bool,
}

impl CandumpReplay {
    /// Open a candump log file
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("Opening candump replay: {:?}", path);

        let file = File::open(path).map_err(|e| {
            FeederError::Configuration(format!("Failed to open dump file {:?}: {}", path, e))
        })?;
        let replay = Self::from_reader(file)?;

        log::info!("Loaded {} frames from {:?}", replay.len(), path);
        Ok(replay)
    }

    /// Read a log from any reader
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut frames = Vec::new();
        let mut first_timestamp: Option<f64> = None;

        for (line_no, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let Some((timestamp, frame)) = parse_candump_line(&line).map_err(|e| {
                FeederError::Configuration(format!("Dump file line {}: {}", line_no + 1, e))
            })?
            else {
                continue;
            };

            let base = *first_timestamp.get_or_insert(timestamp);
            let offset = Duration::try_from_secs_f64((timestamp - base).max(0.0)).map_err(|_| {
                FeederError::Configuration(format!(
                    "Dump file line {}: timestamp {} is too far from the first frame",
                    line_no + 1,
                    timestamp
                ))
            })?;
            frames.push(RecordedFrame { offset, frame });
        }

        if frames.is_empty() {
            return Err(FeederError::Configuration(
                "Dump file contains no data frames".to_string(),
            ));
        }

        Ok(Self {
            frames,
            position: 0,
            started: Instant::now(),
            paced: true,
            looping: true,
        })
    }

    /// Builder method: replay with recorded timing (default) or as fast as possible
    pub fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Builder method: restart from the beginning at end of file (default)
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Number of data frames in the log
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for CandumpReplay {
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        if self.position >= self.frames.len() {
            if !self.looping {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            log::debug!("Restarting candump replay");
            self.position = 0;
            self.started = Instant::now();
        }

        let recorded = &self.frames[self.position];

        if self.paced {
            let due = self.started + recorded.offset;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
        }

        self.position += 1;

        let mut frame = recorded.frame.clone();
        frame.timestamp_ns = Utc::now()
            .timestamp_nanos_opt()
            .map(|ns| ns.max(0) as u64)
            .unwrap_or(frame.timestamp_ns);
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.position = self.frames.len();
        self.looping = false;
    }
}

/// Parse one candump line into its timestamp (seconds) and frame
///
/// Returns `Ok(None)` for lines that carry no data frame: blank lines,
/// comments, remote frames and error frames.
pub fn parse_candump_line(line: &str) -> std::result::Result<Option<(f64, CanFrame)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (Some(stamp), Some(_interface), Some(body)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected '(<time>) <iface> <frame>', got '{}'", line));
    };

    let timestamp: f64 = stamp
        .trim_start_matches('(')
        .trim_end_matches(')')
        .parse()
        .ok()
        .filter(|t: &f64| t.is_finite())
        .ok_or_else(|| format!("invalid timestamp '{}'", stamp))?;

    let (id_text, payload) = body
        .split_once('#')
        .ok_or_else(|| format!("missing '#' in frame '{}'", body))?;

    let raw_id = u32::from_str_radix(id_text, 16).map_err(|_| format!("invalid CAN ID '{}'", id_text))?;
    if raw_id & CAN_ERR_FLAG != 0 && id_text.len() == 8 {
        return Ok(None);
    }

    let (is_fd, hex) = match payload.strip_prefix('#') {
        // FD frames carry a one-digit flags field before the data
        Some(fd_payload) => (true, fd_payload.get(1..).unwrap_or("")),
        None => (false, payload),
    };

    if !is_fd && hex.starts_with('R') {
        return Ok(None);
    }

    let data = parse_hex(hex)?;
    let max_len = if is_fd { 64 } else { 8 };
    if data.len() > max_len {
        return Err(format!("frame carries {} bytes, limit is {}", data.len(), max_len));
    }

    let timestamp_ns = (timestamp * 1e9).max(0.0) as u64;
    let frame = CanFrame {
        timestamp_ns,
        can_id: raw_id & 0x1FFF_FFFF,
        data,
        is_extended: id_text.len() > 3,
        is_fd,
        is_error_frame: false,
        is_remote_frame: false,
    };

    Ok(Some((timestamp, frame)))
}

fn parse_hex(hex: &str) -> std::result::Result<Vec<u8>, String> {
    let digits = hex
        .chars()
        .filter(|c| *c != '.')
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| format!("invalid hex digit '{}' in '{}'", c, hex))
        })
        .collect::<std::result::Result<Vec<u8>, String>>()?;
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", hex));
    }

    Ok(digits.chunks(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}
