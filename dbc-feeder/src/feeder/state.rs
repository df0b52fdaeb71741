//! Connection state, disconnect heartbeat and forwarding counters

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

/// Backend link status as seen by the receiver pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Connected, VSS paths not yet checked
    ConnectedUnregistered,
    /// Connected and every forwarded path is known to the backend
    ConnectedRegistered,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::ConnectedUnregistered => 1,
            ConnectionState::ConnectedRegistered => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::ConnectedUnregistered,
            2 => ConnectionState::ConnectedRegistered,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Connection state written by the receiver, readable from anywhere
#[derive(Debug)]
pub struct SharedConnectionState(AtomicU8);

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected.to_u8()))
    }
}

impl SharedConnectionState {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}

/// Decides when to log "still not connected"
///
/// Time spent disconnected accumulates; each full period produces one event
/// and restarts the accumulator.
#[derive(Debug)]
pub struct DisconnectHeartbeat {
    period: Duration,
    accumulated: Duration,
}

impl DisconnectHeartbeat {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            accumulated: Duration::ZERO,
        }
    }

    /// Add time spent disconnected; true when a heartbeat is due
    pub fn tick(&mut self, elapsed: Duration) -> bool {
        self.accumulated += elapsed;
        if self.accumulated >= self.period {
            self.accumulated = Duration::ZERO;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
    }
}

/// Snapshot of the receiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeederStats {
    /// Datapoints accepted by the backend
    pub forwarded: u64,
    /// Largest queue length seen by the receiver
    pub max_queue_depth: usize,
}

/// Counters shared between the receiver and `Feeder::stats`
#[derive(Debug, Default)]
pub struct SharedStats {
    forwarded: AtomicU64,
    max_queue_depth: AtomicUsize,
}

impl SharedStats {
    /// Count one forwarded datapoint; returns the new total
    pub fn record_forwarded(&self) -> u64 {
        self.forwarded.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeederStats {
        FeederStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.forwarded.store(0, Ordering::Relaxed);
        self.max_queue_depth.store(0, Ordering::Relaxed);
    }
}
