//! Cooperative cancellation
//!
//! A `Shutdown` token is a flag plus a wake-up channel. Threads poll
//! `is_triggered()` in their loops, or block on `wait()` / select on
//! `signal()` to wake up as soon as shutdown is requested.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    triggered: AtomicBool,
    // Dropped on trigger, which disconnects every receiver
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

/// Shared cancellation token
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Request shutdown; returns false if it was already requested
    pub fn trigger(&self) -> bool {
        let first = !self.inner.triggered.swap(true, Ordering::SeqCst);
        self.inner.sender.lock().take();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`; returns true if shutdown was requested
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let _ = self.inner.receiver.recv_timeout(timeout);
        self.is_triggered()
    }

    /// Channel that becomes ready (disconnected) once shutdown is requested
    ///
    /// Meant for `crossbeam_channel::select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.clone().is_triggered());
    }

    #[test]
    fn test_wait_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();

        let start = Instant::now();
        let handle = std::thread::spawn(move || remote.wait(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_times_out() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait(Duration::from_millis(10)));
    }
}
