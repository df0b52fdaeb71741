//! In-process datapoint broker
//!
//! Keeps a registry of known VSS paths with their current and target
//! values. Target values set through `set_target`/`set_targets` are pushed
//! to every subscriber interested in the path, one batch per call.

use super::{BackendClient, EntryUpdate};
use crate::shutdown::Shutdown;
use crate::types::{FeederError, Result, SignalValue};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// How often a blocked `subscribe` call checks for shutdown
const SUBSCRIPTION_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone)]
struct Entry {
    current: Option<SignalValue>,
    target: Option<SignalValue>,
}

struct Subscriber {
    id: u64,
    paths: HashSet<String>,
    sink: Sender<Vec<EntryUpdate>>,
}

#[derive(Default)]
struct BrokerState {
    entries: BTreeMap<String, Entry>,
    subscribers: Vec<Subscriber>,
    /// Every accepted `update_datapoint` call, in order
    history: Vec<(String, SignalValue)>,
}

/// In-process VSS datapoint store
pub struct LocalBroker {
    connected: AtomicBool,
    /// Accept paths offered through `provision_paths`
    provisioning: bool,
    next_subscriber: AtomicU64,
    state: Mutex<BrokerState>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    /// Create a connected broker with no known paths
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            provisioning: false,
            next_subscriber: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Builder method: register paths
    pub fn with_paths<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            self.define(path);
        }
        self
    }

    /// Builder method: register the paths offered by the feeder at startup
    pub fn with_provisioning(mut self, provisioning: bool) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Register a path
    pub fn define(&self, path: impl Into<String>) {
        self.state.lock().entries.entry(path.into()).or_default();
    }

    /// Simulate the link going up or down
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            log::info!("Local broker {}", if connected { "connected" } else { "disconnected" });
        }
    }

    /// Set one target value and notify subscribers
    pub fn set_target(&self, path: &str, value: SignalValue) -> Result<()> {
        self.set_targets(vec![(path.to_string(), value)])
    }

    /// Set several target values and notify each subscriber with one batch
    pub fn set_targets(&self, targets: Vec<(String, SignalValue)>) -> Result<()> {
        let mut state = self.state.lock();

        for (path, value) in &targets {
            let entry = state
                .entries
                .get_mut(path)
                .ok_or_else(|| FeederError::Backend(format!("Unknown VSS path {}", path)))?;
            entry.target = Some(value.clone());
        }

        let updates: Vec<EntryUpdate> = targets
            .into_iter()
            .map(|(path, value)| EntryUpdate::target(path, value))
            .collect();
        Self::notify(&mut state, updates);
        Ok(())
    }

    /// Push a current value to subscribers, as a broker would after a sensor write
    pub fn publish_current(&self, path: &str, value: SignalValue) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(path)
            .ok_or_else(|| FeederError::Backend(format!("Unknown VSS path {}", path)))?;
        entry.current = Some(value.clone());
        Self::notify(&mut state, vec![EntryUpdate::current(path, value)]);
        Ok(())
    }

    fn notify(state: &mut BrokerState, updates: Vec<EntryUpdate>) {
        state.subscribers.retain(|subscriber| {
            let batch: Vec<EntryUpdate> = updates
                .iter()
                .filter(|update| subscriber.paths.contains(&update.path))
                .cloned()
                .collect();
            if batch.is_empty() {
                return true;
            }
            subscriber.sink.send(batch).is_ok()
        });
    }

    pub fn current_value(&self, path: &str) -> Option<SignalValue> {
        self.state.lock().entries.get(path).and_then(|entry| entry.current.clone())
    }

    pub fn target_value(&self, path: &str) -> Option<SignalValue> {
        self.state.lock().entries.get(path).and_then(|entry| entry.target.clone())
    }

    /// All accepted datapoint updates, oldest first
    pub fn updates(&self) -> Vec<(String, SignalValue)> {
        self.state.lock().history.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl BackendClient for LocalBroker {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().subscribers.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports_subscription(&self) -> bool {
        true
    }

    fn is_signal_defined(&self, path: &str) -> bool {
        self.is_connected() && self.state.lock().entries.contains_key(path)
    }

    fn update_datapoint(&self, path: &str, value: &SignalValue) -> Result<bool> {
        if !self.is_connected() {
            return Err(FeederError::Backend("Local broker is not connected".to_string()));
        }

        let mut state = self.state.lock();
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.current = Some(value.clone());
                state.history.push((path.to_string(), value.clone()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, paths: &[String], sink: Sender<Vec<EntryUpdate>>, shutdown: &Shutdown) -> Result<()> {
        if !self.is_connected() {
            return Err(FeederError::Backend("Local broker is not connected".to_string()));
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            let unknown: Vec<&String> = paths.iter().filter(|p| !state.entries.contains_key(*p)).collect();
            if !unknown.is_empty() {
                return Err(FeederError::Backend(format!("Cannot subscribe to unknown paths {:?}", unknown)));
            }
            state.subscribers.push(Subscriber {
                id,
                paths: paths.iter().cloned().collect(),
                sink,
            });
        }
        log::info!("Subscriber {} registered for {} path(s)", id, paths.len());

        while !shutdown.wait(SUBSCRIPTION_POLL) {
            let still_registered = self.state.lock().subscribers.iter().any(|s| s.id == id);
            if !still_registered {
                return Err(FeederError::Backend(format!("Subscription {} was dropped", id)));
            }
        }

        self.state.lock().subscribers.retain(|s| s.id != id);
        log::info!("Subscriber {} removed", id);
        Ok(())
    }

    fn provision_paths(&self, paths: &[String]) {
        if !self.provisioning {
            return;
        }
        for path in paths {
            self.define(path.as_str());
        }
        log::info!("Local broker provisioned {} path(s)", paths.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_requires_known_path_and_connection() {
        let broker = LocalBroker::new().with_paths(["Vehicle.Speed"]);

        assert!(broker.is_signal_defined("Vehicle.Speed"));
        assert!(!broker.is_signal_defined("Vehicle.Unknown"));
        assert!(broker.update_datapoint("Vehicle.Speed", &SignalValue::Float(3.0)).unwrap());
        assert!(!broker.update_datapoint("Vehicle.Unknown", &SignalValue::Float(3.0)).unwrap());
        assert_eq!(broker.current_value("Vehicle.Speed"), Some(SignalValue::Float(3.0)));

        broker.set_connected(false);
        assert!(!broker.is_signal_defined("Vehicle.Speed"));
        assert!(broker.update_datapoint("Vehicle.Speed", &SignalValue::Float(4.0)).is_err());
        assert_eq!(broker.updates().len(), 1);
    }

    #[test]
    fn test_subscription_receives_target_batches() {
        let broker = Arc::new(LocalBroker::new().with_paths(["A", "B", "C"]));
        let shutdown = Shutdown::new();
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker = {
            let broker = broker.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || broker.subscribe(&["A".to_string(), "B".to_string()], tx, &shutdown))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while broker.subscriber_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broker.subscriber_count(), 1);

        broker
            .set_targets(vec![
                ("A".to_string(), SignalValue::Integer(1)),
                ("C".to_string(), SignalValue::Integer(3)),
            ])
            .unwrap();
        let batch = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(batch, vec![EntryUpdate::target("A", SignalValue::Integer(1))]);

        broker.publish_current("B", SignalValue::Integer(2)).unwrap();
        let batch = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(batch[0].value, Some(SignalValue::Integer(2)));

        shutdown.trigger();
        worker.join().unwrap().unwrap();
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_provisioning_is_opt_in() {
        let paths = vec!["Vehicle.Speed".to_string()];

        let fixed = LocalBroker::new();
        fixed.provision_paths(&paths);
        assert!(!fixed.is_signal_defined("Vehicle.Speed"));

        let open = LocalBroker::new().with_provisioning(true).with_paths(["Vehicle.Cabin.Door"]);
        open.provision_paths(&paths);
        assert!(open.is_signal_defined("Vehicle.Speed"));
        assert!(open.is_signal_defined("Vehicle.Cabin.Door"));
    }

    #[test]
    fn test_subscribe_rejects_unknown_paths() {
        let broker = LocalBroker::new().with_paths(["A"]);
        let (tx, _rx) = crossbeam_channel::unbounded();
        assert!(broker.subscribe(&["Z".to_string()], tx, &Shutdown::new()).is_err());
        assert!(broker.set_target("Z", SignalValue::Integer(1)).is_err());
    }
}
