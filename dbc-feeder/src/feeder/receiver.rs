//! dbc2vss pipeline
//!
//! Drains the observation queue and writes values to the backend once the
//! backend is connected and knows every mapped VSS path.

use super::state::{ConnectionState, DisconnectHeartbeat, SharedConnectionState, SharedStats};
use crate::backend::BackendClient;
use crate::mapping::Mapper;
use crate::shutdown::Shutdown;
use crate::types::{FeederError, Result, SignalObservation};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval while the backend is unreachable
const CONNECT_POLL: Duration = Duration::from_millis(200);

/// Disconnected time between two "not connected" log lines
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Maximum wait for the next observation
const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct ReceiverPipeline {
    mapper: Arc<Mapper>,
    client: Arc<dyn BackendClient>,
    queue: Receiver<SignalObservation>,
    connection: Arc<SharedConnectionState>,
    stats: Arc<SharedStats>,
    shutdown: Shutdown,
}

impl ReceiverPipeline {
    pub(crate) fn new(
        mapper: Arc<Mapper>,
        client: Arc<dyn BackendClient>,
        queue: Receiver<SignalObservation>,
        connection: Arc<SharedConnectionState>,
        stats: Arc<SharedStats>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            mapper,
            client,
            queue,
            connection,
            stats,
            shutdown,
        }
    }

    /// Run until shutdown
    ///
    /// Returns an error only for fatal conditions; those also trigger the
    /// shutdown token so the other pipelines stop as well.
    pub(crate) fn run(self) -> Result<()> {
        log::info!("dbc2vss pipeline started");
        let mut heartbeat = DisconnectHeartbeat::new(HEARTBEAT_PERIOD);

        while !self.shutdown.is_triggered() {
            match self.connection.get() {
                ConnectionState::Disconnected => {
                    if self.client.is_connected() {
                        log::info!("Backend connected");
                        heartbeat.reset();
                        self.connection.set(ConnectionState::ConnectedUnregistered);
                        continue;
                    }

                    let started = Instant::now();
                    self.shutdown.wait(CONNECT_POLL);
                    if heartbeat.tick(started.elapsed()) {
                        log::info!("Backend still not connected");
                    }
                }
                ConnectionState::ConnectedUnregistered => {
                    let missing = self.unregistered_paths();
                    if !missing.is_empty() {
                        log::error!("VSS paths not known to the backend: {:?}", missing);
                        self.shutdown.trigger();
                        return Err(FeederError::Registration(missing));
                    }
                    log::info!("All {} dbc2vss paths registered", self.mapper.vss_names().len());
                    self.connection.set(ConnectionState::ConnectedRegistered);
                }
                ConnectionState::ConnectedRegistered => {
                    if !self.client.is_connected() {
                        log::warn!("Backend connection lost");
                        self.connection.set(ConnectionState::Disconnected);
                        continue;
                    }
                    if !self.drain_one()? {
                        break;
                    }
                }
            }
        }

        log::info!("dbc2vss pipeline stopped");
        Ok(())
    }

    fn unregistered_paths(&self) -> Vec<String> {
        self.mapper
            .vss_names()
            .into_iter()
            .filter(|path| !self.client.is_signal_defined(path))
            .collect()
    }

    /// Wait for and forward one observation
    ///
    /// Returns false once the producer side of the queue is gone; the
    /// feeder cannot do anything useful after that and is shut down.
    fn drain_one(&self) -> Result<bool> {
        self.stats.observe_queue_depth(self.queue.len());

        crossbeam_channel::select! {
            recv(self.queue) -> observation => match observation {
                Ok(observation) => self.forward(observation)?,
                Err(_) => {
                    log::error!("Observation queue closed, stopping the feeder");
                    self.shutdown.trigger();
                    return Ok(false);
                }
            },
            recv(self.shutdown.signal()) -> _ => {},
            default(QUEUE_TIMEOUT) => {},
        }
        Ok(true)
    }

    /// Push one observation through transform, change condition and backend
    ///
    /// Backend failures are logged and swallowed. An observation for a signal
    /// without a rule means the tables are inconsistent and is fatal.
    pub(crate) fn forward(&self, observation: SignalObservation) -> Result<()> {
        let rule = match self.mapper.resolve_forward(&observation.signal_name) {
            Ok(rule) => rule,
            Err(e) => {
                log::error!("Cannot forward {} from {}: {}", observation.signal_name, observation.message_name, e);
                self.shutdown.trigger();
                return Err(e);
            }
        };

        let Some(value) = self.mapper.transform(rule, &observation.raw_value) else {
            log::debug!(
                "Value {} of {} has no mapping for {}, dropped",
                observation.raw_value,
                observation.signal_name,
                rule.vss_path
            );
            return Ok(());
        };

        if !self.mapper.condition_fulfilled(rule, &value) {
            log::trace!("{} unchanged for {}, not sent", value, rule.vss_path);
            return Ok(());
        }

        match self.client.update_datapoint(&rule.vss_path, &value) {
            Ok(true) => {
                log::debug!("Updated {} = {} (from {})", rule.vss_path, value, observation.signal_name);
                let forwarded = self.stats.record_forwarded();
                if forwarded.is_power_of_two() {
                    log::info!(
                        "Number of VSS messages sent so far: {}, max queue depth: {}",
                        forwarded,
                        self.stats.snapshot().max_queue_depth
                    );
                }
            }
            Ok(false) => log::warn!("Backend refused update of {} = {}", rule.vss_path, value),
            Err(e) => log::error!(
                "Failed to update {} with {} from signal {}: {}",
                rule.vss_path,
                value,
                observation.signal_name,
                e
            ),
        }
        Ok(())
    }
}
