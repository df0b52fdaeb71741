//! vss2dbc pipeline
//!
//! A worker thread keeps a target-value subscription open for every
//! vss2dbc path. Each batch it delivers is turned into the set of affected
//! DBC messages, which are encoded and sent once per batch.

use crate::backend::{BackendClient, EntryUpdate};
use crate::bus::CanTransmitter;
use crate::mapping::Mapper;
use crate::message_encoder::MessageEncoder;
use crate::shutdown::Shutdown;
use crate::types::Result;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long the loop sleeps without a batch
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Pause before re-subscribing after a failed or dropped subscription
const SUBSCRIBE_RETRY: Duration = Duration::from_secs(1);

pub(crate) struct TransmitterPipeline {
    mapper: Arc<Mapper>,
    client: Arc<dyn BackendClient>,
    transmitter: Box<dyn CanTransmitter>,
    shutdown: Shutdown,
}

impl TransmitterPipeline {
    pub(crate) fn new(
        mapper: Arc<Mapper>,
        client: Arc<dyn BackendClient>,
        transmitter: Box<dyn CanTransmitter>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            mapper,
            client,
            transmitter,
            shutdown,
        }
    }

    pub(crate) fn run(mut self) -> Result<()> {
        let paths: Vec<String> = self.mapper.vss2dbc_paths().into_iter().collect();
        log::info!("vss2dbc pipeline started, subscribing to {} path(s)", paths.len());

        let (batches_tx, batches_rx) = crossbeam_channel::unbounded();
        let worker = {
            let client = self.client.clone();
            let shutdown = self.shutdown.clone();
            std::thread::Builder::new()
                .name("vss-subscription".to_string())
                .spawn(move || subscription_loop(client, paths, batches_tx, shutdown))?
        };

        self.process_batches(&batches_rx);

        if worker.join().is_err() {
            log::error!("Subscription worker panicked");
        }
        log::info!("vss2dbc pipeline stopped");
        Ok(())
    }

    fn process_batches(&mut self, batches: &Receiver<Vec<EntryUpdate>>) {
        while !self.shutdown.is_triggered() {
            crossbeam_channel::select! {
                recv(batches) -> batch => match batch {
                    Ok(batch) => {
                        self.handle_batch(batch);
                    }
                    Err(_) => break,
                },
                recv(self.shutdown.signal()) -> _ => break,
                default(IDLE_TICK) => {},
            }
        }
    }

    /// Encode and send every message touched by a batch of updates
    ///
    /// Returns the number of frames sent.
    pub(crate) fn handle_batch(&mut self, batch: Vec<EntryUpdate>) -> usize {
        let mut affected: HashSet<String> = HashSet::new();

        for update in &batch {
            if let Some(value) = &update.value {
                log::warn!(
                    "Ignoring current value {} for {}; only target values are expected",
                    value,
                    update.path
                );
            }
            if let Some(target) = &update.actuator_target {
                affected.extend(self.mapper.apply_update(&update.path, target));
            }
        }

        if affected.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for message in self.mapper.messages_for_signals(&affected) {
            let values = self.mapper.values_for_message(message.id);
            let data = match MessageEncoder::encode_message(message, &values) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Cannot encode {} (0x{:X}): {}", message.name, message.id, e);
                    continue;
                }
            };

            match self.transmitter.send(message.id, &data) {
                Ok(()) => {
                    log::debug!("Sent {} (0x{:X}): {:02X?}", message.name, message.id, data);
                    sent += 1;
                }
                Err(e) => log::error!("Failed to send {} (0x{:X}): {}", message.name, message.id, e),
            }
        }
        sent
    }
}

fn subscription_loop(
    client: Arc<dyn BackendClient>,
    paths: Vec<String>,
    batches: Sender<Vec<EntryUpdate>>,
    shutdown: Shutdown,
) {
    while !shutdown.is_triggered() {
        if client.is_connected() {
            if let Err(e) = client.subscribe(&paths, batches.clone(), &shutdown) {
                log::warn!("Subscription to vss2dbc paths failed: {}", e);
            }
        } else {
            log::debug!("Backend not connected, subscription postponed");
        }
        shutdown.wait(SUBSCRIBE_RETRY);
    }
}
