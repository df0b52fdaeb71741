//! Feeder orchestration
//!
//! `Feeder` wires the CAN reader, the dbc2vss receiver pipeline and the
//! vss2dbc transmitter pipeline together, runs each on its own thread and
//! joins them when a shutdown is requested.
//!
//! # Example
//!
//! ```no_run
//! use dbc_feeder::backend::{create_client, BackendConfig, BackendKind};
//! use dbc_feeder::{Feeder, FeederConfig};
//!
//! let client = create_client(BackendKind::DatapointLog, &BackendConfig::default())?;
//! let feeder = Feeder::new(client, true, false);
//!
//! let config = FeederConfig::new("vcan0").add_dbc_file("Model3CAN.dbc");
//! feeder.start(&config)?;
//! # Ok::<(), dbc_feeder::FeederError>(())
//! ```

mod receiver;
mod state;
mod transmitter;

pub use state::{ConnectionState, DisconnectHeartbeat, FeederStats};

use crate::backend::BackendClient;
use crate::bus::Bus;
use crate::config::FeederConfig;
use crate::decoder::{CanReader, DecodeMode};
use crate::mapping::Mapper;
use crate::shutdown::Shutdown;
use crate::signals::load_database;
use crate::types::{FeederError, Result};
use parking_lot::Mutex;
use receiver::ReceiverPipeline;
use state::{SharedConnectionState, SharedStats};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use transmitter::TransmitterPipeline;

/// CAN to VSS feeder
pub struct Feeder {
    client: Arc<dyn BackendClient>,
    dbc2vss: bool,
    vss2dbc: bool,
    running: AtomicBool,
    /// Token of the current run, if any
    shutdown: Mutex<Option<Shutdown>>,
    connection: Arc<SharedConnectionState>,
    stats: Arc<SharedStats>,
}

#[derive(Default)]
struct Threads {
    reader: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

/// Which pipelines a run will start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pipelines {
    dbc2vss: bool,
    vss2dbc: bool,
}

impl Feeder {
    /// Create a feeder for a backend with the requested directions
    pub fn new(client: Arc<dyn BackendClient>, dbc2vss: bool, vss2dbc: bool) -> Self {
        Self {
            client,
            dbc2vss,
            vss2dbc,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            connection: Arc::new(SharedConnectionState::default()),
            stats: Arc::new(SharedStats::default()),
        }
    }

    /// Load everything named in `config` and run until stopped
    ///
    /// Blocks the calling thread.
    pub fn start(&self, config: &FeederConfig) -> Result<()> {
        config.validate()?;

        let database = load_database(&config.dbc_files, config.strict_parsing)?;
        let mapper = Mapper::from_files(
            database,
            &config.mapping_file,
            config.default_values_file.as_deref(),
        )?;
        // Fail before touching the bus if the rules cannot be served
        self.select_pipelines(&mapper)?;

        let bus = Bus::open(&config.bus_channel, config.fd_mode, config.replay_file.as_deref())?;
        self.run(mapper, config.decode_mode, bus)
    }

    /// Run with a prepared mapper and bus until stopped
    ///
    /// Blocks the calling thread. Returns the first fatal error raised by
    /// any pipeline.
    pub fn run(&self, mapper: Mapper, decode_mode: DecodeMode, bus: Bus) -> Result<()> {
        let pipelines = self.select_pipelines(&mapper)?;
        if pipelines.vss2dbc && bus.transmitter.is_none() {
            return Err(FeederError::Configuration(
                "vss2dbc requires a writable CAN bus, but the bus is read-only".to_string(),
            ));
        }

        // Set under the lock: once `is_running` is true, `stop` finds the token
        let shutdown = {
            let mut slot = self.shutdown.lock();
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(FeederError::AlreadyRunning);
            }
            let shutdown = Shutdown::new();
            *slot = Some(shutdown.clone());
            shutdown
        };
        self.connection.set(ConnectionState::Disconnected);
        self.stats.reset();

        let result = self.run_pipelines(Arc::new(mapper), decode_mode, bus, pipelines, &shutdown);

        shutdown.trigger();
        self.client.stop();
        self.shutdown.lock().take();
        self.running.store(false, Ordering::SeqCst);
        log::info!("Feeder stopped");
        result
    }

    fn select_pipelines(&self, mapper: &Mapper) -> Result<Pipelines> {
        let dbc2vss = self.dbc2vss && mapper.has_dbc2vss_mapping();
        if self.dbc2vss && !dbc2vss {
            log::info!("No dbc2vss mappings found, dbc2vss pipeline disabled");
        }

        let vss2dbc = self.vss2dbc && mapper.has_vss2dbc_mapping();
        if self.vss2dbc && !vss2dbc {
            log::info!("No vss2dbc mappings found, vss2dbc pipeline disabled");
        }

        if !dbc2vss && !vss2dbc {
            return Err(FeederError::Configuration(
                "No mappings for any enabled direction, nothing to do".to_string(),
            ));
        }
        if vss2dbc && !self.client.supports_subscription() {
            return Err(FeederError::Configuration(
                "vss2dbc requires a backend with subscription support".to_string(),
            ));
        }

        Ok(Pipelines { dbc2vss, vss2dbc })
    }

    /// Every VSS path the selected pipelines read or write
    fn used_paths(mapper: &Mapper, pipelines: Pipelines) -> Vec<String> {
        let mut paths = BTreeSet::new();
        if pipelines.dbc2vss {
            paths.extend(mapper.vss_names());
        }
        if pipelines.vss2dbc {
            paths.extend(mapper.vss2dbc_paths());
        }
        paths.into_iter().collect()
    }

    fn run_pipelines(
        &self,
        mapper: Arc<Mapper>,
        decode_mode: DecodeMode,
        bus: Bus,
        pipelines: Pipelines,
        shutdown: &Shutdown,
    ) -> Result<()> {
        self.client.start()?;
        self.client.provision_paths(&Self::used_paths(&mapper, pipelines));

        let mut threads = Threads::default();
        let mut first_error = match self.spawn_pipelines(&mut threads, mapper, decode_mode, bus, pipelines, shutdown) {
            Ok(()) => {
                log::info!(
                    "Feeder running (dbc2vss: {}, vss2dbc: {})",
                    pipelines.dbc2vss,
                    pipelines.vss2dbc
                );
                None
            }
            Err(e) => {
                log::error!("Failed to start feeder threads: {}", e);
                shutdown.trigger();
                Some(e)
            }
        };

        for worker in threads.workers {
            let outcome = worker
                .join()
                .unwrap_or_else(|_| Err(FeederError::Internal("pipeline thread panicked".to_string())));
            if let Err(e) = outcome {
                shutdown.trigger();
                first_error.get_or_insert(e);
            }
        }

        // Pipelines only return once shutdown is requested; make sure the
        // reader sees it too
        shutdown.trigger();
        if let Some(reader) = threads.reader {
            if reader.join().is_err() {
                log::error!("CAN reader thread panicked");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_pipelines(
        &self,
        threads: &mut Threads,
        mapper: Arc<Mapper>,
        decode_mode: DecodeMode,
        bus: Bus,
        pipelines: Pipelines,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let Bus { source, transmitter } = bus;

        if pipelines.dbc2vss {
            let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
            let reader = CanReader::new(mapper.clone(), decode_mode, queue_tx);
            threads.reader = Some(reader.spawn(source, shutdown.clone())?);

            let receiver = ReceiverPipeline::new(
                mapper.clone(),
                self.client.clone(),
                queue_rx,
                self.connection.clone(),
                self.stats.clone(),
                shutdown.clone(),
            );
            threads.workers.push(
                std::thread::Builder::new()
                    .name("dbc2vss".to_string())
                    .spawn(move || receiver.run())?,
            );
        }

        if let (true, Some(transmitter)) = (pipelines.vss2dbc, transmitter) {
            let pipeline = TransmitterPipeline::new(mapper, self.client.clone(), transmitter, shutdown.clone());
            threads.workers.push(
                std::thread::Builder::new()
                    .name("vss2dbc".to_string())
                    .spawn(move || pipeline.run())?,
            );
        }
        Ok(())
    }

    /// Request shutdown of a running feeder; no effect otherwise
    pub fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().as_ref() {
            if shutdown.trigger() {
                log::info!("Stopping feeder");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Backend state as last seen by the dbc2vss pipeline
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.get()
    }

    pub fn stats(&self) -> FeederStats {
        self.stats.snapshot()
    }
}
