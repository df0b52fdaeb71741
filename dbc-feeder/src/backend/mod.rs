//! VSS backend clients
//!
//! The feeder talks to the VSS side only through `BackendClient`. Two
//! implementations exist: `DatapointLog` writes every forwarded datapoint
//! as a text line, `LocalBroker` is an in-process datapoint store with
//! target-value subscriptions.

use crate::shutdown::Shutdown;
use crate::types::{FeederError, Result, SignalValue};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub mod broker;
pub mod datapoint_log;

pub use broker::LocalBroker;
pub use datapoint_log::DatapointLog;

/// One entry of a subscription batch
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUpdate {
    pub path: String,
    /// Current (sensor) value, if the backend pushed one
    pub value: Option<SignalValue>,
    /// Requested actuator target, if the backend pushed one
    pub actuator_target: Option<SignalValue>,
}

impl EntryUpdate {
    pub fn target(path: impl Into<String>, value: SignalValue) -> Self {
        Self {
            path: path.into(),
            value: None,
            actuator_target: Some(value),
        }
    }

    pub fn current(path: impl Into<String>, value: SignalValue) -> Self {
        Self {
            path: path.into(),
            value: Some(value),
            actuator_target: None,
        }
    }
}

/// Connection to the VSS side
pub trait BackendClient: Send + Sync {
    /// Establish the connection
    fn start(&self) -> Result<()>;

    /// Tear the connection down
    fn stop(&self);

    fn is_connected(&self) -> bool;

    /// True if `subscribe` is available
    fn supports_subscription(&self) -> bool;

    /// True if the backend knows `path`
    fn is_signal_defined(&self, path: &str) -> bool;

    /// Publish a current value; `Ok(false)` if the backend refused it
    fn update_datapoint(&self, path: &str, value: &SignalValue) -> Result<bool>;

    /// Deliver target-value batches for `paths` into `sink` until `shutdown`
    /// triggers
    fn subscribe(&self, paths: &[String], sink: Sender<Vec<EntryUpdate>>, shutdown: &Shutdown) -> Result<()>;

    /// Offer the VSS paths the feeder is about to use
    ///
    /// Called once per run, before the pipelines start. Backends that
    /// create paths on demand register them here; the others ignore it.
    fn provision_paths(&self, _paths: &[String]) {}
}

/// Which backend implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Write `Datapoint(<path>, <value>)` lines
    #[default]
    DatapointLog,
    /// In-process datapoint store with subscriptions
    LocalBroker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::DatapointLog => write!(f, "datapoint-log"),
            BackendKind::LocalBroker => write!(f, "local-broker"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = FeederError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "datapoint-log" => Ok(BackendKind::DatapointLog),
            "local-broker" => Ok(BackendKind::LocalBroker),
            other => Err(FeederError::Configuration(format!(
                "Unknown server type '{}', expected datapoint-log or local-broker",
                other
            ))),
        }
    }
}

/// Settings for the backend clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Where `DatapointLog` writes; stdout when unset
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

impl BackendConfig {
    /// Builder method: set the output file for datapoint lines
    pub fn with_output_file(mut self, path: PathBuf) -> Self {
        self.output_file = Some(path);
        self
    }
}

/// Create a backend client of the given kind
///
/// A `LocalBroker` created here starts empty and registers the mapped VSS
/// paths when the feeder starts.
pub fn create_client(kind: BackendKind, config: &BackendConfig) -> Result<Arc<dyn BackendClient>> {
    log::info!("Using {} backend", kind);

    let client: Arc<dyn BackendClient> = match kind {
        BackendKind::DatapointLog => Arc::new(match &config.output_file {
            Some(path) => DatapointLog::to_file(path)?,
            None => DatapointLog::stdout(),
        }),
        BackendKind::LocalBroker => Arc::new(LocalBroker::new().with_provisioning(true)),
    };
    Ok(client)
}
