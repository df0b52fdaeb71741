//! Datapoint line writer
//!
//! Writes one `Datapoint(<path>, <value>)` line per forwarded value to
//! stdout or an append-mode file. It is always connected, knows every path
//! and cannot deliver target values.

use super::{BackendClient, EntryUpdate};
use crate::shutdown::Shutdown;
use crate::types::{FeederError, Result, SignalValue};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub struct DatapointLog {
    output: Mutex<Box<dyn Write + Send>>,
}

impl DatapointLog {
    /// Write to standard output
    pub fn stdout() -> Self {
        Self::to_writer(Box::new(std::io::stdout()))
    }

    /// Append to a file, creating it if needed
    pub fn to_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FeederError::Backend(format!("Failed to open output file {:?}: {}", path, e)))?;
        log::info!("Writing datapoints to {:?}", path);
        Ok(Self::to_writer(Box::new(file)))
    }

    /// Write to any writer
    pub fn to_writer(output: Box<dyn Write + Send>) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }
}

impl BackendClient for DatapointLog {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {
        if let Err(e) = self.output.lock().flush() {
            log::warn!("Failed to flush datapoint output: {}", e);
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn supports_subscription(&self) -> bool {
        false
    }

    fn is_signal_defined(&self, _path: &str) -> bool {
        true
    }

    fn update_datapoint(&self, path: &str, value: &SignalValue) -> Result<bool> {
        let mut output = self.output.lock();
        writeln!(output, "Datapoint({}, {})", path, value)?;
        output.flush()?;
        Ok(true)
    }

    fn subscribe(&self, _paths: &[String], _sink: Sender<Vec<EntryUpdate>>, _shutdown: &Shutdown) -> Result<()> {
        Err(FeederError::Backend(
            "datapoint log does not support subscriptions".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_are_written() {
        let buffer = SharedBuffer::default();
        let client = DatapointLog::to_writer(Box::new(buffer.clone()));

        assert!(client.is_connected());
        assert!(client.is_signal_defined("Vehicle.Speed"));
        assert!(client.update_datapoint("Vehicle.Speed", &SignalValue::Float(12.5)).unwrap());
        assert!(client
            .update_datapoint("Vehicle.Body.Lights.Beam.Low.IsOn", &SignalValue::Boolean(true))
            .unwrap());

        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(
            text,
            "Datapoint(Vehicle.Speed, 12.5)\nDatapoint(Vehicle.Body.Lights.Beam.Low.IsOn, true)\n"
        );
    }

    #[test]
    fn test_file_output_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datapoints.txt");

        DatapointLog::to_file(&path)
            .unwrap()
            .update_datapoint("A", &SignalValue::Integer(1))
            .unwrap();
        DatapointLog::to_file(&path)
            .unwrap()
            .update_datapoint("B", &SignalValue::Integer(2))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Datapoint(A, 1)\nDatapoint(B, 2)\n");
    }

    #[test]
    fn test_subscription_is_unsupported() {
        let client = DatapointLog::to_writer(Box::new(std::io::sink()));
        let (tx, _rx) = crossbeam_channel::unbounded();
        assert!(client.subscribe(&["A".to_string()], tx, &Shutdown::new()).is_err());
    }
}
