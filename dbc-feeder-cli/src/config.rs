//! Configuration loading and resolution
//!
//! Settings come from three layers: command line (with environment
//! fallbacks, handled by clap), an optional TOML file, then built-in
//! defaults. The first layer that sets a value wins.

use anyhow::{bail, Context, Result};
use dbc_feeder::{BackendConfig, BackendKind, DecodeMode, FeederConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Places searched for a configuration file when `--config` is not given
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "/config/dbc_feeder.toml",
    "/etc/dbc_feeder.toml",
    "config/dbc_feeder.toml",
];

const DEFAULT_MAPPING_FILE: &str = "mapping/vss_4.0/vss_dbc.json";
const DEFAULT_VALUES_FILE: &str = "dbc_default_values.json";

/// Contents of the TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub can: CanConfig,
}

/// `[general]` section: backend and mapping
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub server_type: Option<BackendKind>,
    /// Output file of the datapoint-log backend
    pub output_file: Option<PathBuf>,
    pub mapping: Option<PathBuf>,
    pub dbc2vss: Option<bool>,
    pub vss2dbc: Option<bool>,
}

/// `[can]` section: bus and DBC files
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CanConfig {
    pub port: Option<String>,
    #[serde(default)]
    pub dbc_files: Vec<PathBuf>,
    pub dbc_default_file: Option<PathBuf>,
    pub j1939: Option<bool>,
    pub candump_file: Option<PathBuf>,
    pub can_fd: Option<bool>,
    pub strict_parsing: Option<bool>,
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dbc_files: Vec<PathBuf>,
    pub dump_file: Option<PathBuf>,
    pub can_port: Option<String>,
    pub use_j1939: bool,
    /// Read the live bus even if a dump file is configured
    pub use_socketcan: bool,
    pub can_fd: bool,
    pub mapping: Option<PathBuf>,
    pub dbc_default: Option<PathBuf>,
    pub server_type: Option<BackendKind>,
    pub output: Option<PathBuf>,
    pub lax_dbc_parsing: bool,
    pub dbc2vss: Option<bool>,
    pub vss2dbc: Option<bool>,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub feeder: FeederConfig,
    pub backend_kind: BackendKind,
    pub backend: BackendConfig,
    pub dbc2vss: bool,
    pub vss2dbc: bool,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// The configuration file to use: the explicit one, else the first that exists
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    CONFIG_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
}

/// Merge the layers and validate the result
pub fn resolve(overrides: &Overrides, file: &AppConfig) -> Result<Settings> {
    let general = &file.general;
    let can = &file.can;

    let dbc2vss = overrides.dbc2vss.or(general.dbc2vss).unwrap_or(true);
    let vss2dbc = overrides.vss2dbc.or(general.vss2dbc).unwrap_or(false);
    if !dbc2vss && !vss2dbc {
        bail!("Either dbc2vss or vss2dbc must be enabled");
    }

    let dbc_files = if overrides.dbc_files.is_empty() {
        can.dbc_files.clone()
    } else {
        overrides.dbc_files.clone()
    };
    if dbc_files.is_empty() {
        bail!("No DBC file specified");
    }

    let Some(can_port) = overrides.can_port.clone().or_else(|| can.port.clone()) else {
        bail!("No CAN port specified");
    };

    let replay_file = if overrides.use_socketcan {
        None
    } else {
        overrides.dump_file.clone().or_else(|| can.candump_file.clone())
    };
    if replay_file.is_some() && vss2dbc {
        bail!("Cannot use a dump file and vss2dbc at the same time");
    }

    let decode_mode = if overrides.use_j1939 || can.j1939.unwrap_or(false) {
        DecodeMode::J1939
    } else {
        DecodeMode::Dbc
    };

    let mut feeder = FeederConfig::new(can_port)
        .with_mapping_file(
            overrides
                .mapping
                .clone()
                .or_else(|| general.mapping.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPING_FILE)),
        )
        .with_fd_mode(overrides.can_fd || can.can_fd.unwrap_or(false))
        .with_decode_mode(decode_mode)
        .with_strict_parsing(!overrides.lax_dbc_parsing && can.strict_parsing.unwrap_or(true));
    for path in dbc_files {
        feeder = feeder.add_dbc_file(path);
    }
    // Default values only matter when encoding
    if vss2dbc {
        feeder = feeder.with_default_values_file(
            overrides
                .dbc_default
                .clone()
                .or_else(|| can.dbc_default_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VALUES_FILE)),
        );
    }
    if let Some(path) = replay_file {
        feeder = feeder.with_replay_file(path);
    }
    feeder.validate().context("Invalid feeder configuration")?;

    let backend_kind = overrides.server_type.or(general.server_type).unwrap_or_default();
    let mut backend = BackendConfig::default();
    if let Some(output) = overrides.output.clone().or_else(|| general.output_file.clone()) {
        backend = backend.with_output_file(output);
    }

    Ok(Settings {
        feeder,
        backend_kind,
        backend,
        dbc2vss,
        vss2dbc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_overrides() -> Overrides {
        Overrides {
            dbc_files: vec![PathBuf::from("Model3CAN.dbc")],
            can_port: Some("vcan0".to_string()),
            ..Overrides::default()
        }
    }

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [general]
            server_type = "local-broker"
            output_file = "datapoints.txt"
            vss2dbc = true

            [can]
            port = "can1"
            dbc_files = ["Model3CAN.dbc", "trailer.dbc"]
            j1939 = true
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.server_type, Some(BackendKind::LocalBroker));
        assert_eq!(config.general.output_file, Some(PathBuf::from("datapoints.txt")));
        assert_eq!(config.can.dbc_files.len(), 2);
        assert_eq!(config.can.j1939, Some(true));
    }

    #[test]
    fn test_defaults() {
        let settings = resolve(&minimal_overrides(), &AppConfig::default()).unwrap();

        assert!(settings.dbc2vss);
        assert!(!settings.vss2dbc);
        assert_eq!(settings.backend_kind, BackendKind::DatapointLog);
        assert_eq!(settings.feeder.mapping_file, PathBuf::from(DEFAULT_MAPPING_FILE));
        assert_eq!(settings.feeder.default_values_file, None);
        assert_eq!(settings.feeder.decode_mode, DecodeMode::Dbc);
        assert!(settings.feeder.strict_parsing);
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let file: AppConfig = toml::from_str(
            r#"
            [general]
            server_type = "local-broker"
            output_file = "from_file.txt"

            [can]
            port = "can1"
            dbc_files = ["file.dbc"]
        "#,
        )
        .unwrap();

        let mut overrides = minimal_overrides();
        overrides.output = Some(PathBuf::from("from_args.txt"));

        let settings = resolve(&overrides, &file).unwrap();
        assert_eq!(settings.feeder.bus_channel, "vcan0");
        assert_eq!(settings.feeder.dbc_files, vec![PathBuf::from("Model3CAN.dbc")]);
        assert_eq!(settings.backend_kind, BackendKind::LocalBroker);
        assert_eq!(settings.backend.output_file, Some(PathBuf::from("from_args.txt")));
    }

    #[test]
    fn test_file_supplies_missing_values() {
        let file: AppConfig = toml::from_str(
            r#"
            [can]
            port = "can1"
            dbc_files = ["file.dbc"]
            strict_parsing = false
            dbc_default_file = "defaults.json"

            [general]
            vss2dbc = true
        "#,
        )
        .unwrap();

        let settings = resolve(&Overrides::default(), &file).unwrap();
        assert_eq!(settings.feeder.bus_channel, "can1");
        assert_eq!(settings.backend, BackendConfig::default());
        assert!(!settings.feeder.strict_parsing);
        assert!(settings.vss2dbc);
        assert_eq!(
            settings.feeder.default_values_file,
            Some(PathBuf::from("defaults.json"))
        );
    }

    #[test]
    fn test_validation() {
        let mut overrides = minimal_overrides();
        overrides.dbc2vss = Some(false);
        assert!(resolve(&overrides, &AppConfig::default()).is_err());

        let mut overrides = minimal_overrides();
        overrides.dbc_files.clear();
        assert!(resolve(&overrides, &AppConfig::default()).is_err());

        let mut overrides = minimal_overrides();
        overrides.can_port = None;
        assert!(resolve(&overrides, &AppConfig::default()).is_err());

        let mut overrides = minimal_overrides();
        overrides.dump_file = Some(PathBuf::from("candump.log"));
        overrides.vss2dbc = Some(true);
        assert!(resolve(&overrides, &AppConfig::default()).is_err());
    }

    #[test]
    fn test_socketcan_overrides_dump_file() {
        let mut overrides = minimal_overrides();
        overrides.dump_file = Some(PathBuf::from("candump.log"));
        assert!(resolve(&overrides, &AppConfig::default())
            .unwrap()
            .feeder
            .replay_file
            .is_some());

        overrides.use_socketcan = true;
        overrides.vss2dbc = Some(true);
        let settings = resolve(&overrides, &AppConfig::default()).unwrap();
        assert!(settings.feeder.replay_file.is_none());
        assert_eq!(
            settings.feeder.default_values_file,
            Some(PathBuf::from(DEFAULT_VALUES_FILE))
        );
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbc_feeder.toml");
        fs::write(&path, "[can]\nport = \"vcan0\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.can.port.as_deref(), Some("vcan0"));
        assert_eq!(locate_config(Some(&path)), Some(path.clone()));

        fs::write(&path, "[can\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
