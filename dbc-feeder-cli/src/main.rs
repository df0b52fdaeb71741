//! DBC Feeder CLI Application
//!
//! Command-line front end for the dbc-feeder library: resolves settings
//! from arguments, environment and an optional TOML file, creates the
//! backend client and runs the feeder until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use dbc_feeder::backend::create_client;
use dbc_feeder::{BackendKind, Feeder};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod config;

/// DBC Feeder - Synchronize CAN signals with VSS datapoints
#[derive(Parser, Debug)]
#[command(name = "dbcfeeder")]
#[command(about = "Feed CAN signals described by DBC files into VSS, and back", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// DBC file(s) to read message definitions from (comma separated or repeated)
    #[arg(long = "dbcfile", value_name = "FILE", env = "DBC_FILE", value_delimiter = ',')]
    dbc_files: Vec<PathBuf>,

    /// Replay recorded CAN traffic from a candump log
    #[arg(long, value_name = "FILE", env = "CANDUMP_FILE")]
    dumpfile: Option<PathBuf>,

    /// Name of the CAN interface
    #[arg(long, value_name = "DEVICE", env = "CAN_PORT")]
    canport: Option<String>,

    /// Decode SAE J1939 messages
    #[arg(long, env = "USE_J1939")]
    use_j1939: bool,

    /// Read the live bus even if a dump file is configured
    #[arg(long)]
    use_socketcan: bool,

    /// Open the bus interface in CAN-FD mode
    #[arg(long)]
    canfd: bool,

    /// Mapping file between DBC signals and VSS paths
    #[arg(long, value_name = "FILE", env = "MAPPING_FILE")]
    mapping: Option<PathBuf>,

    /// Default values for DBC signals, needed for vss2dbc
    #[arg(long, value_name = "FILE", env = "DBC_DEFAULT_FILE")]
    dbc_default: Option<PathBuf>,

    /// Backend to write VSS datapoints to (datapoint-log, local-broker)
    #[arg(long, value_name = "TYPE", env = "SERVER_TYPE")]
    server_type: Option<BackendKind>,

    /// Output file for the datapoint-log backend (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Accept DBC messages whose signals do not fit the declared length
    #[arg(long)]
    lax_dbc_parsing: bool,

    /// Monitor CAN and forward mapped signals to VSS
    #[arg(long)]
    dbc2vss: bool,

    /// Do not monitor CAN
    #[arg(long)]
    no_dbc2vss: bool,

    /// Monitor VSS target values and send them to CAN
    #[arg(long)]
    vss2dbc: bool,

    /// Do not send to CAN
    #[arg(long)]
    no_vss2dbc: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            dbc_files: self.dbc_files.clone(),
            dump_file: self.dumpfile.clone(),
            can_port: self.canport.clone(),
            use_j1939: self.use_j1939,
            use_socketcan: self.use_socketcan,
            can_fd: self.canfd,
            mapping: self.mapping.clone(),
            dbc_default: self.dbc_default.clone(),
            server_type: self.server_type,
            output: self.output.clone(),
            lax_dbc_parsing: self.lax_dbc_parsing,
            dbc2vss: direction(self.dbc2vss, self.no_dbc2vss),
            vss2dbc: direction(self.vss2dbc, self.no_vss2dbc),
        }
    }
}

/// An explicit "no" beats an explicit "yes"
fn direction(enable: bool, disable: bool) -> Option<bool> {
    if disable {
        Some(false)
    } else if enable {
        Some(true)
    } else {
        None
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("DBC Feeder CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using dbc-feeder library v{}", dbc_feeder::VERSION);

    let file_config = match config::locate_config(args.config.as_deref()) {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(&path)?
        }
        None => {
            log::info!("No configuration file found, using command line and defaults");
            config::AppConfig::default()
        }
    };
    let settings = config::resolve(&args.overrides(), &file_config)?;
    log::debug!("Resolved settings: {:?}", settings);

    let client = create_client(settings.backend_kind, &settings.backend)
        .context("Failed to create backend client")?;
    let feeder = Arc::new(Feeder::new(client, settings.dbc2vss, settings.vss2dbc));
    install_stop_handler(feeder.clone())?;

    log::info!("Starting CAN feeder");
    feeder.start(&settings.feeder).context("Feeder failed")?;

    Ok(())
}

/// Stop the feeder on Ctrl+C / SIGTERM; a second request exits at once
fn install_stop_handler(feeder: Arc<Feeder>) -> Result<()> {
    let requested = AtomicBool::new(false);

    ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) || !feeder.is_running() {
            log::warn!("Shutting down now!");
            std::process::exit(1);
        }
        log::info!("Received stop request, stopping...");
        feeder.stop();
    })
    .context("Failed to install signal handler")
}

/// Initialize logging based on verbosity level
///
/// `RUST_LOG`, when set, refines the level chosen by the flags.
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
