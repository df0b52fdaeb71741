//! End-to-end tests: DBC and mapping files on disk, in-memory frame
//! sources, a local broker and a recording transmitter.

use dbc_feeder::backend::{create_client, BackendConfig, BackendKind, LocalBroker};
use dbc_feeder::bus::ChannelTransmitter;
use dbc_feeder::formats::ChannelFrameSource;
use dbc_feeder::signals::load_database;
use dbc_feeder::{Bus, CanFrame, DecodeMode, Feeder, FeederConfig, FeederError, Mapper, SignalValue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const VEHICLE_DBC: &str = r#"
VERSION ""

NS_ :
    CM_
    VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 Lights: 1 ECU1
 SG_ LowBeam : 0|1@1+ (1,0) [0|1] "" ECU2
 SG_ HighBeam : 1|1@1+ (1,0) [0|1] "" ECU2

BO_ 512 Engine: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ Gear : 16|4@1+ (1,0) [0|15] "" ECU2

BO_ 2365515262 EngineHours: 8 ECU1
 SG_ TotalHours : 0|32@1+ (0.05,0) [0|210554060.75] "h" ECU2

VAL_ 512 Gear 0 "Park" 1 "Drive" 2 "Reverse" ;
"#;

const MAPPING: &str = r#"{
  "Vehicle": {
    "type": "branch",
    "children": {
      "Powertrain": {
        "children": {
          "Engine": {
            "children": {
              "Speed": {"datatype": "uint16", "dbc2vss": {"signal": "EngineSpeed", "change_threshold": 1}},
              "EngineHours": {"datatype": "float", "dbc2vss": {"signal": "TotalHours"}}
            }
          },
          "Transmission": {
            "children": {
              "DriveMode": {
                "datatype": "string",
                "dbc2vss": {"signal": "Gear", "on_change": true,
                            "transform": {"mapping": [{"from": "Drive", "to": "DRIVE"}, {"from": "Reverse", "to": "REVERSE"}]}}
              }
            }
          }
        }
      },
      "Body": {
        "children": {
          "Lights": {
            "children": {
              "Beam": {
                "children": {
                  "Low": {"children": {"IsOn": {"datatype": "boolean", "vss2dbc": {"signal": "LowBeam"}}}},
                  "High": {"children": {"IsOn": {"datatype": "boolean", "vss2dbc": {"signal": "HighBeam"}}}}
                }
              }
            }
          }
        }
      }
    }
  }
}"#;

const DEFAULTS: &str = r#"{"HighBeam": 0, "LowBeam": 0}"#;

const SPEED: &str = "Vehicle.Powertrain.Engine.Speed";
const DRIVE_MODE: &str = "Vehicle.Powertrain.Transmission.DriveMode";
const ENGINE_HOURS: &str = "Vehicle.Powertrain.Engine.EngineHours";
const LOW_BEAM: &str = "Vehicle.Body.Lights.Beam.Low.IsOn";
const HIGH_BEAM: &str = "Vehicle.Body.Lights.Beam.High.IsOn";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vehicle.dbc"), VEHICLE_DBC).unwrap();
        std::fs::write(dir.path().join("vss_dbc.json"), MAPPING).unwrap();
        std::fs::write(dir.path().join("dbc_default_values.json"), DEFAULTS).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn mapper(&self) -> Mapper {
        let database = load_database(&[self.path("vehicle.dbc")], true).unwrap();
        Mapper::from_files(
            database,
            &self.path("vss_dbc.json"),
            Some(self.path("dbc_default_values.json").as_path()),
        )
        .unwrap()
    }
}

fn engine_frame(speed: u16, gear: u8) -> CanFrame {
    let [lo, hi] = speed.to_le_bytes();
    CanFrame::new(0x200, vec![lo, hi, gear, 0, 0, 0, 0, 0])
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

fn all_paths_broker() -> Arc<LocalBroker> {
    Arc::new(LocalBroker::new().with_paths([SPEED, DRIVE_MODE, ENGINE_HOURS, LOW_BEAM, HIGH_BEAM]))
}

/// Start `feeder.run` on a thread with an in-memory bus
fn run_in_background(
    feeder: &Arc<Feeder>,
    mapper: Mapper,
    mode: DecodeMode,
) -> (
    JoinHandle<dbc_feeder::Result<()>>,
    crossbeam_channel::Sender<CanFrame>,
    crossbeam_channel::Receiver<CanFrame>,
) {
    let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
    let (sent_tx, sent_rx) = crossbeam_channel::unbounded();
    let bus = Bus::new(Box::new(ChannelFrameSource::new(frames_rx)))
        .with_transmitter(Box::new(ChannelTransmitter::new(sent_tx)));

    let handle = {
        let feeder = feeder.clone();
        std::thread::spawn(move || feeder.run(mapper, mode, bus))
    };
    assert!(wait_until(Duration::from_secs(3), || feeder.is_running()));
    (handle, frames_tx, sent_rx)
}

fn values_for(broker: &LocalBroker, path: &str) -> Vec<SignalValue> {
    broker
        .updates()
        .into_iter()
        .filter(|(p, _)| p == path)
        .map(|(_, value)| value)
        .collect()
}

#[test]
fn test_engine_speed_threshold_end_to_end() {
    let fixture = Fixture::new();
    let broker = all_paths_broker();
    let feeder = Arc::new(Feeder::new(broker.clone(), true, false));
    let (handle, frames, _sent) = run_in_background(&feeder, fixture.mapper(), DecodeMode::Dbc);

    for speed in [1000, 1000, 1000, 1000, 1000, 1005] {
        frames.send(engine_frame(speed, 0)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || values_for(&broker, SPEED).len() >= 2));

    feeder.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(
        values_for(&broker, SPEED),
        vec![SignalValue::Integer(1000), SignalValue::Integer(1005)]
    );
    assert!(feeder.stats().forwarded >= 2);
}

#[test]
fn test_unmapped_values_never_reach_the_backend() {
    let fixture = Fixture::new();
    let broker = all_paths_broker();
    let feeder = Arc::new(Feeder::new(broker.clone(), true, false));
    let (handle, frames, _sent) = run_in_background(&feeder, fixture.mapper(), DecodeMode::Dbc);

    // "Park" has no entry in the lookup table
    frames.send(engine_frame(0, 0)).unwrap();
    frames.send(engine_frame(0, 0)).unwrap();
    frames.send(engine_frame(0, 1)).unwrap();
    assert!(wait_until(Duration::from_secs(3), || !values_for(&broker, DRIVE_MODE).is_empty()));

    feeder.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(values_for(&broker, DRIVE_MODE), vec![SignalValue::from("DRIVE")]);
}

#[test]
fn test_missing_registration_stops_the_feeder() {
    let fixture = Fixture::new();
    // EngineHours is not known to the broker
    let broker = Arc::new(LocalBroker::new().with_paths([SPEED, DRIVE_MODE]));
    let feeder = Arc::new(Feeder::new(broker.clone(), true, false));

    let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
    frames_tx.send(engine_frame(1000, 1)).unwrap();
    let bus = Bus::new(Box::new(ChannelFrameSource::new(frames_rx)));

    let result = feeder.run(fixture.mapper(), DecodeMode::Dbc, bus);
    match result {
        Err(FeederError::Registration(missing)) => assert_eq!(missing, vec![ENGINE_HOURS.to_string()]),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(broker.updates().is_empty());
    assert!(!feeder.is_running());
}

#[test]
fn test_low_beam_target_is_encoded_with_default() {
    let fixture = Fixture::new();
    let broker = all_paths_broker();
    let feeder = Arc::new(Feeder::new(broker.clone(), false, true));
    let (handle, _frames, sent) = run_in_background(&feeder, fixture.mapper(), DecodeMode::Dbc);

    assert!(wait_until(Duration::from_secs(3), || broker.subscriber_count() == 1));
    broker.set_target(LOW_BEAM, SignalValue::Boolean(true)).unwrap();

    let frame = sent.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.can_id, 0x123);
    assert_eq!(frame.data, vec![0x01]);
    assert!(sent.recv_timeout(Duration::from_millis(200)).is_err());

    // Both beams in one batch: still one frame
    broker
        .set_targets(vec![
            (LOW_BEAM.to_string(), SignalValue::Boolean(false)),
            (HIGH_BEAM.to_string(), SignalValue::Boolean(true)),
        ])
        .unwrap();
    let frame = sent.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.data, vec![0x02]);
    assert!(sent.recv_timeout(Duration::from_millis(200)).is_err());

    feeder.stop();
    handle.join().unwrap().unwrap();
    assert_eq!(broker.subscriber_count(), 0);
}

#[test]
fn test_j1939_pgn_matching() {
    let fixture = Fixture::new();
    let broker = all_paths_broker();
    let feeder = Arc::new(Feeder::new(broker.clone(), true, false));
    let (handle, frames, _sent) = run_in_background(&feeder, fixture.mapper(), DecodeMode::J1939);

    // PGN 0xFEE5 from source address 0x17 instead of 0xFE
    let raw_hours: u32 = 200;
    let mut data = raw_hours.to_le_bytes().to_vec();
    data.extend_from_slice(&[0xFF; 4]);
    frames.send(CanFrame::new(0x18FE_E517, data)).unwrap();

    assert!(wait_until(Duration::from_secs(3), || !values_for(&broker, ENGINE_HOURS).is_empty()));
    feeder.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(values_for(&broker, ENGINE_HOURS), vec![SignalValue::Float(10.0)]);
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_start_replays_candump_into_datapoint_log() {
    let fixture = Fixture::new();
    std::fs::write(
        fixture.path("candump.log"),
        "(1700000000.000000) vcan0 200#E803000000000000\n\
         (1700000000.010000) vcan0 200#E803000000000000\n\
         (1700000000.020000) vcan0 200#ED03000000000000\n",
    )
    .unwrap();

    let output = fixture.path("datapoints.txt");
    let kind = BackendKind::DatapointLog;
    let client = create_client(kind, &BackendConfig::default().with_output_file(output.clone())).unwrap();
    let feeder = Arc::new(Feeder::new(client, true, false));

    let config = FeederConfig::new("vcan0")
        .add_dbc_file(fixture.path("vehicle.dbc"))
        .with_mapping_file(fixture.path("vss_dbc.json"))
        .with_replay_file(fixture.path("candump.log"));

    let handle = {
        let feeder = feeder.clone();
        std::thread::spawn(move || feeder.start(&config))
    };

    assert!(wait_until(Duration::from_secs(5), || read_lines(&output).len() >= 2));
    feeder.stop();
    handle.join().unwrap().unwrap();

    let lines = read_lines(&output);
    assert_eq!(
        &lines[..2],
        &[
            format!("Datapoint({}, 1000)", SPEED),
            format!("Datapoint({}, 1005)", SPEED),
        ]
    );
}

#[test]
fn test_start_rejects_vss2dbc_on_replay() {
    let fixture = Fixture::new();
    std::fs::write(fixture.path("candump.log"), "(0.000000) vcan0 200#E803\n").unwrap();

    let feeder = Feeder::new(all_paths_broker(), false, true);
    let config = FeederConfig::new("vcan0")
        .add_dbc_file(fixture.path("vehicle.dbc"))
        .with_mapping_file(fixture.path("vss_dbc.json"))
        .with_default_values_file(fixture.path("dbc_default_values.json"))
        .with_replay_file(fixture.path("candump.log"));

    assert!(matches!(feeder.start(&config), Err(FeederError::Configuration(_))));
    assert!(!feeder.is_running());
}

#[test]
fn test_start_fails_on_missing_mapping_file() {
    let fixture = Fixture::new();
    let feeder = Feeder::new(all_paths_broker(), true, false);
    let config = FeederConfig::new("vcan0")
        .add_dbc_file(fixture.path("vehicle.dbc"))
        .with_mapping_file(fixture.path("missing.json"));

    assert!(feeder.start(&config).is_err());
    assert!(!feeder.is_running());
}
