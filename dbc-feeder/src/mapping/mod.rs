//! Mapping engine between DBC signals and VSS paths
//!
//! The `Mapper` holds the immutable rule tables built at startup and one
//! lock-guarded table of per-signal state: the last value forwarded to VSS,
//! the time the last observation was queued, and the last target value
//! received for re-encoding.

pub mod expression;
pub mod loader;
pub mod rules;
pub mod transform;

pub use expression::Expression;
pub use loader::{load_defaults_file, load_mapping_file, parse_defaults_str, parse_mapping_str, MappingDefinitions};
pub use rules::{ChangeCondition, ForwardMapping, ReverseMapping};
pub use transform::{MappingEntry, Transform, VssDatatype};

use crate::signals::{MessageDefinition, SignalDatabase};
use crate::types::{FeederError, Result, SignalValue, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Default)]
struct SignalState {
    last_forwarded: Option<SignalValue>,
    last_queued_at: Option<Timestamp>,
    target: Option<SignalValue>,
}

/// Translation tables plus per-signal runtime state
#[derive(Debug)]
pub struct Mapper {
    database: SignalDatabase,
    /// Key: DBC signal name
    forward: HashMap<String, ForwardMapping>,
    /// Key: VSS path
    reverse: BTreeMap<String, Vec<ReverseMapping>>,
    defaults: HashMap<String, SignalValue>,
    state: Mutex<HashMap<String, SignalState>>,
}

impl Mapper {
    /// Build a mapper from rule definitions
    ///
    /// Fails on a second forward rule for the same signal and on rules that
    /// name signals the database does not know.
    pub fn new(
        database: SignalDatabase,
        definitions: MappingDefinitions,
        defaults: HashMap<String, SignalValue>,
    ) -> Result<Self> {
        let mut forward: HashMap<String, ForwardMapping> = HashMap::new();
        for rule in definitions.forward {
            if database.find_signal(&rule.signal_name).is_none() {
                return Err(FeederError::Configuration(format!(
                    "dbc2vss rule for {} refers to unknown DBC signal '{}'",
                    rule.vss_path, rule.signal_name
                )));
            }
            if let Some(existing) = forward.get(&rule.signal_name) {
                return Err(FeederError::Configuration(format!(
                    "Signal '{}' is mapped to both {} and {}",
                    rule.signal_name, existing.vss_path, rule.vss_path
                )));
            }
            forward.insert(rule.signal_name.clone(), rule);
        }

        let mut reverse: BTreeMap<String, Vec<ReverseMapping>> = BTreeMap::new();
        for rule in definitions.reverse {
            if database.find_signal(&rule.signal_name).is_none() {
                return Err(FeederError::Configuration(format!(
                    "vss2dbc rule for {} refers to unknown DBC signal '{}'",
                    rule.vss_path, rule.signal_name
                )));
            }
            reverse.entry(rule.vss_path.clone()).or_default().push(rule);
        }

        let mapper = Self {
            database,
            forward,
            reverse,
            defaults,
            state: Mutex::new(HashMap::new()),
        };
        mapper.report_missing_defaults();

        Ok(mapper)
    }

    /// Load DBC, mapping and default-value files
    pub fn from_files(
        database: SignalDatabase,
        mapping_file: &Path,
        default_values_file: Option<&Path>,
    ) -> Result<Self> {
        let definitions = load_mapping_file(mapping_file)?;
        let defaults = match default_values_file {
            Some(path) => load_defaults_file(path)?,
            None => HashMap::new(),
        };
        Self::new(database, definitions, defaults)
    }

    fn report_missing_defaults(&self) {
        let signals: HashSet<&str> = self
            .reverse
            .values()
            .flatten()
            .map(|rule| rule.signal_name.as_str())
            .collect();

        for message in self.messages_for_signals(signals) {
            for signal in &message.signals {
                if !self.defaults.contains_key(&signal.name) {
                    log::warn!(
                        "No default value for signal {} of vss2dbc message {} (0x{:X}); \
                         it must be set before the message can be sent",
                        signal.name,
                        message.name,
                        message.id
                    );
                }
            }
        }
    }

    /// The DBC database the rules refer to
    pub fn database(&self) -> &SignalDatabase {
        &self.database
    }

    pub fn has_dbc2vss_mapping(&self) -> bool {
        !self.forward.is_empty()
    }

    pub fn has_vss2dbc_mapping(&self) -> bool {
        !self.reverse.is_empty()
    }

    /// IDs of every message carrying a forward-mapped signal
    pub fn frame_id_whitelist(&self) -> BTreeSet<u32> {
        self.forward
            .keys()
            .flat_map(|signal| self.database.messages_with_signal(signal))
            .map(|message| message.id)
            .collect()
    }

    /// All dbc2vss destinations
    pub fn vss_names(&self) -> BTreeSet<String> {
        self.forward.values().map(|rule| rule.vss_path.clone()).collect()
    }

    /// Forward rule for a signal, if it has one
    pub fn forward_rule(&self, signal_name: &str) -> Option<&ForwardMapping> {
        self.forward.get(signal_name)
    }

    /// Forward rule for a signal that must be mapped
    pub fn resolve_forward(&self, signal_name: &str) -> Result<&ForwardMapping> {
        self.forward
            .get(signal_name)
            .ok_or_else(|| FeederError::UnmappedSignal(signal_name.to_string()))
    }

    /// Apply the rule's transform and datatype coercion
    ///
    /// `None` means the observation is dropped.
    pub fn transform(&self, rule: &ForwardMapping, raw: &SignalValue) -> Option<SignalValue> {
        let value = rule.transform.apply(raw)?;
        match rule.datatype {
            Some(datatype) => {
                let coerced = datatype.coerce(value.clone());
                if coerced.is_none() {
                    log::debug!(
                        "Cannot convert {} value {} for {} to {:?}",
                        value.type_name(),
                        value,
                        rule.vss_path,
                        datatype
                    );
                }
                coerced
            }
            None => Some(value),
        }
    }

    /// Check the rule's change condition and remember `value` if it passes
    pub fn condition_fulfilled(&self, rule: &ForwardMapping, value: &SignalValue) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(rule.signal_name.clone()).or_default();

        let fulfilled = rule.condition.is_fulfilled(entry.last_forwarded.as_ref(), value);
        if fulfilled {
            entry.last_forwarded = Some(value.clone());
        }
        fulfilled
    }

    /// Check the rule's minimum interval and remember `time` if it passes
    pub fn time_condition_fulfilled(&self, rule: &ForwardMapping, time: Timestamp) -> bool {
        let Some(interval) = rule.interval else {
            return true;
        };

        let mut state = self.state.lock();
        let entry = state.entry(rule.signal_name.clone()).or_default();

        if let Some(last) = entry.last_queued_at {
            let elapsed = time.signed_duration_since(last);
            if elapsed.to_std().map_or(true, |elapsed| elapsed < interval) {
                return false;
            }
        }
        entry.last_queued_at = Some(time);
        true
    }

    /// All VSS paths driving DBC signals
    pub fn vss2dbc_paths(&self) -> BTreeSet<String> {
        self.reverse.keys().cloned().collect()
    }

    /// Record a new target value for every rule of `path`
    ///
    /// Returns the signals whose target changed.
    pub fn apply_update(&self, path: &str, value: &SignalValue) -> HashSet<String> {
        let mut affected = HashSet::new();
        let Some(rules) = self.reverse.get(path) else {
            log::warn!("Received target value for {} which has no vss2dbc mapping", path);
            return affected;
        };

        let mut state = self.state.lock();
        for rule in rules {
            match rule.transform.apply(value) {
                Some(signal_value) => {
                    log::debug!(
                        "Target {} = {} sets signal {} to {}",
                        path,
                        value,
                        rule.signal_name,
                        signal_value
                    );
                    state.entry(rule.signal_name.clone()).or_default().target = Some(signal_value);
                    affected.insert(rule.signal_name.clone());
                }
                None => log::warn!(
                    "Target value {} for {} has no valid value for signal {}",
                    value,
                    path,
                    rule.signal_name
                ),
            }
        }

        affected
    }

    /// Distinct messages carrying any of the given signals, by frame ID
    pub fn messages_for_signals<I, S>(&self, signal_names: I) -> Vec<&MessageDefinition>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut messages: BTreeMap<u32, &MessageDefinition> = BTreeMap::new();
        for name in signal_names {
            for message in self.database.messages_with_signal(name.as_ref()) {
                messages.entry(message.id).or_insert(message);
            }
        }
        messages.into_values().collect()
    }

    /// Values for every signal of a message: last target, else default
    ///
    /// Signals with neither are left out, which makes encoding fail.
    pub fn values_for_message(&self, frame_id: u32) -> HashMap<String, SignalValue> {
        let mut values = HashMap::new();
        let Some(message) = self.database.get_message(frame_id) else {
            return values;
        };

        let state = self.state.lock();
        for signal in &message.signals {
            let value = state
                .get(&signal.name)
                .and_then(|entry| entry.target.clone())
                .or_else(|| self.defaults.get(&signal.name).cloned());
            match value {
                Some(value) => {
                    values.insert(signal.name.clone(), value);
                }
                None => log::debug!("No value for signal {} of message {}", signal.name, message.name),
            }
        }

        values
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signals::database::tests::{message, signal};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    pub(crate) fn lights_database() -> SignalDatabase {
        let mut db = SignalDatabase::new();
        let mut lights = message(0x123, "Lights", vec![signal("LowBeam", 0, 1), signal("HighBeam", 1, 1)]);
        lights.size = 1;
        db.add_message(lights);
        db.add_message(message(0x200, "Engine", vec![signal("EngineSpeed", 0, 16)]));
        db
    }

    pub(crate) fn lights_mapper() -> Mapper {
        let definitions = MappingDefinitions {
            forward: vec![
                ForwardMapping::new("EngineSpeed", "Vehicle.Powertrain.Engine.Speed")
                    .with_condition(ChangeCondition::Threshold(1.0)),
                ForwardMapping::new("LowBeam", "Vehicle.Body.Lights.Beam.Low.IsOn")
                    .with_datatype(VssDatatype::Boolean),
            ],
            reverse: vec![
                ReverseMapping::new("Vehicle.Body.Lights.Beam.Low.IsOn", "LowBeam"),
                ReverseMapping::new("Vehicle.Body.Lights.Beam.High.IsOn", "HighBeam"),
            ],
        };
        let defaults = HashMap::from([("HighBeam".to_string(), SignalValue::Integer(0))]);
        Mapper::new(lights_database(), definitions, defaults).unwrap()
    }

    #[test]
    fn test_tables() {
        let mapper = lights_mapper();
        assert!(mapper.has_dbc2vss_mapping());
        assert!(mapper.has_vss2dbc_mapping());
        assert_eq!(mapper.frame_id_whitelist(), BTreeSet::from([0x123, 0x200]));
        assert!(mapper.vss_names().contains("Vehicle.Powertrain.Engine.Speed"));
        assert_eq!(mapper.vss2dbc_paths().len(), 2);
        assert!(matches!(
            mapper.resolve_forward("HighBeam"),
            Err(FeederError::UnmappedSignal(_))
        ));
    }

    #[test]
    fn test_duplicate_forward_rule_is_rejected() {
        let definitions = MappingDefinitions {
            forward: vec![
                ForwardMapping::new("EngineSpeed", "Vehicle.A"),
                ForwardMapping::new("EngineSpeed", "Vehicle.B"),
            ],
            reverse: vec![],
        };
        let result = Mapper::new(lights_database(), definitions, HashMap::new());
        assert!(matches!(result, Err(FeederError::Configuration(_))));
    }

    #[test]
    fn test_unknown_signal_is_rejected() {
        let definitions = MappingDefinitions {
            forward: vec![],
            reverse: vec![ReverseMapping::new("Vehicle.Horn", "HornSwitch")],
        };
        assert!(Mapper::new(lights_database(), definitions, HashMap::new()).is_err());
    }

    #[test]
    fn test_threshold_dedup() {
        let mapper = lights_mapper();
        let rule = mapper.resolve_forward("EngineSpeed").unwrap().clone();

        let forwarded: Vec<i64> = [1000, 1000, 1005]
            .into_iter()
            .filter_map(|raw| mapper.transform(&rule, &SignalValue::Integer(raw)))
            .filter(|value| mapper.condition_fulfilled(&rule, value))
            .filter_map(|value| value.as_i64())
            .collect();
        assert_eq!(forwarded, vec![1000, 1005]);
    }

    #[test]
    fn test_transform_coerces_datatype() {
        let mapper = lights_mapper();
        let rule = mapper.resolve_forward("LowBeam").unwrap();
        assert_eq!(
            mapper.transform(rule, &SignalValue::Integer(1)),
            Some(SignalValue::Boolean(true))
        );
        assert_eq!(mapper.transform(rule, &SignalValue::from("n/a")), None);
    }

    #[test]
    fn test_time_condition() {
        let mapper = lights_mapper();
        let rule = ForwardMapping::new("EngineSpeed", "Vehicle.Powertrain.Engine.Speed")
            .with_interval(Duration::from_millis(100));

        let t0 = Utc::now();
        assert!(mapper.time_condition_fulfilled(&rule, t0));
        assert!(!mapper.time_condition_fulfilled(&rule, t0 + ChronoDuration::milliseconds(50)));
        assert!(mapper.time_condition_fulfilled(&rule, t0 + ChronoDuration::milliseconds(100)));
        assert!(!mapper.time_condition_fulfilled(&rule, t0 + ChronoDuration::milliseconds(150)));

        let unlimited = ForwardMapping::new("LowBeam", "Vehicle.Body.Lights.Beam.Low.IsOn");
        assert!(mapper.time_condition_fulfilled(&unlimited, t0));
        assert!(mapper.time_condition_fulfilled(&unlimited, t0));
    }

    #[test]
    fn test_update_falls_back_to_defaults() {
        let mapper = lights_mapper();

        let affected = mapper.apply_update("Vehicle.Body.Lights.Beam.Low.IsOn", &SignalValue::Boolean(true));
        assert_eq!(affected, HashSet::from(["LowBeam".to_string()]));

        let messages = mapper.messages_for_signals(&affected);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 0x123);

        let values = mapper.values_for_message(0x123);
        assert_eq!(values["LowBeam"], SignalValue::Boolean(true));
        assert_eq!(values["HighBeam"], SignalValue::Integer(0));
    }

    #[test]
    fn test_messages_for_signals_are_distinct() {
        let mapper = lights_mapper();
        let messages = mapper.messages_for_signals(["LowBeam", "HighBeam", "EngineSpeed", "LowBeam"]);
        let ids: Vec<u32> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0x123, 0x200]);
    }

    #[test]
    fn test_update_for_unmapped_path() {
        let mapper = lights_mapper();
        assert!(mapper.apply_update("Vehicle.Unknown", &SignalValue::Integer(1)).is_empty());
        assert!(mapper.values_for_message(0x999).is_empty());
    }
}
