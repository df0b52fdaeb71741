//! Mapping and default-value file loading
//!
//! The mapping file is a VSS tree in JSON. Branches nest their members under
//! `children`; the keys along the way form the dotted VSS path. Leaves carry
//! a `dbc2vss` (or legacy `dbc`) object and/or a `vss2dbc` object:
//!
//! ```json
//! { "Vehicle": { "type": "branch", "children": {
//!     "Speed": { "type": "sensor", "datatype": "float",
//!                "dbc2vss": { "signal": "DI_uiSpeed", "interval_ms": 100,
//!                             "transform": { "math": "floor(x)" } } } } } }
//! ```

use super::expression::Expression;
use super::rules::{ChangeCondition, ForwardMapping, ReverseMapping};
use super::transform::{MappingEntry, Transform, VssDatatype};
use crate::types::{FeederError, Result, SignalValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Rules read from a mapping file
#[derive(Debug, Clone, Default)]
pub struct MappingDefinitions {
    pub forward: Vec<ForwardMapping>,
    pub reverse: Vec<ReverseMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawTransform {
    Math(String),
    Mapping(Vec<MappingEntry>),
}

#[derive(Debug, Deserialize)]
struct RawHysteresis {
    low: f64,
    high: f64,
}

#[derive(Debug, Deserialize)]
struct RawForward {
    signal: String,
    #[serde(default)]
    interval_ms: Option<u64>,
    #[serde(default)]
    on_change: bool,
    #[serde(default)]
    change_threshold: Option<f64>,
    #[serde(default)]
    hysteresis: Option<RawHysteresis>,
    #[serde(default)]
    transform: Option<RawTransform>,
}

#[derive(Debug, Deserialize)]
struct RawReverse {
    signal: String,
    #[serde(default)]
    transform: Option<RawTransform>,
}

/// Load a mapping file from disk
pub fn load_mapping_file(path: &Path) -> Result<MappingDefinitions> {
    log::info!("Reading mapping definitions from {:?}", path);

    let content = std::fs::read_to_string(path).map_err(|e| {
        FeederError::MappingParse(format!("Failed to read mapping file {:?}: {}", path, e))
    })?;
    let definitions = parse_mapping_str(&content)?;

    log::info!(
        "Loaded {} dbc2vss and {} vss2dbc rules from {:?}",
        definitions.forward.len(),
        definitions.reverse.len(),
        path
    );
    Ok(definitions)
}

/// Parse mapping definitions from JSON text
pub fn parse_mapping_str(content: &str) -> Result<MappingDefinitions> {
    let root: Value = serde_json::from_str(content)
        .map_err(|e| FeederError::MappingParse(format!("Invalid mapping JSON: {}", e)))?;
    let tree = root
        .as_object()
        .ok_or_else(|| FeederError::MappingParse("Mapping root must be an object".to_string()))?;

    let mut definitions = MappingDefinitions::default();
    walk_tree(tree, "", &mut definitions)?;
    Ok(definitions)
}

fn walk_tree(nodes: &Map<String, Value>, prefix: &str, definitions: &mut MappingDefinitions) -> Result<()> {
    for (name, node) in nodes {
        let Some(node) = node.as_object() else {
            continue;
        };

        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };

        if let Some(children) = node.get("children").and_then(Value::as_object) {
            walk_tree(children, &path, definitions)?;
        }

        let forward = node.get("dbc2vss").or_else(|| node.get("dbc"));
        let reverse = node.get("vss2dbc");
        if forward.is_none() && reverse.is_none() {
            continue;
        }

        let datatype = match node.get("datatype").and_then(Value::as_str) {
            Some(name) => Some(
                name.parse::<VssDatatype>()
                    .map_err(|e| FeederError::MappingParse(format!("{}: {}", path, e)))?,
            ),
            None => None,
        };

        if let Some(entry) = forward {
            definitions.forward.push(forward_rule(&path, datatype, entry)?);
        }
        if let Some(entry) = reverse {
            definitions.reverse.push(reverse_rule(&path, entry)?);
        }
    }

    Ok(())
}

fn forward_rule(path: &str, datatype: Option<VssDatatype>, entry: &Value) -> Result<ForwardMapping> {
    let entry: RawForward = serde_json::from_value(entry.clone())
        .map_err(|e| FeederError::MappingParse(format!("{}: invalid dbc2vss entry: {}", path, e)))?;

    let mut conditions = Vec::new();
    if entry.on_change {
        conditions.push(ChangeCondition::OnChange);
    }
    if let Some(threshold) = entry.change_threshold {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(FeederError::MappingParse(format!(
                "{}: change_threshold must be a non-negative number",
                path
            )));
        }
        conditions.push(ChangeCondition::Threshold(threshold));
    }
    if let Some(RawHysteresis { low, high }) = entry.hysteresis {
        if low > high {
            return Err(FeederError::MappingParse(format!(
                "{}: hysteresis low ({}) is above high ({})",
                path, low, high
            )));
        }
        conditions.push(ChangeCondition::Hysteresis { low, high });
    }
    if conditions.len() > 1 {
        return Err(FeederError::MappingParse(format!(
            "{}: on_change, change_threshold and hysteresis are mutually exclusive",
            path
        )));
    }

    let mut rule = ForwardMapping::new(entry.signal, path)
        .with_transform(transform(path, entry.transform)?)
        .with_condition(conditions.pop().unwrap_or_default());
    if let Some(datatype) = datatype {
        rule = rule.with_datatype(datatype);
    }
    if let Some(ms) = entry.interval_ms.filter(|ms| *ms > 0) {
        rule = rule.with_interval(Duration::from_millis(ms));
    }

    Ok(rule)
}

fn reverse_rule(path: &str, entry: &Value) -> Result<ReverseMapping> {
    let entry: RawReverse = serde_json::from_value(entry.clone())
        .map_err(|e| FeederError::MappingParse(format!("{}: invalid vss2dbc entry: {}", path, e)))?;

    Ok(ReverseMapping::new(path, entry.signal).with_transform(transform(path, entry.transform)?))
}

fn transform(path: &str, raw: Option<RawTransform>) -> Result<Transform> {
    Ok(match raw {
        None => Transform::Identity,
        Some(RawTransform::Math(source)) => Transform::Math(
            Expression::parse(&source)
                .map_err(|e| FeederError::MappingParse(format!("{}: bad math transform: {}", path, e)))?,
        ),
        Some(RawTransform::Mapping(entries)) => Transform::Lookup(entries),
    })
}

/// Load the default-value file (`{ "<signal>": <value> }`)
pub fn load_defaults_file(path: &Path) -> Result<HashMap<String, SignalValue>> {
    log::info!("Reading default values from {:?}", path);

    let content = std::fs::read_to_string(path).map_err(|e| {
        FeederError::MappingParse(format!("Failed to read default value file {:?}: {}", path, e))
    })?;
    parse_defaults_str(&content)
}

/// Parse default values from JSON text
pub fn parse_defaults_str(content: &str) -> Result<HashMap<String, SignalValue>> {
    serde_json::from_str(content)
        .map_err(|e| FeederError::MappingParse(format!("Invalid default value JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"{
      "Vehicle": {
        "type": "branch",
        "children": {
          "Speed": {
            "type": "sensor",
            "datatype": "float",
            "dbc2vss": {"signal": "DI_uiSpeed", "interval_ms": 5000, "transform": {"math": "floor(x)"}}
          },
          "Body": {
            "type": "branch",
            "children": {
              "Lights": {
                "type": "branch",
                "children": {
                  "IsLowBeamOn": {
                    "datatype": "boolean",
                    "dbc": {"signal": "LowBeam", "on_change": true},
                    "vss2dbc": {"signal": "LowBeam", "transform": {"mapping": [{"from": false, "to": 0}, {"from": true, "to": 1}]}}
                  }
                }
              }
            }
          },
          "Powertrain": {
            "children": {
              "Engine": {
                "children": {
                  "Speed": {"datatype": "uint16", "dbc2vss": {"signal": "EngineSpeed", "change_threshold": 1}}
                }
              }
            }
          }
        }
      }
    }"#;

    #[test]
    fn test_parse_tree() {
        let definitions = parse_mapping_str(MAPPING).unwrap();
        assert_eq!(definitions.forward.len(), 3);
        assert_eq!(definitions.reverse.len(), 1);

        let speed = definitions
            .forward
            .iter()
            .find(|r| r.signal_name == "DI_uiSpeed")
            .unwrap();
        assert_eq!(speed.vss_path, "Vehicle.Speed");
        assert_eq!(speed.datatype, Some(VssDatatype::Float));
        assert_eq!(speed.interval, Some(Duration::from_millis(5000)));
        assert!(matches!(speed.transform, Transform::Math(_)));

        let low_beam = definitions.forward.iter().find(|r| r.signal_name == "LowBeam").unwrap();
        assert_eq!(low_beam.vss_path, "Vehicle.Body.Lights.IsLowBeamOn");
        assert_eq!(low_beam.condition, ChangeCondition::OnChange);

        let engine = definitions
            .forward
            .iter()
            .find(|r| r.signal_name == "EngineSpeed")
            .unwrap();
        assert_eq!(engine.vss_path, "Vehicle.Powertrain.Engine.Speed");
        assert_eq!(engine.condition, ChangeCondition::Threshold(1.0));

        let reverse = &definitions.reverse[0];
        assert_eq!(reverse.vss_path, "Vehicle.Body.Lights.IsLowBeamOn");
        assert!(matches!(reverse.transform, Transform::Lookup(ref entries) if entries.len() == 2));
    }

    #[test]
    fn test_rejects_bad_entries() {
        let bad_math = r#"{"A": {"dbc2vss": {"signal": "S", "transform": {"math": "x +"}}}}"#;
        assert!(matches!(parse_mapping_str(bad_math), Err(FeederError::MappingParse(_))));

        let missing_signal = r#"{"A": {"dbc2vss": {"interval_ms": 10}}}"#;
        assert!(parse_mapping_str(missing_signal).is_err());

        let conflicting = r#"{"A": {"dbc2vss": {"signal": "S", "on_change": true, "change_threshold": 2}}}"#;
        assert!(parse_mapping_str(conflicting).is_err());

        let bad_type = r#"{"A": {"datatype": "quaternion", "dbc2vss": {"signal": "S"}}}"#;
        assert!(parse_mapping_str(bad_type).is_err());

        assert!(parse_mapping_str("[1, 2]").is_err());
    }

    #[test]
    fn test_parse_defaults() {
        let defaults = parse_defaults_str(r#"{"HighBeam": 0, "Gear": "Park", "Ratio": 0.5}"#).unwrap();
        assert_eq!(defaults["HighBeam"], SignalValue::Integer(0));
        assert_eq!(defaults["Gear"], SignalValue::from("Park"));
        assert_eq!(defaults["Ratio"], SignalValue::Float(0.5));
    }
}
