//! Value transforms and VSS datatype coercion

use super::expression::Expression;
use crate::types::SignalValue;
use serde::Deserialize;
use std::str::FromStr;

/// One `from`/`to` pair of a lookup transform
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MappingEntry {
    pub from: SignalValue,
    pub to: SignalValue,
}

/// Transform applied to a value on its way between CAN and VSS
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Transform {
    /// Pass the value through unchanged
    #[default]
    Identity,
    /// Evaluate an arithmetic expression on `x`
    Math(Expression),
    /// Exact lookup; values without an entry are dropped
    Lookup(Vec<MappingEntry>),
}

impl Transform {
    /// Apply the transform; `None` means the value must be dropped
    pub fn apply(&self, value: &SignalValue) -> Option<SignalValue> {
        match self {
            Transform::Identity => Some(value.clone()),
            Transform::Math(expression) => {
                expression.eval(value.as_f64()?).map(SignalValue::Float)
            }
            Transform::Lookup(entries) => entries
                .iter()
                .find(|entry| entry.from.same_as(value))
                .map(|entry| entry.to.clone()),
        }
    }
}

/// VSS leaf datatypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VssDatatype {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    String,
}

impl FromStr for VssDatatype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "boolean" => VssDatatype::Boolean,
            "int8" => VssDatatype::Int8,
            "int16" => VssDatatype::Int16,
            "int32" => VssDatatype::Int32,
            "int64" => VssDatatype::Int64,
            "uint8" => VssDatatype::Uint8,
            "uint16" => VssDatatype::Uint16,
            "uint32" => VssDatatype::Uint32,
            "uint64" => VssDatatype::Uint64,
            "float" => VssDatatype::Float,
            "double" => VssDatatype::Double,
            "string" => VssDatatype::String,
            other => return Err(format!("unsupported VSS datatype '{}'", other)),
        })
    }
}

impl VssDatatype {
    /// Inclusive bounds of the integer types
    fn integer_bounds(self) -> Option<(i128, i128)> {
        Some(match self {
            VssDatatype::Int8 => (i8::MIN as i128, i8::MAX as i128),
            VssDatatype::Int16 => (i16::MIN as i128, i16::MAX as i128),
            VssDatatype::Int32 => (i32::MIN as i128, i32::MAX as i128),
            VssDatatype::Int64 => (i64::MIN as i128, i64::MAX as i128),
            VssDatatype::Uint8 => (0, u8::MAX as i128),
            VssDatatype::Uint16 => (0, u16::MAX as i128),
            VssDatatype::Uint32 => (0, u32::MAX as i128),
            // Values travel as i64
            VssDatatype::Uint64 => (0, i64::MAX as i128),
            _ => return None,
        })
    }

    /// Convert a value to this datatype; `None` if that is impossible
    pub fn coerce(self, value: SignalValue) -> Option<SignalValue> {
        match self {
            VssDatatype::Boolean => value.as_bool().map(SignalValue::Boolean),
            VssDatatype::Float | VssDatatype::Double => match value {
                SignalValue::String(text) => text.trim().parse().ok().map(SignalValue::Float),
                other => other.as_f64().map(SignalValue::Float),
            },
            VssDatatype::String => Some(match value {
                SignalValue::String(text) => SignalValue::String(text),
                other => SignalValue::String(other.to_string()),
            }),
            integer => {
                let (min, max) = integer.integer_bounds()?;
                let number = match value {
                    SignalValue::String(text) => text.trim().parse::<f64>().ok()?,
                    other => other.as_f64()?,
                };
                if !number.is_finite() {
                    return None;
                }
                let rounded = number.round() as i128;
                (min..=max)
                    .contains(&rounded)
                    .then_some(SignalValue::Integer(rounded as i64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_transform() {
        let transform = Transform::Math(Expression::parse("x * 2").unwrap());
        assert_eq!(transform.apply(&SignalValue::Integer(21)), Some(SignalValue::Float(42.0)));
        assert_eq!(transform.apply(&SignalValue::from("Open")), None);
    }

    #[test]
    fn test_lookup_transform() {
        let entries: Vec<MappingEntry> =
            serde_json::from_str(r#"[{"from": 0, "to": false}, {"from": 1, "to": true}, {"from": "Open", "to": 100}]"#)
                .unwrap();
        let transform = Transform::Lookup(entries);

        assert_eq!(transform.apply(&SignalValue::Integer(1)), Some(SignalValue::Boolean(true)));
        assert_eq!(transform.apply(&SignalValue::Float(0.0)), Some(SignalValue::Boolean(false)));
        assert_eq!(transform.apply(&SignalValue::from("Open")), Some(SignalValue::Integer(100)));
        assert_eq!(transform.apply(&SignalValue::Integer(7)), None);
    }

    #[test]
    fn test_coerce_integers() {
        let uint8: VssDatatype = "uint8".parse().unwrap();
        assert_eq!(uint8.coerce(SignalValue::Float(41.6)), Some(SignalValue::Integer(42)));
        assert_eq!(uint8.coerce(SignalValue::Integer(256)), None);
        assert_eq!(uint8.coerce(SignalValue::Integer(-1)), None);
        assert_eq!(uint8.coerce(SignalValue::Boolean(true)), Some(SignalValue::Integer(1)));
        assert_eq!(VssDatatype::Int16.coerce(SignalValue::from("-300")), Some(SignalValue::Integer(-300)));
        assert_eq!(VssDatatype::Int32.coerce(SignalValue::from("Drive")), None);
    }

    #[test]
    fn test_coerce_other_types() {
        assert_eq!(VssDatatype::Float.coerce(SignalValue::Integer(3)), Some(SignalValue::Float(3.0)));
        assert_eq!(VssDatatype::Boolean.coerce(SignalValue::Integer(0)), Some(SignalValue::Boolean(false)));
        assert_eq!(VssDatatype::Boolean.coerce(SignalValue::from("maybe")), None);
        assert_eq!(VssDatatype::String.coerce(SignalValue::Integer(3)), Some(SignalValue::from("3")));
        assert!("quaternion".parse::<VssDatatype>().is_err());
    }
}
