//! Mapping rules between DBC signals and VSS paths

use super::transform::{Transform, VssDatatype};
use crate::types::SignalValue;
use std::time::Duration;

/// When a transformed value is worth forwarding
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ChangeCondition {
    /// Forward every value
    #[default]
    Always,
    /// Forward when the value differs from the last forwarded one
    OnChange,
    /// Forward when a numeric value moved by at least the threshold
    Threshold(f64),
    /// Forward when the value leaves the band it was last reported in
    Hysteresis { low: f64, high: f64 },
}

impl ChangeCondition {
    /// Decide whether `value` should be forwarded after `last`
    ///
    /// The first value of a signal always passes.
    pub fn is_fulfilled(&self, last: Option<&SignalValue>, value: &SignalValue) -> bool {
        let Some(last) = last else {
            return true;
        };

        match *self {
            ChangeCondition::Always => true,
            ChangeCondition::OnChange => !last.same_as(value),
            ChangeCondition::Threshold(threshold) => match (last.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) if last.is_numeric() && value.is_numeric() => (b - a).abs() >= threshold,
                _ => !last.same_as(value),
            },
            ChangeCondition::Hysteresis { low, high } => match (last.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) => {
                    if a >= high {
                        b <= low
                    } else {
                        b >= high
                    }
                }
                _ => !last.same_as(value),
            },
        }
    }
}

/// dbc2vss rule: one DBC signal feeding one VSS path
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardMapping {
    pub signal_name: String,
    pub vss_path: String,
    /// Datatype of the VSS leaf, when declared
    pub datatype: Option<VssDatatype>,
    pub transform: Transform,
    pub condition: ChangeCondition,
    /// Minimum time between two queued observations
    pub interval: Option<Duration>,
}

impl ForwardMapping {
    pub fn new(signal_name: impl Into<String>, vss_path: impl Into<String>) -> Self {
        Self {
            signal_name: signal_name.into(),
            vss_path: vss_path.into(),
            datatype: None,
            transform: Transform::Identity,
            condition: ChangeCondition::Always,
            interval: None,
        }
    }

    /// Builder method: set the VSS datatype
    pub fn with_datatype(mut self, datatype: VssDatatype) -> Self {
        self.datatype = Some(datatype);
        self
    }

    /// Builder method: set the transform
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Builder method: set the change condition
    pub fn with_condition(mut self, condition: ChangeCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Builder method: set the minimum interval between observations
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// vss2dbc rule: a VSS path whose target value drives a DBC signal
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseMapping {
    pub vss_path: String,
    pub signal_name: String,
    pub transform: Transform,
}

impl ReverseMapping {
    pub fn new(vss_path: impl Into<String>, signal_name: impl Into<String>) -> Self {
        Self {
            vss_path: vss_path.into(),
            signal_name: signal_name.into(),
            transform: Transform::Identity,
        }
    }

    /// Builder method: set the transform
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_always_passes() {
        for condition in [
            ChangeCondition::Always,
            ChangeCondition::OnChange,
            ChangeCondition::Threshold(10.0),
            ChangeCondition::Hysteresis { low: 1.0, high: 2.0 },
        ] {
            assert!(condition.is_fulfilled(None, &SignalValue::Integer(0)));
        }
    }

    #[test]
    fn test_on_change() {
        let condition = ChangeCondition::OnChange;
        let last = SignalValue::Integer(5);
        assert!(!condition.is_fulfilled(Some(&last), &SignalValue::Float(5.0)));
        assert!(condition.is_fulfilled(Some(&last), &SignalValue::Integer(6)));
    }

    #[test]
    fn test_threshold() {
        let condition = ChangeCondition::Threshold(1.0);
        let last = SignalValue::Integer(1000);
        assert!(!condition.is_fulfilled(Some(&last), &SignalValue::Float(1000.5)));
        assert!(condition.is_fulfilled(Some(&last), &SignalValue::Integer(1001)));
        assert!(condition.is_fulfilled(Some(&SignalValue::from("Park")), &SignalValue::from("Drive")));
    }

    #[test]
    fn test_hysteresis() {
        let condition = ChangeCondition::Hysteresis { low: 10.0, high: 20.0 };
        let low_band = SignalValue::Float(5.0);
        assert!(!condition.is_fulfilled(Some(&low_band), &SignalValue::Float(15.0)));
        assert!(condition.is_fulfilled(Some(&low_band), &SignalValue::Float(20.0)));

        let high_band = SignalValue::Float(25.0);
        assert!(!condition.is_fulfilled(Some(&high_band), &SignalValue::Float(11.0)));
        assert!(condition.is_fulfilled(Some(&high_band), &SignalValue::Float(9.5)));
    }
}
