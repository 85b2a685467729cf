use std::fmt;
use std::time::{Duration, SystemTime};

use crate::constants::{
    PARAM_ALARM_ABOVE, PARAM_ALARM_BELOW, PARAM_ALARM_DELAY, PARAM_ALARM_MODE,
    PARAM_ALARM_SETPOINT_TRACKING, PARAM_CAPACITY, PARAM_CAPACITY_UNIT, PARAM_CONTROL_MODE,
    PARAM_MEASURE, PARAM_SERIAL_NUMBER, PARAM_SETPOINT, PARAM_STATUS, PARAM_USER_TAG,
    PARAM_VALVE_OUTPUT,
};

/// Numeric identifier of one instrument parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParameterAddress(pub u16);

impl fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parameter_name(*self) {
            Some(name) => write!(f, "{} ({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

pub fn parameter_name(address: ParameterAddress) -> Option<&'static str> {
    match address {
        PARAM_SERIAL_NUMBER => Some("serial"),
        PARAM_MEASURE => Some("measure"),
        PARAM_SETPOINT => Some("setpoint"),
        PARAM_CONTROL_MODE => Some("control mode"),
        PARAM_CAPACITY => Some("capacity"),
        PARAM_STATUS => Some("status"),
        PARAM_VALVE_OUTPUT => Some("valve output"),
        PARAM_ALARM_ABOVE => Some("alarm above"),
        PARAM_ALARM_BELOW => Some("alarm below"),
        PARAM_ALARM_MODE => Some("alarm mode"),
        PARAM_ALARM_SETPOINT_TRACKING => Some("alarm setpoint tracking"),
        PARAM_CAPACITY_UNIT => Some("unit"),
        PARAM_USER_TAG => Some("user tag"),
        PARAM_ALARM_DELAY => Some("alarm delay"),
        _ => None,
    }
}

/// A decoded parameter value as it travels over the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ParamValue {
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.round() as i64),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Bytes(_) => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Bytes(bytes) => write!(f, "{bytes:02X?}"),
        }
    }
}

/// Severity decoded from the status bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmSeverity {
    Normal,
    Warning,
    Error,
}

/// One poll cycle worth of decoded values.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveReading {
    pub timestamp: SystemTime,
    pub pressure_bar: f64,
    pub valve_percent: Option<f64>,
    pub alarm_status_bits: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Connection(bool),
    Severity(AlarmSeverity),
    CriticalAlarm(u32),
    Pressure { timestamp: SystemTime, bar: f64 },
    ValvePercent(f64),
    PurgeFinished,
    Overrun { elapsed: Duration },
}

#[cfg(test)]
mod tests {
    use super::{ParamValue, ParameterAddress};
    use crate::constants::PARAM_MEASURE;

    #[test]
    fn formats_known_and_unknown_addresses() {
        assert_eq!(PARAM_MEASURE.to_string(), "8 (measure)");
        assert_eq!(ParameterAddress(999).to_string(), "999");
    }

    #[test]
    fn numeric_views_of_values() {
        assert_eq!(ParamValue::Float(12.6).as_integer(), Some(13));
        assert_eq!(ParamValue::Integer(7).as_float(), Some(7.0));
        assert_eq!(ParamValue::Text(" 4.5 ".into()).as_float(), Some(4.5));
        assert_eq!(ParamValue::Bytes(vec![1]).as_integer(), None);
    }
}
