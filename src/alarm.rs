//! Safety-alarm configuration and the rearm cooldown.
//!
//! The instrument trips its alarm once pressure exceeds setpoint + tolerance.
//! After a sharp setpoint decrease the measured pressure needs time to settle,
//! so the alarm is disarmed and only rearmed once pressure is back under the
//! new trip point. There is no retry limit: the cooldown is extended for as
//! long as the pressure stays above the limit.

use std::time::{Duration, Instant};

use crate::constants::{
    ALARM_BELOW_IGNORE, ALARM_OFF, ALARM_ON, PARAM_ALARM_ABOVE, PARAM_ALARM_BELOW,
    PARAM_ALARM_DELAY, PARAM_ALARM_MODE, PARAM_ALARM_SETPOINT_TRACKING, SETPOINT_TRACKING_ON,
};
use crate::data::{ParamValue, ParameterAddress};

pub const DEFAULT_ALARM_TOLERANCE_BAR: f64 = 1.0;
pub const DEFAULT_ALARM_DELAY_SECONDS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyAlarmConfig {
    pub enabled: bool,
    pub tolerance_bar: f64,
    pub delay_seconds: u32,
}

impl Default for SafetyAlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance_bar: DEFAULT_ALARM_TOLERANCE_BAR,
            delay_seconds: DEFAULT_ALARM_DELAY_SECONDS,
        }
    }
}

impl SafetyAlarmConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay_seconds))
    }

    /// True when going from `previous` to `next` is a decrease larger than the tolerance.
    pub fn is_abrupt_decrease(&self, previous: f64, next: f64) -> bool {
        previous - next > self.tolerance_bar
    }
}

/// Register writes that arm the alarm, disable first and enable last.
pub fn alarm_setup_sequence(tolerance_raw: u32, delay_seconds: u32) -> Vec<(ParameterAddress, ParamValue)> {
    vec![
        (PARAM_ALARM_MODE, ParamValue::Integer(ALARM_OFF)),
        (PARAM_ALARM_ABOVE, ParamValue::from(tolerance_raw)),
        (PARAM_ALARM_BELOW, ParamValue::Integer(ALARM_BELOW_IGNORE)),
        (
            PARAM_ALARM_SETPOINT_TRACKING,
            ParamValue::Integer(SETPOINT_TRACKING_ON),
        ),
        (PARAM_ALARM_DELAY, ParamValue::from(delay_seconds)),
        (PARAM_ALARM_MODE, ParamValue::Integer(ALARM_ON)),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownVerdict {
    Waiting,
    /// Pressure is still above the trip limit; keep the alarm disarmed.
    Extend,
    Rearm,
}

/// Pending rearm of a disarmed alarm.
#[derive(Debug, Clone, PartialEq)]
pub struct RearmCooldown {
    pub deadline: Instant,
    pub last_setpoint_bar: f64,
    delay: Duration,
}

impl RearmCooldown {
    pub fn start(now: Instant, delay: Duration, last_setpoint_bar: f64) -> Self {
        Self {
            deadline: now + delay,
            last_setpoint_bar,
            delay,
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.deadline = now + self.delay;
    }

    pub fn limit_bar(&self, tolerance_bar: f64) -> f64 {
        self.last_setpoint_bar + tolerance_bar
    }

    /// Unknown pressure is never treated as settled.
    pub fn evaluate(&self, now: Instant, pressure_bar: Option<f64>, tolerance_bar: f64) -> CooldownVerdict {
        if now < self.deadline {
            return CooldownVerdict::Waiting;
        }
        match pressure_bar {
            Some(pressure) if pressure <= self.limit_bar(tolerance_bar) => CooldownVerdict::Rearm,
            _ => CooldownVerdict::Extend,
        }
    }
}
