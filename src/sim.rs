use crate::constants::{
    ALARM_ON, MODE_CLOSED, MODE_PID, PRESSURE_RAW_MAX, STATUS_BIT_WARNING,
};
use crate::conversions::{bar_to_raw, raw_to_bar, valve_percent_to_raw};

const SIM_CAPACITY_BAR: f64 = 10.0;
const SIM_SERIAL: &str = "SIM0000001";
const SIM_STATUS_ALARM: u32 = 1 << 3;

/// First-order model of a pressure controller, good enough to drive the console and poller.
#[derive(Debug, Clone)]
pub struct SimInstrument {
    pressure_bar: f64,
    setpoint_raw: i64,
    control_mode: i64,
    alarm_mode: i64,
    alarm_above_raw: i64,
    alarm_below_raw: i64,
    alarm_delay: i64,
    setpoint_tracking: i64,
    valve_percent: f64,
}

impl SimInstrument {
    pub fn new() -> Self {
        Self {
            pressure_bar: 0.0,
            setpoint_raw: 0,
            control_mode: MODE_CLOSED,
            alarm_mode: 0,
            alarm_above_raw: 0,
            alarm_below_raw: PRESSURE_RAW_MAX,
            alarm_delay: 0,
            setpoint_tracking: 0,
            valve_percent: 0.0,
        }
    }

    pub fn serial(&self) -> &'static str {
        SIM_SERIAL
    }

    pub fn capacity(&self) -> f64 {
        SIM_CAPACITY_BAR
    }

    pub fn unit(&self) -> &'static str {
        "bar"
    }

    pub fn tick(&mut self) {
        let target = raw_to_bar(Some(self.setpoint_raw), SIM_CAPACITY_BAR);
        if self.control_mode == MODE_PID {
            let delta = target - self.pressure_bar;
            self.pressure_bar += delta * 0.2;
            self.valve_percent = (40.0 + delta * 15.0).clamp(0.0, 100.0);
        } else {
            self.pressure_bar *= 0.999;
            self.valve_percent = 0.0;
        }
        self.pressure_bar = self.pressure_bar.clamp(0.0, SIM_CAPACITY_BAR);
    }

    pub fn measure_raw(&self) -> i64 {
        i64::from(bar_to_raw(self.pressure_bar, SIM_CAPACITY_BAR))
    }

    pub fn valve_raw(&self) -> i64 {
        i64::from(valve_percent_to_raw(self.valve_percent))
    }

    pub fn status_bits(&self) -> u32 {
        let mut bits = 0;
        if self.alarm_mode == ALARM_ON {
            let measured = self.measure_raw();
            if measured > self.setpoint_raw + self.alarm_above_raw {
                bits |= SIM_STATUS_ALARM | STATUS_BIT_WARNING;
            }
        }
        bits
    }

    pub fn setpoint_raw(&self) -> i64 {
        self.setpoint_raw
    }

    pub fn control_mode(&self) -> i64 {
        self.control_mode
    }

    pub fn alarm_mode(&self) -> i64 {
        self.alarm_mode
    }

    pub fn alarm_settings(&self) -> (i64, i64, i64, i64) {
        (
            self.alarm_above_raw,
            self.alarm_below_raw,
            self.setpoint_tracking,
            self.alarm_delay,
        )
    }

    pub fn set_setpoint_raw(&mut self, raw: i64) {
        self.setpoint_raw = raw.clamp(0, PRESSURE_RAW_MAX);
    }

    pub fn set_control_mode(&mut self, mode: i64) {
        self.control_mode = mode;
    }

    pub fn set_alarm_mode(&mut self, mode: i64) {
        self.alarm_mode = mode;
    }

    pub fn set_alarm_above(&mut self, raw: i64) {
        self.alarm_above_raw = raw;
    }

    pub fn set_alarm_below(&mut self, raw: i64) {
        self.alarm_below_raw = raw;
    }

    pub fn set_setpoint_tracking(&mut self, value: i64) {
        self.setpoint_tracking = value;
    }

    pub fn set_alarm_delay(&mut self, seconds: i64) {
        self.alarm_delay = seconds;
    }
}
