//! Raw instrument scale to physical units and back.

use crate::constants::{PRESSURE_RAW_MAX, VALVE_RAW_MAX};

/// Full-scale valve percentage; the `100 / 61.67` factor is an instrument
/// specific scaling correction and must stay as written.
pub const VALVE_SCALING: f64 = 100.0 * (100.0 / 61.67);

const PRESSURE_FULL_SCALE: f64 = 32_000.0;
const VALVE_FULL_SCALE: f64 = 16_777_215.0;

#[allow(clippy::cast_precision_loss)]
pub fn raw_to_bar(raw: Option<i64>, capacity: f64) -> f64 {
    match raw {
        Some(raw) if capacity != 0.0 => (raw as f64 / PRESSURE_FULL_SCALE) * capacity,
        _ => 0.0,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn bar_to_raw(bar: f64, capacity: f64) -> u32 {
    if bar.is_nan() || capacity == 0.0 {
        return 0;
    }
    let raw = ((bar / capacity) * PRESSURE_FULL_SCALE).round();
    raw.clamp(0.0, PRESSURE_FULL_SCALE) as u32
}

#[allow(clippy::cast_precision_loss)]
pub fn valve_raw_to_percent(raw: i64) -> f64 {
    VALVE_SCALING * (raw as f64 / VALVE_FULL_SCALE)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn valve_percent_to_raw(percent: f64) -> u32 {
    if percent.is_nan() {
        return 0;
    }
    let raw = (percent / VALVE_SCALING * VALVE_FULL_SCALE).round();
    raw.clamp(0.0, VALVE_FULL_SCALE) as u32
}

pub fn clamp_pressure_raw(raw: i64) -> i64 {
    raw.clamp(0, PRESSURE_RAW_MAX)
}

pub fn clamp_valve_raw(raw: i64) -> i64 {
    raw.clamp(0, VALVE_RAW_MAX)
}
