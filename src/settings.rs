use std::time::Duration;

use crate::alarm::SafetyAlarmConfig;
use crate::constants::{DEFAULT_BAUD, DEFAULT_NODE};
use crate::interface::InterfaceMode;

pub const DEFAULT_MAX_SET_PRESSURE: f64 = 100.0;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_PURGE_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub port: Option<String>,
    pub baud: u32,
    pub node: u8,
    pub interface: InterfaceMode,
    pub io_timeout: Duration,
}

impl TransportConfig {
    pub fn for_port(port: impl Into<String>, interface: InterfaceMode) -> Self {
        Self {
            port: Some(port.into()),
            baud: DEFAULT_BAUD,
            node: DEFAULT_NODE,
            interface,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Operator-facing tuning of the controller and poller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    /// Upper bound for commanded setpoints; `None` falls back to the capacity.
    pub max_set_pressure: Option<f64>,
    pub alarm: SafetyAlarmConfig,
    pub poll_interval: Duration,
    pub purge_timeout: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            max_set_pressure: Some(DEFAULT_MAX_SET_PRESSURE),
            alarm: SafetyAlarmConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            purge_timeout: DEFAULT_PURGE_TIMEOUT,
        }
    }
}
