use std::collections::VecDeque;

use color_eyre::eyre;
use pressure_ctl::data::{AlarmSeverity, ControllerEvent};

const HISTORY_LEN: usize = 50;

/// One line typed by the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Setpoint(f64),
    Pid,
    Close,
    Purge { target_bar: f64, tolerance_bar: Option<f64> },
    Rearm,
    Status,
    Quit,
}

pub const HELP: &str =
    "commands: sp <bar> | pid | close | purge <bar> [tol] | rearm | status | quit";

/// What the console knows about the instrument, fed from controller events.
#[derive(Debug)]
pub struct ConsoleState {
    pub connected: bool,
    pub severity: AlarmSeverity,
    pub last_critical: Option<u32>,
    pub valve_percent: Option<f64>,
    pub pressure_history: VecDeque<f64>,
    pub overruns: u32,
}

impl Default for ConsoleState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleState {
    pub fn new() -> Self {
        Self {
            connected: false,
            severity: AlarmSeverity::Normal,
            last_critical: None,
            valve_percent: None,
            pressure_history: VecDeque::with_capacity(HISTORY_LEN),
            overruns: 0,
        }
    }

    pub fn pressure_bar(&self) -> Option<f64> {
        self.pressure_history.back().copied()
    }

    /// Change across the retained readings, oldest to newest.
    pub fn pressure_trend(&self) -> Option<f64> {
        match (self.pressure_history.front(), self.pressure_history.back()) {
            (Some(first), Some(last)) if self.pressure_history.len() > 1 => Some(last - first),
            _ => None,
        }
    }

    /// Folds one event in; returns a line worth showing the operator.
    pub fn apply(&mut self, event: ControllerEvent) -> Option<String> {
        match event {
            ControllerEvent::Connection(connected) => {
                let changed = self.connected != connected;
                self.connected = connected;
                if !connected {
                    self.pressure_history.clear();
                    self.valve_percent = None;
                }
                changed.then(|| {
                    if connected { "instrument online" } else { "instrument offline" }.to_string()
                })
            }
            ControllerEvent::Severity(severity) => {
                self.severity = severity;
                (severity != AlarmSeverity::Normal).then(|| format!("status: {severity:?}"))
            }
            ControllerEvent::CriticalAlarm(bits) => {
                self.last_critical = Some(bits);
                Some(format!("CRITICAL alarm, status bits {bits:#06x}"))
            }
            ControllerEvent::Pressure { bar, .. } => {
                self.push_pressure(bar);
                None
            }
            ControllerEvent::ValvePercent(percent) => {
                self.valve_percent = Some(percent);
                None
            }
            ControllerEvent::PurgeFinished => Some("purge finished, valve closed".to_string()),
            ControllerEvent::Overrun { .. } => {
                self.overruns = self.overruns.saturating_add(1);
                None
            }
        }
    }

    fn push_pressure(&mut self, bar: f64) {
        self.pressure_history.push_back(bar);
        while self.pressure_history.len() > HISTORY_LEN {
            self.pressure_history.pop_front();
        }
    }
}

/// Parses one console line; blank lines yield `None`.
pub fn parse_command(line: &str) -> eyre::Result<Option<OperatorCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("sp" | "setpoint", [bar]) => OperatorCommand::Setpoint(parse_bar(bar)?),
        ("pid", []) => OperatorCommand::Pid,
        ("close", []) => OperatorCommand::Close,
        ("purge", [target]) => OperatorCommand::Purge {
            target_bar: parse_bar(target)?,
            tolerance_bar: None,
        },
        ("purge", [target, tolerance]) => OperatorCommand::Purge {
            target_bar: parse_bar(target)?,
            tolerance_bar: Some(parse_bar(tolerance)?),
        },
        ("rearm", []) => OperatorCommand::Rearm,
        ("status", []) => OperatorCommand::Status,
        ("quit" | "q" | "exit", []) => OperatorCommand::Quit,
        _ => return Err(eyre::eyre!("unrecognised command {line:?}; {HELP}")),
    };
    Ok(Some(command))
}

fn parse_bar(text: &str) -> eyre::Result<f64> {
    let value: f64 = text
        .parse()
        .map_err(|_| eyre::eyre!("{text:?} is not a pressure in bar"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(eyre::eyre!("pressure must be a non-negative number, got {text}"));
    }
    Ok(value)
}
