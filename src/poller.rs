//! Periodic acquisition of status, pressure and valve output.
//!
//! The loop never exits on its own: transport failures and silent devices
//! become `Connection(false)` events plus a backoff, and only a raised
//! [`StopSignal`] ends it. The stop is checked at the top of every cycle,
//! so an in-flight transaction always completes first. Controller
//! deadlines are serviced on every cycle, including the silent ones, and a
//! reconnect re-reads the device identity before pressure is converted.

use std::sync::mpsc::Sender;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::ParameterChannel;
use crate::clock::{Clock, StopSignal};
use crate::constants::{
    PARAM_MEASURE, PARAM_STATUS, PARAM_VALVE_OUTPUT, STATUS_BIT_ERROR, STATUS_BIT_WARNING,
    STATUS_CRITICAL_MASK,
};
use crate::controller::{FlowController, SharedController};
use crate::conversions::{clamp_pressure_raw, clamp_valve_raw, raw_to_bar, valve_raw_to_percent};
use crate::data::{AlarmSeverity, ControllerEvent, LiveReading, ParamValue, ParameterAddress};

/// Pause after a cycle in which the measurement did not answer.
pub const OFFLINE_BACKOFF: Duration = Duration::from_secs(1);
/// Pause after a cycle that failed at the transport level.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

const POLLED: [ParameterAddress; 3] = [PARAM_STATUS, PARAM_MEASURE, PARAM_VALVE_OUTPUT];

pub fn decode_severity(bits: u32) -> AlarmSeverity {
    if bits & STATUS_BIT_ERROR != 0 {
        AlarmSeverity::Error
    } else if bits & STATUS_BIT_WARNING != 0 {
        AlarmSeverity::Warning
    } else {
        AlarmSeverity::Normal
    }
}

pub fn is_critical(bits: u32) -> bool {
    bits & STATUS_CRITICAL_MASK != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub sleep: Duration,
    pub overrun: bool,
}

/// Sleep that keeps cycles on the period; an overrun never sleeps.
pub fn pacing(period: Duration, elapsed: Duration) -> Pacing {
    match period.checked_sub(elapsed) {
        Some(sleep) if !sleep.is_zero() => Pacing {
            sleep,
            overrun: false,
        },
        _ => Pacing {
            sleep: Duration::ZERO,
            overrun: true,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Reading(LiveReading),
    Offline,
    Failed,
}

pub struct PollingLoop {
    channel: ParameterChannel,
    controller: SharedController,
    clock: Arc<dyn Clock>,
    events: Sender<ControllerEvent>,
    period: Duration,
    last_status: Option<u32>,
    online: bool,
    reconnecting: bool,
}

impl PollingLoop {
    pub fn new(
        channel: ParameterChannel,
        controller: SharedController,
        clock: Arc<dyn Clock>,
        events: Sender<ControllerEvent>,
        period: Duration,
    ) -> Self {
        Self {
            channel,
            controller,
            clock,
            events,
            period,
            last_status: None,
            online: false,
            reconnecting: false,
        }
    }

    pub fn run(mut self, stop: &StopSignal) {
        info!(period_ms = self.period.as_millis(), "polling started");
        while !stop.is_raised() {
            let (_, pause) = self.run_cycle();
            if !pause.is_zero() {
                self.clock.sleep(pause, stop);
            }
        }
        info!("polling stopped");
    }

    /// One acquisition cycle; returns what happened and how long to pause.
    pub fn run_cycle(&mut self) -> (CycleOutcome, Duration) {
        let started = self.clock.now();

        let values = match self.channel.read_many(&POLLED) {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "poll cycle failed");
                self.mark_offline();
                return (CycleOutcome::Failed, FAILURE_BACKOFF);
            }
        };
        let integer = |address: ParameterAddress| {
            values
                .get(&address)
                .and_then(Option::as_ref)
                .and_then(ParamValue::as_integer)
        };

        let Some(measure_raw) = integer(PARAM_MEASURE) else {
            debug!("measurement did not answer; device offline");
            self.mark_offline();
            return (CycleOutcome::Offline, OFFLINE_BACKOFF);
        };
        let status = integer(PARAM_STATUS).and_then(|raw| u32::try_from(raw).ok());
        let valve_percent = integer(PARAM_VALVE_OUTPUT)
            .map(|raw| valve_raw_to_percent(clamp_valve_raw(raw)));

        let refresh_identity = !self.online && self.reconnecting;
        if !self.online {
            self.online = true;
            self.reconnecting = false;
            info!("device online");
            self.notify(ControllerEvent::Connection(true));
        }
        if let Some(bits) = status {
            self.publish_status(bits);
        }

        let reading = {
            let mut controller = self.lock_controller();
            let capacity = match capacity_of(&mut controller, refresh_identity) {
                Some(capacity) => capacity,
                None => {
                    drop(controller);
                    self.mark_offline();
                    return (CycleOutcome::Failed, FAILURE_BACKOFF);
                }
            };
            let pressure_bar = raw_to_bar(Some(clamp_pressure_raw(measure_raw)), capacity);
            let reading = LiveReading {
                timestamp: self.clock.wall_time(),
                pressure_bar,
                valve_percent,
                alarm_status_bits: status,
            };
            self.notify(ControllerEvent::Pressure {
                timestamp: reading.timestamp,
                bar: pressure_bar,
            });
            if let Some(percent) = valve_percent {
                self.notify(ControllerEvent::ValvePercent(percent));
            }
            controller.observe_pressure(pressure_bar);
            reading
        };

        let elapsed = self.clock.now().saturating_duration_since(started);
        let pace = pacing(self.period, elapsed);
        if pace.overrun {
            warn!(
                elapsed_ms = elapsed.as_millis(),
                period_ms = self.period.as_millis(),
                "poll cycle overran its period"
            );
            self.notify(ControllerEvent::Overrun { elapsed });
        }
        (CycleOutcome::Reading(reading), pace.sleep)
    }

    fn publish_status(&mut self, bits: u32) {
        if self.last_status == Some(bits) {
            return;
        }
        self.last_status = Some(bits);
        let severity = decode_severity(bits);
        debug!(bits, ?severity, "status changed");
        self.notify(ControllerEvent::Severity(severity));
        if is_critical(bits) {
            warn!(bits = %format!("{bits:#06x}"), "critical alarm raised by device");
            self.notify(ControllerEvent::CriticalAlarm(bits));
        }
    }

    fn mark_offline(&mut self) {
        if self.online {
            warn!("device offline");
        }
        self.online = false;
        self.reconnecting = true;
        self.last_status = None;
        self.notify(ControllerEvent::Connection(false));
        self.lock_controller().observe_offline();
    }

    fn lock_controller(&self) -> MutexGuard<'_, FlowController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: ControllerEvent) {
        self.events.send(event).ok();
    }
}

/// Identity is re-read after a reconnect, or when it was never read.
fn capacity_of(controller: &mut FlowController, refresh: bool) -> Option<f64> {
    if !refresh && let Some(capacity) = controller.capacity() {
        return Some(capacity);
    }
    match controller.read_device_identity() {
        Ok(identity) => Some(identity.capacity),
        Err(err) => {
            warn!(error = %err, "device identity unavailable");
            None
        }
    }
}

pub fn spawn_poller(poller: PollingLoop, stop: Arc<StopSignal>) -> thread::JoinHandle<()> {
    thread::spawn(move || poller.run(&stop))
}
