//! Command surface of the instrument.
//!
//! [`FlowController`] owns the valve mode, the applied safety-alarm
//! configuration and two timed state machines:
//!
//! - the rearm cooldown, which keeps the alarm disarmed after an abrupt
//!   setpoint decrease until measured pressure is back under the trip point;
//! - the purge session, which drives pressure to a target and closes the
//!   valve once the target is reached or the timeout expires.
//!
//! Neither machine owns a thread. Their deadlines are serviced once per poll
//! cycle, from [`FlowController::observe_pressure`] when a measurement
//! arrived and from [`FlowController::observe_offline`] when none did.
//! Cancelling either is just dropping its state.
//! While a purge is active it owns the alarm-enable register and the
//! cooldown is never pending.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::alarm::{CooldownVerdict, RearmCooldown, SafetyAlarmConfig, alarm_setup_sequence};
use crate::channel::ParameterChannel;
use crate::clock::Clock;
use crate::constants::{
    ALARM_OFF, ALARM_ON, MODE_CLOSED, MODE_PID, PARAM_ALARM_MODE, PARAM_CAPACITY,
    PARAM_CAPACITY_UNIT, PARAM_CONTROL_MODE, PARAM_SETPOINT, PARAM_USER_TAG,
};
use crate::conversions::bar_to_raw;
use crate::data::{ControllerEvent, ParamValue};
use crate::error::ControlError;
use crate::purge::{PurgeOutcome, PurgePlan, PurgeSession, PurgeVerdict};
use crate::settings::ControlSettings;

pub type SharedController = Arc<Mutex<FlowController>>;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub capacity: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValveMode {
    #[default]
    Closed,
    PidActive,
}

pub struct FlowController {
    channel: ParameterChannel,
    clock: Arc<dyn Clock>,
    events: Sender<ControllerEvent>,
    max_set_pressure: Option<f64>,
    identity: Option<DeviceIdentity>,
    valve_mode: ValveMode,
    alarm: Option<SafetyAlarmConfig>,
    last_setpoint_bar: Option<f64>,
    current_pressure_bar: Option<f64>,
    cooldown: Option<RearmCooldown>,
    purge: Option<PurgeSession>,
}

impl FlowController {
    pub fn new(
        channel: ParameterChannel,
        clock: Arc<dyn Clock>,
        events: Sender<ControllerEvent>,
        settings: &ControlSettings,
    ) -> Self {
        Self {
            channel,
            clock,
            events,
            max_set_pressure: settings.max_set_pressure,
            identity: None,
            valve_mode: ValveMode::Closed,
            alarm: None,
            last_setpoint_bar: None,
            current_pressure_bar: None,
            cooldown: None,
            purge: None,
        }
    }

    pub fn into_shared(self) -> SharedController {
        Arc::new(Mutex::new(self))
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn capacity(&self) -> Option<f64> {
        self.identity.as_ref().map(|identity| identity.capacity)
    }

    pub fn valve_mode(&self) -> ValveMode {
        self.valve_mode
    }

    /// The configuration last applied to the device, if any.
    pub fn alarm_config(&self) -> Option<&SafetyAlarmConfig> {
        self.alarm.as_ref()
    }

    pub fn last_setpoint_bar(&self) -> Option<f64> {
        self.last_setpoint_bar
    }

    pub fn current_pressure_bar(&self) -> Option<f64> {
        self.current_pressure_bar
    }

    pub fn cooldown(&self) -> Option<&RearmCooldown> {
        self.cooldown.as_ref()
    }

    pub fn purge_session(&self) -> Option<&PurgeSession> {
        self.purge.as_ref()
    }

    /// Reads capacity and unit; call again after a reconnect to refresh them.
    pub fn read_device_identity(&mut self) -> Result<DeviceIdentity, ControlError> {
        let values = self
            .channel
            .read_many(&[PARAM_CAPACITY, PARAM_CAPACITY_UNIT])?;
        let capacity = values
            .get(&PARAM_CAPACITY)
            .and_then(Option::as_ref)
            .and_then(ParamValue::as_float)
            .ok_or_else(|| ControlError::InvalidIdentity("capacity did not answer".into()))?;
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ControlError::InvalidIdentity(format!(
                "capacity {capacity} is not positive"
            )));
        }
        let unit = normalize_tag(values.get(&PARAM_CAPACITY_UNIT).and_then(Option::as_ref))
            .trim()
            .to_string();

        info!(capacity, unit = %unit, "device identity read");
        let identity = DeviceIdentity { capacity, unit };
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    pub fn read_user_tag(&self) -> Result<String, ControlError> {
        let raw = self.channel.read(PARAM_USER_TAG)?;
        Ok(normalize_tag(raw.as_ref()))
    }

    pub fn set_pid_mode(&mut self) -> Result<(), ControlError> {
        self.channel.write(PARAM_CONTROL_MODE, MODE_PID)?;
        self.valve_mode = ValveMode::PidActive;
        info!("valve in PID mode");
        Ok(())
    }

    /// Closes the valve and disarms the alarm, cancelling any pending
    /// cooldown and any running purge.
    pub fn close_valve(&mut self) -> Result<(), ControlError> {
        self.channel.write_many(&[
            (PARAM_CONTROL_MODE, ParamValue::Integer(MODE_CLOSED)),
            (PARAM_ALARM_MODE, ParamValue::Integer(ALARM_OFF)),
        ])?;
        self.valve_mode = ValveMode::Closed;
        if self.cooldown.take().is_some() {
            debug!("rearm cooldown cancelled");
        }
        if self.purge.take().is_some() {
            self.notify(ControllerEvent::PurgeFinished);
        }
        info!("valve closed");
        Ok(())
    }

    pub fn set_setpoint(&mut self, bar: f64) -> Result<(), ControlError> {
        let capacity = self.require_capacity()?;
        let raw = bar_to_raw(bar, capacity);
        if self.valve_mode == ValveMode::PidActive {
            // firmware may drop out of PID on a setpoint write
            self.channel.write_many(&[
                (PARAM_SETPOINT, ParamValue::from(raw)),
                (PARAM_CONTROL_MODE, ParamValue::Integer(MODE_PID)),
            ])?;
        } else {
            self.channel.write(PARAM_SETPOINT, raw)?;
        }
        let previous = self.last_setpoint_bar.replace(bar);
        info!(bar, raw, "setpoint written");
        self.track_setpoint_change(previous, bar)
    }

    pub fn effective_max_pressure(&self) -> Result<f64, ControlError> {
        let capacity = self.require_capacity()?;
        Ok(self
            .max_set_pressure
            .map_or(capacity, |limit| capacity.min(limit)))
    }

    pub fn configure_safety_alarm(&mut self, config: SafetyAlarmConfig) -> Result<(), ControlError> {
        if !config.enabled {
            self.channel.write(PARAM_ALARM_MODE, ALARM_OFF)?;
            self.cooldown = None;
            self.alarm = Some(config);
            info!("safety alarm disabled by configuration");
            return Ok(());
        }
        if self.purge.is_some() {
            return Err(ControlError::precondition(
                "cannot arm the safety alarm while a purge is running",
            ));
        }

        let capacity = self.require_capacity()?;
        let tolerance_raw = bar_to_raw(config.tolerance_bar, capacity);
        self.channel
            .write_many(&alarm_setup_sequence(tolerance_raw, config.delay_seconds))?;
        self.cooldown = None;
        self.alarm = Some(config);
        info!(
            tolerance_bar = config.tolerance_bar,
            tolerance_raw,
            delay_s = config.delay_seconds,
            "safety alarm armed"
        );
        Ok(())
    }

    /// Disarms the alarm and schedules a rearm after the configured delay.
    pub fn begin_rearm_cooldown(&mut self) -> Result<(), ControlError> {
        if self.purge.is_some() {
            return Err(ControlError::precondition(
                "a running purge owns the safety alarm",
            ));
        }
        let alarm = self
            .alarm
            .filter(|alarm| alarm.enabled)
            .ok_or_else(|| ControlError::precondition("safety alarm is not armed"))?;
        let setpoint = self
            .last_setpoint_bar
            .ok_or_else(|| ControlError::precondition("no setpoint has been commanded"))?;

        self.channel.write(PARAM_ALARM_MODE, ALARM_OFF)?;
        self.cooldown = Some(RearmCooldown::start(
            self.clock.now(),
            alarm.delay(),
            setpoint,
        ));
        info!(
            setpoint,
            delay_s = alarm.delay_seconds,
            "safety alarm disarmed until pressure settles"
        );
        Ok(())
    }

    pub fn start_purge(&mut self, plan: PurgePlan) -> Result<(), ControlError> {
        if self.purge.is_some() {
            return Err(ControlError::precondition("a purge is already running"));
        }
        if !plan.tolerance_bar.is_finite() || plan.tolerance_bar < 0.0 {
            return Err(ControlError::precondition(format!(
                "purge tolerance {} is not a valid band",
                plan.tolerance_bar
            )));
        }
        let capacity = self.require_capacity()?;
        let raw = bar_to_raw(plan.target_bar, capacity);

        self.channel.write_many(&[
            (PARAM_ALARM_MODE, ParamValue::Integer(ALARM_OFF)),
            (PARAM_SETPOINT, ParamValue::from(raw)),
            (PARAM_CONTROL_MODE, ParamValue::Integer(MODE_PID)),
        ])?;
        if self.cooldown.take().is_some() {
            debug!("rearm cooldown superseded by purge");
        }
        self.valve_mode = ValveMode::PidActive;
        self.last_setpoint_bar = Some(plan.target_bar);
        self.purge = Some(PurgeSession::start(plan, self.clock.now()));
        info!(
            target_bar = plan.target_bar,
            tolerance_bar = plan.tolerance_bar,
            timeout_s = plan.timeout.as_secs_f64(),
            "purge started"
        );
        Ok(())
    }

    /// Returns `None` when no purge is running.
    pub fn check_purge_condition(
        &mut self,
        pressure_bar: f64,
        now: Instant,
    ) -> Option<PurgeVerdict> {
        let verdict = self.purge.as_ref()?.check(pressure_bar, now);
        if let PurgeVerdict::Finished(outcome) = verdict
            && let Err(err) = self.finalize_purge(outcome)
        {
            warn!(error = %err, "closing valve after purge failed; retrying on next check");
        }
        Some(verdict)
    }

    /// Ends the purge by closing the valve. Both outcomes end the same way.
    pub fn finalize_purge(&mut self, outcome: PurgeOutcome) -> Result<(), ControlError> {
        let Some(session) = self.purge.as_ref() else {
            return Ok(());
        };
        let elapsed = self.clock.now().saturating_duration_since(session.started_at);
        info!(
            ?outcome,
            target_bar = session.target_bar,
            elapsed_s = elapsed.as_secs_f64(),
            "purge finished"
        );
        self.close_valve()
    }

    /// Feeds the latest measurement into the purge check and the cooldown.
    pub fn observe_pressure(&mut self, pressure_bar: f64) {
        let now = self.clock.now();
        self.current_pressure_bar = Some(pressure_bar);
        if self.purge.is_some() {
            self.check_purge_condition(pressure_bar, now);
        }
        self.service_cooldown(now);
    }

    /// Services both deadlines on a cycle that produced no measurement.
    ///
    /// The pressure becomes unknown, so a pending cooldown extends and a
    /// purge can only end by its timeout.
    pub fn observe_offline(&mut self) {
        let now = self.clock.now();
        self.current_pressure_bar = None;
        let verdict = self.purge.as_ref().map(|session| session.check_timeout(now));
        if let Some(PurgeVerdict::Finished(outcome)) = verdict
            && let Err(err) = self.finalize_purge(outcome)
        {
            warn!(error = %err, "closing valve after purge timeout failed; retrying on next cycle");
        }
        self.service_cooldown(now);
    }

    fn service_cooldown(&mut self, now: Instant) {
        if self.purge.is_some() {
            return;
        }
        let (Some(alarm), Some(cooldown)) = (self.alarm, self.cooldown.as_ref()) else {
            return;
        };
        let limit = cooldown.limit_bar(alarm.tolerance_bar);
        match cooldown.evaluate(now, self.current_pressure_bar, alarm.tolerance_bar) {
            CooldownVerdict::Waiting => {}
            CooldownVerdict::Extend => {
                debug!(
                    pressure_bar = ?self.current_pressure_bar,
                    limit_bar = limit,
                    "pressure not settled; extending alarm cooldown"
                );
                self.restart_cooldown(now);
            }
            CooldownVerdict::Rearm => match self.channel.write(PARAM_ALARM_MODE, ALARM_ON) {
                Ok(()) => {
                    self.cooldown = None;
                    info!(limit_bar = limit, "safety alarm re-armed");
                }
                Err(err) => {
                    warn!(error = %err, "re-arming safety alarm failed; retrying after delay");
                    self.restart_cooldown(now);
                }
            },
        }
    }

    fn restart_cooldown(&mut self, now: Instant) {
        if let Some(cooldown) = self.cooldown.as_mut() {
            cooldown.restart(now);
        }
    }

    /// The setpoint is already applied here, so a failed disarm is only logged.
    fn track_setpoint_change(&mut self, previous: Option<f64>, bar: f64) -> Result<(), ControlError> {
        if self.purge.is_some() {
            return Ok(());
        }
        let Some(alarm) = self.alarm.filter(|alarm| alarm.enabled) else {
            return Ok(());
        };
        if let Some(cooldown) = self.cooldown.as_mut() {
            cooldown.last_setpoint_bar = bar;
        }
        match previous {
            Some(previous) if alarm.is_abrupt_decrease(previous, bar) => {
                match self.begin_rearm_cooldown() {
                    Err(ControlError::Device(err)) => {
                        warn!(error = %err, "disarming safety alarm after setpoint drop failed");
                        Ok(())
                    }
                    other => other,
                }
            }
            _ => Ok(()),
        }
    }

    fn require_capacity(&self) -> Result<f64, ControlError> {
        self.capacity()
            .ok_or_else(|| ControlError::precondition("device capacity has not been read"))
    }

    fn notify(&self, event: ControllerEvent) {
        self.events.send(event).ok();
    }
}

/// Best-effort text for a user-tag value; never fails.
pub fn normalize_tag(raw: Option<&ParamValue>) -> String {
    match raw {
        None => String::new(),
        Some(ParamValue::Text(text)) => text.clone(),
        Some(ParamValue::Bytes(bytes)) => String::from_utf8_lossy(bytes)
            .chars()
            .filter(|ch| *ch != char::REPLACEMENT_CHARACTER)
            .collect::<String>()
            .trim_end_matches('\0')
            .to_string(),
        Some(other) => other.to_string(),
    }
}
