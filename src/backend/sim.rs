use crate::backend::Backend;
use crate::constants::{
    PARAM_ALARM_ABOVE, PARAM_ALARM_BELOW, PARAM_ALARM_DELAY, PARAM_ALARM_MODE,
    PARAM_ALARM_SETPOINT_TRACKING, PARAM_CAPACITY, PARAM_CAPACITY_UNIT, PARAM_CONTROL_MODE,
    PARAM_MEASURE, PARAM_SERIAL_NUMBER, PARAM_SETPOINT, PARAM_STATUS, PARAM_USER_TAG,
    PARAM_VALVE_OUTPUT,
};
use crate::data::{ParamValue, ParameterAddress};
use crate::error::TransportError;
use crate::sim::SimInstrument;

pub(crate) struct SimBackend {
    sim: SimInstrument,
}

impl SimBackend {
    pub(crate) fn new() -> Self {
        Self {
            sim: SimInstrument::new(),
        }
    }
}

impl Backend for SimBackend {
    fn read_parameter(
        &mut self,
        address: ParameterAddress,
    ) -> Result<Option<ParamValue>, TransportError> {
        let value = match address {
            PARAM_SERIAL_NUMBER => ParamValue::Text(self.sim.serial().to_string()),
            PARAM_MEASURE => {
                self.sim.tick();
                ParamValue::Integer(self.sim.measure_raw())
            }
            PARAM_SETPOINT => ParamValue::Integer(self.sim.setpoint_raw()),
            PARAM_CONTROL_MODE => ParamValue::Integer(self.sim.control_mode()),
            PARAM_CAPACITY => ParamValue::Float(self.sim.capacity()),
            PARAM_STATUS => ParamValue::Integer(i64::from(self.sim.status_bits())),
            PARAM_VALVE_OUTPUT => ParamValue::Integer(self.sim.valve_raw()),
            PARAM_ALARM_MODE => ParamValue::Integer(self.sim.alarm_mode()),
            PARAM_CAPACITY_UNIT => ParamValue::Text(self.sim.unit().to_string()),
            PARAM_USER_TAG => ParamValue::Bytes(b"simulated\0".to_vec()),
            _ => return Err(TransportError::Unmapped(address)),
        };
        Ok(Some(value))
    }

    fn write_parameter(
        &mut self,
        address: ParameterAddress,
        value: &ParamValue,
    ) -> Result<(), TransportError> {
        let raw = value.as_integer().ok_or_else(|| TransportError::Encode {
            address,
            value: value.to_string(),
        })?;
        match address {
            PARAM_SETPOINT => self.sim.set_setpoint_raw(raw),
            PARAM_CONTROL_MODE => self.sim.set_control_mode(raw),
            PARAM_ALARM_MODE => self.sim.set_alarm_mode(raw),
            PARAM_ALARM_ABOVE => self.sim.set_alarm_above(raw),
            PARAM_ALARM_BELOW => self.sim.set_alarm_below(raw),
            PARAM_ALARM_SETPOINT_TRACKING => self.sim.set_setpoint_tracking(raw),
            PARAM_ALARM_DELAY => self.sim.set_alarm_delay(raw),
            _ => return Err(TransportError::Unmapped(address)),
        }
        Ok(())
    }
}
