use crate::data::ParameterAddress;

pub const PARAM_SERIAL_NUMBER: ParameterAddress = ParameterAddress(1);
pub const PARAM_MEASURE: ParameterAddress = ParameterAddress(8);
pub const PARAM_SETPOINT: ParameterAddress = ParameterAddress(9);
pub const PARAM_CONTROL_MODE: ParameterAddress = ParameterAddress(12);
pub const PARAM_CAPACITY: ParameterAddress = ParameterAddress(21);
pub const PARAM_STATUS: ParameterAddress = ParameterAddress(28);
pub const PARAM_VALVE_OUTPUT: ParameterAddress = ParameterAddress(55);
pub const PARAM_ALARM_ABOVE: ParameterAddress = ParameterAddress(116);
pub const PARAM_ALARM_BELOW: ParameterAddress = ParameterAddress(117);
pub const PARAM_ALARM_MODE: ParameterAddress = ParameterAddress(118);
pub const PARAM_ALARM_SETPOINT_TRACKING: ParameterAddress = ParameterAddress(120);
pub const PARAM_CAPACITY_UNIT: ParameterAddress = ParameterAddress(129);
pub const PARAM_USER_TAG: ParameterAddress = ParameterAddress(130);
pub const PARAM_ALARM_DELAY: ParameterAddress = ParameterAddress(182);

pub const MODE_PID: i64 = 0;
pub const MODE_CLOSED: i64 = 3;

pub const ALARM_OFF: i64 = 0;
pub const ALARM_ON: i64 = 2;
pub const ALARM_BELOW_IGNORE: i64 = 32_000;
pub const SETPOINT_TRACKING_ON: i64 = 1;

pub const PRESSURE_RAW_MAX: i64 = 32_000;
pub const VALVE_RAW_MAX: i64 = 16_777_215;

pub const STATUS_BIT_ERROR: u32 = 1 << 0;
pub const STATUS_BIT_WARNING: u32 = 1 << 1;
pub const STATUS_CRITICAL_MASK: u32 = (1 << 3) | (1 << 5);

pub const DEFAULT_NODE: u8 = 0x80;
pub const DEFAULT_BAUD: u32 = 38_400;
