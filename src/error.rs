use std::fmt;

use thiserror::Error;

use crate::data::ParameterAddress;

/// Failure reported by a backend for a single wire transaction.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("instrument answered with status 0x{status:02X}")]
    Status { status: u8 },
    #[error("no response from instrument")]
    NoResponse,
    #[error("parameter {0} has no wire mapping")]
    Unmapped(ParameterAddress),
    #[error("value {value} cannot be encoded for parameter {address}")]
    Encode { address: ParameterAddress, value: String },
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Read,
    Write,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Channel level failure, always tagged with the operation and parameters involved.
#[derive(Debug, Error)]
#[error("{operation} failed (parameters: {}): {cause}", format_addresses(.addresses))]
pub struct DeviceError {
    pub operation: Operation,
    pub addresses: Vec<ParameterAddress>,
    #[source]
    pub cause: TransportError,
}

impl DeviceError {
    pub fn new(operation: Operation, addresses: &[ParameterAddress], cause: TransportError) -> Self {
        Self {
            operation,
            addresses: addresses.to_vec(),
            cause,
        }
    }
}

fn format_addresses(addresses: &[ParameterAddress]) -> String {
    if addresses.is_empty() {
        return "none".to_string();
    }
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),
}

impl ControlError {
    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlError, DeviceError, Operation, TransportError};
    use crate::constants::{PARAM_MEASURE, PARAM_STATUS};

    #[test]
    fn device_error_names_operation_and_parameters() {
        let err = DeviceError::new(
            Operation::Read,
            &[PARAM_STATUS, PARAM_MEASURE],
            TransportError::NoResponse,
        );
        let text = err.to_string();
        assert!(text.starts_with("read failed"));
        assert!(text.contains("28 (status), 8 (measure)"));
        assert!(text.contains("no response"));
    }

    #[test]
    fn control_error_is_transparent_over_device_errors() {
        let err: ControlError =
            DeviceError::new(Operation::Open, &[], TransportError::Closed).into();
        assert_eq!(err.to_string(), "open failed (parameters: none): channel is closed");
    }
}
