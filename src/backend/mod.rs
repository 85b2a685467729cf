use crate::data::{ParamValue, ParameterAddress};
use crate::error::TransportError;
use crate::interface::InterfaceMode;
use crate::settings::TransportConfig;

mod propar;

#[cfg(debug_assertions)]
mod sim;

#[cfg(test)]
pub(crate) mod mock;

/// One physical (or simulated) link to the instrument.
///
/// A `None` read is the protocol's "no response" and is not an error.
pub trait Backend {
    fn read_parameter(
        &mut self,
        address: ParameterAddress,
    ) -> Result<Option<ParamValue>, TransportError>;

    fn write_parameter(
        &mut self,
        address: ParameterAddress,
        value: &ParamValue,
    ) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub fn build_backend(config: &TransportConfig) -> Result<Box<dyn Backend + Send>, TransportError> {
    match config.interface {
        InterfaceMode::Propar => {
            let port = config.port.as_ref().ok_or_else(|| {
                TransportError::Serial(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    "serial port required",
                ))
            })?;
            let backend =
                propar::ProparBackend::new(port, config.baud, config.node, config.io_timeout)?;
            Ok(Box::new(backend))
        }
        InterfaceMode::Simulation => {
            #[cfg(debug_assertions)]
            {
                Ok(Box::new(sim::SimBackend::new()))
            }
            #[cfg(not(debug_assertions))]
            {
                Err(TransportError::Serial(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    "simulation not available in release builds",
                )))
            }
        }
    }
}
