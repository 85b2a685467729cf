//! The single serialized path to the instrument.
//!
//! Every read and write, from the poller and from commands alike, goes
//! through one [`ParameterChannel`]. Clones share the same lock, so no two
//! transactions ever interleave on the wire; the batch variants hold the
//! lock for the whole batch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, build_backend};
use crate::constants::PARAM_SERIAL_NUMBER;
use crate::data::{ParamValue, ParameterAddress};
use crate::error::{DeviceError, Operation, TransportError};
use crate::settings::TransportConfig;

type SharedBackend = Arc<Mutex<Option<Box<dyn Backend + Send>>>>;

#[derive(Clone)]
pub struct ParameterChannel {
    backend: SharedBackend,
}

impl fmt::Debug for ParameterChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterChannel")
            .field("open", &self.is_open())
            .finish()
    }
}

impl ParameterChannel {
    pub fn new(backend: Box<dyn Backend + Send>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Some(backend))),
        }
    }

    pub fn open(config: &TransportConfig) -> Result<Self, DeviceError> {
        let backend =
            build_backend(config).map_err(|cause| DeviceError::new(Operation::Open, &[], cause))?;
        info!(
            port = config.port.as_deref().unwrap_or("<simulation>"),
            baud = config.baud,
            node = config.node,
            "parameter channel open"
        );
        Ok(Self::new(backend))
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn read(&self, address: ParameterAddress) -> Result<Option<ParamValue>, DeviceError> {
        let mut guard = self.lock();
        let backend = guard
            .as_mut()
            .ok_or_else(|| DeviceError::new(Operation::Read, &[address], TransportError::Closed))?;
        read_one(&mut **backend, address)
    }

    pub fn write(
        &self,
        address: ParameterAddress,
        value: impl Into<ParamValue>,
    ) -> Result<(), DeviceError> {
        let value = value.into();
        let mut guard = self.lock();
        let backend = guard
            .as_mut()
            .ok_or_else(|| DeviceError::new(Operation::Write, &[address], TransportError::Closed))?;
        write_one(&mut **backend, address, &value)
    }

    /// Reads each address once under a single lock acquisition.
    pub fn read_many(
        &self,
        addresses: &[ParameterAddress],
    ) -> Result<BTreeMap<ParameterAddress, Option<ParamValue>>, DeviceError> {
        let mut guard = self.lock();
        let backend = guard
            .as_mut()
            .ok_or_else(|| DeviceError::new(Operation::Read, addresses, TransportError::Closed))?;
        let mut values = BTreeMap::new();
        for address in addresses {
            if values.contains_key(address) {
                continue;
            }
            let value = read_one(&mut **backend, *address)?;
            values.insert(*address, value);
        }
        Ok(values)
    }

    /// Writes the pairs in the given order under a single lock acquisition.
    pub fn write_many(&self, writes: &[(ParameterAddress, ParamValue)]) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        let backend = guard.as_mut().ok_or_else(|| {
            let addresses: Vec<_> = writes.iter().map(|(address, _)| *address).collect();
            DeviceError::new(Operation::Write, &addresses, TransportError::Closed)
        })?;
        for (address, value) in writes {
            write_one(&mut **backend, *address, value)?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), DeviceError> {
        let Some(mut backend) = self.lock().take() else {
            return Ok(());
        };
        backend
            .close()
            .map_err(|cause| DeviceError::new(Operation::Close, &[], cause))?;
        debug!("parameter channel closed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Backend + Send>>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_one(
    backend: &mut (dyn Backend + Send),
    address: ParameterAddress,
) -> Result<Option<ParamValue>, DeviceError> {
    let value = backend
        .read_parameter(address)
        .map_err(|cause| DeviceError::new(Operation::Read, &[address], cause))?;
    trace!(%address, value = ?value, "read");
    Ok(value)
}

fn write_one(
    backend: &mut (dyn Backend + Send),
    address: ParameterAddress,
    value: &ParamValue,
) -> Result<(), DeviceError> {
    backend
        .write_parameter(address, value)
        .map_err(|cause| DeviceError::new(Operation::Write, &[address], cause))?;
    trace!(%address, %value, "write");
    Ok(())
}

/// Opens `port`, reads the serial number and closes the channel again.
///
/// A null serial number means nothing answered on that port.
pub fn probe_port<F>(port: &str, open: F) -> Result<Option<ParamValue>, DeviceError>
where
    F: FnOnce(&str) -> Result<ParameterChannel, DeviceError>,
{
    let channel = open(port)?;
    let serial = channel.read(PARAM_SERIAL_NUMBER);
    if let Err(err) = channel.close() {
        warn!(port, error = %err, "closing probe channel failed");
    }
    serial
}

/// Tries `preferred` first, then every other candidate, returning the first
/// port whose instrument reports a serial number.
pub fn find_responsive_port<F>(
    candidates: &[String],
    preferred: Option<&str>,
    mut open: F,
) -> Option<(String, ParamValue)>
where
    F: FnMut(&str) -> Result<ParameterChannel, DeviceError>,
{
    let mut ordered: Vec<&str> = candidates.iter().map(String::as_str).collect();
    if let Some(preferred) = preferred
        && let Some(index) = ordered.iter().position(|port| *port == preferred)
    {
        let port = ordered.remove(index);
        ordered.insert(0, port);
    }

    for port in ordered {
        info!(port, "probing for instrument");
        match probe_port(port, &mut open) {
            Ok(Some(serial)) => {
                info!(port, %serial, "instrument answered");
                return Some((port.to_string(), serial));
            }
            Ok(None) => warn!(port, "no instrument answering on port"),
            Err(err) => warn!(port, error = %err, "probe failed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{ParameterChannel, find_responsive_port, probe_port};
    use crate::backend::Backend;
    use crate::backend::mock::{MockBackend, Transaction};
    use crate::constants::{PARAM_ALARM_MODE, PARAM_MEASURE, PARAM_SERIAL_NUMBER, PARAM_STATUS};
    use crate::data::{ParamValue, ParameterAddress};
    use crate::error::{DeviceError, Operation, TransportError};

    #[test]
    fn null_reads_are_values_not_errors() {
        let (backend, handle) = MockBackend::new();
        let channel = ParameterChannel::new(Box::new(backend));
        assert_eq!(channel.read(PARAM_MEASURE).expect("read should work"), None);
        handle.set(PARAM_MEASURE, 16_000i64);
        assert_eq!(
            channel.read(PARAM_MEASURE).expect("read should work"),
            Some(ParamValue::Integer(16_000))
        );
    }

    #[test]
    fn write_many_preserves_caller_order() {
        let (backend, handle) = MockBackend::new();
        let channel = ParameterChannel::new(Box::new(backend));
        channel
            .write_many(&[
                (PARAM_ALARM_MODE, ParamValue::Integer(0)),
                (PARAM_STATUS, ParamValue::Integer(5)),
                (PARAM_ALARM_MODE, ParamValue::Integer(2)),
            ])
            .expect("batch should write");
        assert_eq!(
            handle.writes(),
            vec![
                (PARAM_ALARM_MODE, ParamValue::Integer(0)),
                (PARAM_STATUS, ParamValue::Integer(5)),
                (PARAM_ALARM_MODE, ParamValue::Integer(2)),
            ]
        );
        assert_eq!(handle.get(PARAM_ALARM_MODE), Some(ParamValue::Integer(2)));
    }

    #[test]
    fn read_many_reads_each_address_once() {
        let (backend, handle) = MockBackend::new();
        handle.set(PARAM_STATUS, 2i64);
        let channel = ParameterChannel::new(Box::new(backend));
        let values = channel
            .read_many(&[PARAM_STATUS, PARAM_MEASURE, PARAM_STATUS])
            .expect("batch should read");
        assert_eq!(values.len(), 2);
        assert_eq!(values[&PARAM_STATUS], Some(ParamValue::Integer(2)));
        assert_eq!(values[&PARAM_MEASURE], None);
        assert_eq!(
            handle.transactions(),
            vec![Transaction::Read(PARAM_STATUS), Transaction::Read(PARAM_MEASURE)]
        );
    }

    #[test]
    fn transport_failures_carry_operation_and_address() {
        let (backend, handle) = MockBackend::new();
        handle.fail_transport(true);
        let channel = ParameterChannel::new(Box::new(backend));
        let err = channel.write(PARAM_ALARM_MODE, 0i64).expect_err("write should fail");
        assert_eq!(err.operation, Operation::Write);
        assert_eq!(err.addresses, vec![PARAM_ALARM_MODE]);
        assert!(matches!(err.cause, TransportError::Io(_)));
    }

    #[test]
    fn closed_channel_rejects_everything() {
        let (backend, handle) = MockBackend::new();
        let channel = ParameterChannel::new(Box::new(backend));
        let clone = channel.clone();
        channel.close().expect("close should work");
        assert!(handle.is_closed());
        assert!(!clone.is_open());
        let err = clone.read(PARAM_MEASURE).expect_err("channel is closed");
        assert!(matches!(err.cause, TransportError::Closed));
        channel.close().expect("second close is a no-op");
    }

    struct OverlapDetector {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
    }

    impl OverlapDetector {
        fn transaction(&self) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    impl Backend for OverlapDetector {
        fn read_parameter(
            &mut self,
            _address: ParameterAddress,
        ) -> Result<Option<ParamValue>, TransportError> {
            self.transaction();
            Ok(Some(ParamValue::Integer(1)))
        }

        fn write_parameter(
            &mut self,
            _address: ParameterAddress,
            _value: &ParamValue,
        ) -> Result<(), TransportError> {
            self.transaction();
            Ok(())
        }
    }

    #[test]
    fn concurrent_callers_never_interleave() {
        let overlaps = Arc::new(AtomicUsize::new(0));
        let channel = ParameterChannel::new(Box::new(OverlapDetector {
            busy: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::clone(&overlaps),
        }));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        if worker % 2 == 0 {
                            channel.read_many(&[PARAM_STATUS, PARAM_MEASURE]).expect("read");
                        } else {
                            channel.write(PARAM_ALARM_MODE, 2i64).expect("write");
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker should finish");
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    fn open_mock(
        serials: &Arc<Mutex<Vec<(&'static str, Option<&'static str>)>>>,
    ) -> impl FnMut(&str) -> Result<ParameterChannel, DeviceError> {
        let serials = Arc::clone(serials);
        move |port: &str| {
            let known = serials.lock().expect("lock").clone();
            let Some((_, serial)) = known.iter().find(|(name, _)| *name == port) else {
                return Err(DeviceError::new(Operation::Open, &[], TransportError::NoResponse));
            };
            let (backend, handle) = MockBackend::new();
            if let Some(serial) = serial {
                handle.set(PARAM_SERIAL_NUMBER, ParamValue::Text((*serial).to_string()));
            }
            Ok(ParameterChannel::new(Box::new(backend)))
        }
    }

    #[test]
    fn probe_reports_serial_and_closes() {
        let (backend, handle) = MockBackend::new();
        handle.set(PARAM_SERIAL_NUMBER, ParamValue::Text("M123".into()));
        let mut slot = Some(ParameterChannel::new(Box::new(backend)));
        let serial = probe_port("/dev/ttyUSB0", |_| {
            slot.take()
                .ok_or_else(|| DeviceError::new(Operation::Open, &[], TransportError::Closed))
        })
        .expect("probe should work");
        assert_eq!(serial, Some(ParamValue::Text("M123".into())));
        assert!(handle.is_closed());
    }

    #[test]
    fn preferred_port_is_tried_first_and_silent_ports_are_skipped() {
        let serials = Arc::new(Mutex::new(vec![
            ("COM1", None),
            ("COM3", Some("B")),
            ("COM4", Some("A")),
        ]));
        let candidates: Vec<String> = ["COM1", "COM2", "COM3", "COM4"]
            .iter()
            .map(ToString::to_string)
            .collect();

        let found = find_responsive_port(&candidates, Some("COM4"), open_mock(&serials));
        assert_eq!(found, Some(("COM4".to_string(), ParamValue::Text("A".into()))));

        let found = find_responsive_port(&candidates, Some("COM9"), open_mock(&serials));
        assert_eq!(found, Some(("COM3".to_string(), ParamValue::Text("B".into()))));

        serials.lock().expect("lock").retain(|(name, _)| *name == "COM1");
        assert_eq!(find_responsive_port(&candidates, None, open_mock(&serials)), None);
    }
}
