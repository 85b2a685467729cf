use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::Backend;
use crate::clock::ManualClock;
use crate::data::{ParamValue, ParameterAddress};
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Transaction {
    Read(ParameterAddress),
    Write(ParameterAddress, ParamValue),
}

/// Test handle onto the registers and transaction log of a [`MockBackend`].
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    registers: Arc<Mutex<HashMap<ParameterAddress, ParamValue>>>,
    log: Arc<Mutex<Vec<Transaction>>>,
    fail: Arc<AtomicBool>,
    rejected: Arc<Mutex<HashSet<ParameterAddress>>>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    pub(crate) fn set(&self, address: ParameterAddress, value: impl Into<ParamValue>) {
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, value.into());
    }

    pub(crate) fn clear(&self, address: ParameterAddress) {
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }

    pub(crate) fn get(&self, address: ParameterAddress) -> Option<ParamValue> {
        self.registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    pub(crate) fn fail_transport(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Writes to `address` are answered with a non-zero status from now on.
    pub(crate) fn reject_writes(&self, address: ParameterAddress) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address);
    }

    fn is_rejected(&self, address: ParameterAddress) -> bool {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    pub(crate) fn transactions(&self) -> Vec<Transaction> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn writes(&self) -> Vec<(ParameterAddress, ParamValue)> {
        self.transactions()
            .into_iter()
            .filter_map(|transaction| match transaction {
                Transaction::Write(address, value) => Some((address, value)),
                Transaction::Read(_) => None,
            })
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-memory register file that records every transaction.
pub(crate) struct MockBackend {
    handle: MockHandle,
    io_delay: Option<(Arc<ManualClock>, Duration)>,
}

impl MockBackend {
    pub(crate) fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
                io_delay: None,
            },
            handle,
        )
    }

    /// Every transaction advances `clock` by `delay`, emulating a slow wire.
    pub(crate) fn with_io_delay(mut self, clock: Arc<ManualClock>, delay: Duration) -> Self {
        self.io_delay = Some((clock, delay));
        self
    }

    fn begin(&self) -> Result<(), TransportError> {
        if let Some((clock, delay)) = &self.io_delay {
            clock.advance(*delay);
        }
        if self.handle.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock link down",
            )));
        }
        Ok(())
    }

    fn record(&self, transaction: Transaction) {
        self.handle
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction);
    }
}

impl Backend for MockBackend {
    fn read_parameter(
        &mut self,
        address: ParameterAddress,
    ) -> Result<Option<ParamValue>, TransportError> {
        self.begin()?;
        self.record(Transaction::Read(address));
        Ok(self.handle.get(address))
    }

    fn write_parameter(
        &mut self,
        address: ParameterAddress,
        value: &ParamValue,
    ) -> Result<(), TransportError> {
        self.begin()?;
        if self.handle.is_rejected(address) {
            return Err(TransportError::Status { status: 3 });
        }
        self.record(Transaction::Write(address, value.clone()));
        self.handle.set(address, value.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
