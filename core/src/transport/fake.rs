//! Scriptable in-memory radio adapter for unit tests
//!
//! Records every command it receives and lets tests inject adapter events
//! through whatever delegate was installed.

use crate::transport::abstraction::{
    AdapterDelegate, AdapterState, Advertisement, PeripheralId, PeripheralState, RadioAdapter,
    RadioError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A command the fake adapter received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCall {
    Enable,
    Scan,
    StopScan,
    Connect(PeripheralId),
    DisconnectAll,
}

pub struct FakeRadioAdapter {
    state: Mutex<AdapterState>,
    peripherals: Mutex<HashMap<PeripheralId, PeripheralState>>,
    delegate: Mutex<Option<Arc<dyn AdapterDelegate>>>,
    calls: Mutex<Vec<AdapterCall>>,
    values: Mutex<HashMap<(PeripheralId, Uuid), Vec<u8>>>,
    writes: Mutex<Vec<(PeripheralId, Uuid, Vec<u8>)>>,
    write_failure: Mutex<Option<String>>,
    /// Emit `connected` straight from `connect()`
    auto_connect: Mutex<bool>,
}

impl FakeRadioAdapter {
    pub fn new(state: AdapterState) -> Self {
        Self {
            state: Mutex::new(state),
            peripherals: Mutex::new(HashMap::new()),
            delegate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            write_failure: Mutex::new(None),
            auto_connect: Mutex::new(false),
        }
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        *self.auto_connect.lock() = enabled;
    }

    pub fn set_peripheral_state(&self, peripheral: PeripheralId, state: PeripheralState) {
        self.peripherals.lock().insert(peripheral, state);
    }

    pub fn set_value(&self, peripheral: PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        self.values.lock().insert((peripheral, characteristic), value);
    }

    pub fn fail_writes(&self, reason: &str) {
        *self.write_failure.lock() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: AdapterCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    pub fn writes(&self) -> Vec<(PeripheralId, Uuid, Vec<u8>)> {
        self.writes.lock().clone()
    }

    fn delegate(&self) -> Option<Arc<dyn AdapterDelegate>> {
        self.delegate.lock().clone()
    }

    /// Change the power state and report it
    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
        if let Some(delegate) = self.delegate() {
            delegate.on_state_changed(state);
        }
    }

    pub fn emit_located(&self, advertisement: Advertisement) {
        if let Some(delegate) = self.delegate() {
            delegate.on_located(&advertisement);
        }
    }

    pub fn emit_connected(&self, peripheral: PeripheralId) {
        self.set_peripheral_state(peripheral, PeripheralState::Connected);
        if let Some(delegate) = self.delegate() {
            delegate.on_connected(peripheral);
        }
    }

    pub fn emit_could_not_connect(&self, peripheral: PeripheralId) {
        self.set_peripheral_state(peripheral, PeripheralState::Disconnected);
        if let Some(delegate) = self.delegate() {
            delegate.on_could_not_connect(peripheral);
        }
    }

    pub fn emit_timeout(&self) {
        if let Some(delegate) = self.delegate() {
            delegate.on_timeout();
        }
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RadioAdapter for FakeRadioAdapter {
    fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    fn peripheral_state(&self, peripheral: PeripheralId) -> PeripheralState {
        self.peripherals
            .lock()
            .get(&peripheral)
            .copied()
            .unwrap_or(PeripheralState::Disconnected)
    }

    fn set_delegate(&self, delegate: Arc<dyn AdapterDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn enable(&self) {
        self.record(AdapterCall::Enable);
    }

    fn scan(&self) {
        self.record(AdapterCall::Scan);
    }

    fn stop_scan(&self) {
        self.record(AdapterCall::StopScan);
    }

    fn connect(&self, peripheral: PeripheralId) {
        self.record(AdapterCall::Connect(peripheral));
        self.set_peripheral_state(peripheral, PeripheralState::Connecting);
        let auto_connect = *self.auto_connect.lock();
        if auto_connect {
            self.emit_connected(peripheral);
        }
    }

    fn disconnect_all(&self) {
        self.record(AdapterCall::DisconnectAll);
        let mut peripherals = self.peripherals.lock();
        for state in peripherals.values_mut() {
            *state = PeripheralState::Disconnected;
        }
    }

    async fn read_characteristic(
        &self,
        peripheral: PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        self.values
            .lock()
            .get(&(peripheral, characteristic))
            .cloned()
            .ok_or(RadioError::CharacteristicNotFound(characteristic))
    }

    async fn write_characteristic(
        &self,
        peripheral: PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        if let Some(reason) = self.write_failure.lock().clone() {
            return Err(RadioError::WriteFailed(reason));
        }
        self.writes.lock().push((peripheral, characteristic, value));
        Ok(())
    }
}
