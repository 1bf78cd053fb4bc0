//! Radio adapter abstraction for FinderLink
//!
//! Defines the contract the platform radio stack implements and the events it
//! reports back. The orchestration core never talks to hardware directly: it
//! issues fire-and-forget commands through [`RadioAdapter`] and learns about
//! their outcome through [`AdapterDelegate`] callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Power state of the local radio adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    /// State not reported yet
    Unknown,
    /// Connection with the system radio service was momentarily lost
    Resetting,
    /// The hardware has no BLE central role
    Unsupported,
    /// The application is not allowed to use the radio
    Unauthorized,
    /// Radio switched off
    PoweredOff,
    /// Radio ready for scan and connect
    PoweredOn,
}

impl AdapterState {
    /// Whether the adapter may still settle on another state by itself
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterState::Unknown | AdapterState::Resetting)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "Unknown"),
            AdapterState::Resetting => write!(f, "Resetting"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Link state of a single peripheral as seen by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl PeripheralState {
    /// A connect request for a peripheral in this state needs no radio work
    pub fn is_linked_or_linking(&self) -> bool {
        matches!(self, PeripheralState::Connected | PeripheralState::Connecting)
    }
}

/// Opaque handle the radio stack assigns to a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(Uuid);

impl PeripheralId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Fresh random handle, mostly useful for fakes and tests
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast payload of a discoverable peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Handle to use for a subsequent connect
    pub peripheral: PeripheralId,
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Raw manufacturer specific data
    pub manufacturer_data: Vec<u8>,
    /// Signal strength in dBm
    pub rssi: i16,
}

impl Advertisement {
    /// Create an empty advertisement for a peripheral
    pub fn new(peripheral: PeripheralId) -> Self {
        Self {
            peripheral,
            local_name: None,
            service_uuids: Vec::new(),
            manufacturer_data: Vec::new(),
            rssi: 0,
        }
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = data;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }
}

/// Errors reported by the radio stack for characteristic I/O
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("Adapter powered off")]
    PoweredOff,

    #[error("Peripheral not connected: {0}")]
    NotConnected(PeripheralId),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Callback surface of the radio stack
///
/// Every method has an empty default so listeners only implement the events
/// they care about. Callbacks may arrive on any thread.
pub trait AdapterDelegate: Send + Sync {
    /// A peripheral advertisement was received while scanning
    fn on_located(&self, _advertisement: &Advertisement) {}

    /// A connect request completed
    fn on_connected(&self, _peripheral: PeripheralId) {}

    /// A connect request failed
    fn on_could_not_connect(&self, _peripheral: PeripheralId) {}

    /// An established link went down
    fn on_disconnected(&self, _peripheral: PeripheralId) {}

    /// The adapter power state changed
    fn on_state_changed(&self, _state: AdapterState) {}

    /// The radio stack gave up on the current scan
    fn on_timeout(&self) {}
}

/// Platform radio stack contract
///
/// Commands are fire-and-forget; their outcome is reported to the delegate
/// installed with [`RadioAdapter::set_delegate`]. Only one delegate is held at
/// a time, which is why the core installs a single multiplexer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current adapter power state
    fn state(&self) -> AdapterState;

    /// Current link state of a peripheral
    fn peripheral_state(&self, peripheral: PeripheralId) -> PeripheralState;

    /// Install the delegate that receives every adapter event
    fn set_delegate(&self, delegate: Arc<dyn AdapterDelegate>);

    /// Ask the platform to power the radio up
    fn enable(&self);

    /// Start scanning for advertisements
    fn scan(&self);

    /// Stop scanning. Idempotent.
    fn stop_scan(&self);

    /// Start connecting to a peripheral
    fn connect(&self, peripheral: PeripheralId);

    /// Drop every link the adapter holds
    fn disconnect_all(&self);

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), RadioError>;
}
