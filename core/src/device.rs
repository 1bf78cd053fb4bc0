//! Finder devices: identity, advertisement matching and characteristic I/O
//!
//! A [`DeviceIdentity`] says which advertisement belongs to a device and, once
//! known, which radio peripheral it is bound to. A [`FinderDevice`] wraps an
//! identity with everything needed to talk to the device once connected:
//! catalog lookups, the bounded lock serializing GATT traffic, and the packet
//! reassembler for inbound notifications.

use crate::config::FinderConfig;
use crate::sync::{BoundedLock, LockTimeout};
use crate::transport::abstraction::{
    Advertisement, PeripheralId, PeripheralState, RadioAdapter, RadioError,
};
use crate::transport::ble::framing::{self, FrameError, PacketReassembler};
use crate::transport::ble::gatt::{CharacteristicSpec, FinderCatalog, GattCatalog, GattError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Application-level identifier of a finder device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a device's advertisement must carry for it to be recognised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSignature {
    /// Leading bytes of one of the advertised service UUIDs
    ServiceUuidPrefix(Vec<u8>),
    /// Leading bytes of the manufacturer data
    ManufacturerPrefix(Vec<u8>),
    /// Exact advertised local name
    LocalName(String),
}

impl DeviceSignature {
    /// Finders encode their major and minor numbers (big-endian) at the front
    /// of an advertised service UUID
    pub fn major_minor(major: u16, minor: u16) -> Self {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&major.to_be_bytes());
        bytes.extend_from_slice(&minor.to_be_bytes());
        DeviceSignature::ServiceUuidPrefix(bytes)
    }

    /// Whether `advertisement` was sent by the device with this signature
    ///
    /// Advertised data shorter than the expected bytes never matches. An empty
    /// expected byte string matches nothing.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        match self {
            DeviceSignature::ServiceUuidPrefix(expected) => {
                !expected.is_empty()
                    && advertisement.service_uuids.iter().any(|uuid| {
                        uuid.as_bytes().get(..expected.len()) == Some(expected.as_slice())
                    })
            }
            DeviceSignature::ManufacturerPrefix(expected) => {
                !expected.is_empty()
                    && advertisement.manufacturer_data.get(..expected.len())
                        == Some(expected.as_slice())
            }
            DeviceSignature::LocalName(name) => {
                advertisement.local_name.as_deref() == Some(name.as_str())
            }
        }
    }
}

impl fmt::Display for DeviceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSignature::ServiceUuidPrefix(bytes) => {
                write!(f, "service-uuid:{}", hex::encode(bytes))
            }
            DeviceSignature::ManufacturerPrefix(bytes) => {
                write!(f, "manufacturer:{}", hex::encode(bytes))
            }
            DeviceSignature::LocalName(name) => write!(f, "name:{}", name),
        }
    }
}

/// Identity of a finder and its radio binding
#[derive(Debug)]
pub struct DeviceIdentity {
    id: DeviceId,
    signature: DeviceSignature,
    peripheral: RwLock<Option<PeripheralId>>,
}

impl DeviceIdentity {
    /// Identity whose radio address is not known yet
    pub fn new(id: DeviceId, signature: DeviceSignature) -> Self {
        Self {
            id,
            signature,
            peripheral: RwLock::new(None),
        }
    }

    /// Identity already bound to a known peripheral
    pub fn with_peripheral(
        id: DeviceId,
        signature: DeviceSignature,
        peripheral: PeripheralId,
    ) -> Self {
        Self {
            id,
            signature,
            peripheral: RwLock::new(Some(peripheral)),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn signature(&self) -> &DeviceSignature {
        &self.signature
    }

    pub fn peripheral(&self) -> Option<PeripheralId> {
        *self.peripheral.read()
    }

    pub fn is_bound(&self) -> bool {
        self.peripheral.read().is_some()
    }

    /// Bind to `peripheral` unless already bound. Returns true if this call bound it.
    pub fn bind_if_unbound(&self, peripheral: PeripheralId) -> bool {
        let mut slot = self.peripheral.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(peripheral);
        info!("Device {} bound to peripheral {}", self.id, peripheral);
        true
    }

    /// Forget the binding, e.g. after the platform recycled the handle
    pub fn unbind(&self) {
        self.peripheral.write().take();
    }

    /// Whether an advertisement belongs to this device
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        self.signature.matches(advertisement)
    }
}

/// Errors for device-level I/O
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device {0} is not bound to a peripheral")]
    NotBound(DeviceId),

    #[error("Device {0} is not connected")]
    NotConnected(DeviceId),

    #[error(transparent)]
    Gatt(#[from] GattError),

    #[error(transparent)]
    Lock(#[from] LockTimeout),

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Connected-device surface: characteristic reads and writes, packet I/O
///
/// Every GATT operation runs under the device's [`BoundedLock`], so a
/// multi-chunk packet write is never interleaved with other traffic.
pub struct FinderDevice {
    identity: Arc<DeviceIdentity>,
    adapter: Arc<dyn RadioAdapter>,
    catalog: Arc<dyn GattCatalog>,
    lock: BoundedLock,
    reassembler: Mutex<PacketReassembler>,
    max_chunk_size: usize,
    max_frame_len: u32,
}

impl FinderDevice {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        adapter: Arc<dyn RadioAdapter>,
        config: &FinderConfig,
    ) -> Self {
        Self::with_catalog(identity, adapter, Arc::new(FinderCatalog), config)
    }

    pub fn with_catalog(
        identity: Arc<DeviceIdentity>,
        adapter: Arc<dyn RadioAdapter>,
        catalog: Arc<dyn GattCatalog>,
        config: &FinderConfig,
    ) -> Self {
        Self {
            identity,
            adapter,
            catalog,
            lock: BoundedLock::new(
                config.lock_permits,
                config.lock_ceiling(),
                config.lock_timeout_policy,
            ),
            reassembler: Mutex::new(PacketReassembler::new(config.max_frame_len)),
            max_chunk_size: config.max_chunk_size,
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.identity.id()
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    /// Link state reported by the radio, `Disconnected` while unbound
    pub fn link_state(&self) -> PeripheralState {
        self.identity
            .peripheral()
            .map(|peripheral| self.adapter.peripheral_state(peripheral))
            .unwrap_or(PeripheralState::Disconnected)
    }

    fn connected_peripheral(&self) -> Result<PeripheralId, DeviceError> {
        let peripheral = self
            .identity
            .peripheral()
            .ok_or_else(|| DeviceError::NotBound(self.id().clone()))?;
        if self.adapter.peripheral_state(peripheral) != PeripheralState::Connected {
            return Err(DeviceError::NotConnected(self.id().clone()));
        }
        Ok(peripheral)
    }

    fn lookup(&self, name: &str) -> Result<CharacteristicSpec, DeviceError> {
        self.catalog
            .lookup(name)
            .ok_or_else(|| DeviceError::Gatt(GattError::UnknownCharacteristic(name.to_string())))
    }

    /// Read a characteristic by logical name
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, DeviceError> {
        let spec = self.lookup(name)?;
        let peripheral = self.connected_peripheral()?;

        let _guard = self.lock.acquire().await?;
        let value = self
            .adapter
            .read_characteristic(peripheral, spec.service, spec.characteristic)
            .await?;
        debug!("Read {} from {}: {} bytes", name, self.id(), value.len());
        Ok(value)
    }

    /// Write a characteristic by logical name
    pub async fn write(&self, name: &str, value: Vec<u8>) -> Result<(), DeviceError> {
        let spec = self.lookup(name)?;
        spec.validate_value(&value)?;
        let peripheral = self.connected_peripheral()?;

        let _guard = self.lock.acquire().await?;
        debug!("Writing {} to {}: {} bytes", name, self.id(), value.len());
        self.adapter
            .write_characteristic(peripheral, spec.service, spec.characteristic, value)
            .await?;
        Ok(())
    }

    /// Frame `payload`, split it to the link chunk size and write every chunk
    /// in order. Returns the number of chunks written.
    pub async fn send_packet(&self, name: &str, payload: &[u8]) -> Result<usize, DeviceError> {
        let spec = self.lookup(name)?;
        let framed = framing::frame_with_limit(payload, self.max_frame_len)?;
        let chunks = framing::chunk(&framed, self.max_chunk_size)?;
        let peripheral = self.connected_peripheral()?;

        let _guard = self.lock.acquire().await?;
        let total = chunks.len();
        for chunk in chunks {
            self.adapter
                .write_characteristic(peripheral, spec.service, spec.characteristic, chunk)
                .await?;
        }
        debug!(
            "Sent {} byte packet to {} in {} chunks",
            payload.len(),
            self.id(),
            total
        );
        Ok(total)
    }

    /// Feed an inbound notification chunk. Returns the packets it completed.
    pub fn receive_chunk(&self, chunk: &[u8]) -> Result<usize, DeviceError> {
        Ok(self.reassembler.lock().add_chunk(chunk)?)
    }

    /// Oldest completed inbound packet, left queued
    pub fn oldest_packet(&self) -> Option<Vec<u8>> {
        self.reassembler.lock().oldest_packet().map(<[u8]>::to_vec)
    }

    /// Drop the oldest completed inbound packet once it has been handled
    pub fn remove_packet(&self) -> Option<Vec<u8>> {
        self.reassembler.lock().remove_packet()
    }

    pub fn pending_packets(&self) -> usize {
        self.reassembler.lock().completed_count()
    }
}
