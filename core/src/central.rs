//! Finder central: one adapter, one multiplexer, many devices
//!
//! [`FinderCentral`] owns the wiring the agents need. It installs a single
//! [`DelegateMultiplexer`] as the adapter delegate, shares one power-on path
//! across callers and builds a fresh [`ConnectionAgent`] per connect call.

use crate::config::{ConfigError, FinderConfig};
use crate::device::{DeviceId, DeviceIdentity, DeviceSignature, FinderDevice};
use crate::transport::abstraction::{AdapterState, PeripheralId, RadioAdapter};
use crate::transport::ble::connection::ConnectionAgent;
use crate::transport::ble::power::PowerOnAgent;
use crate::transport::multiplexer::DelegateMultiplexer;
use crate::FinderError;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct FinderCentral {
    adapter: Arc<dyn RadioAdapter>,
    multiplexer: Arc<DelegateMultiplexer>,
    power: PowerOnAgent,
    config: FinderConfig,
}

impl FinderCentral {
    /// Wire the central to `adapter`, replacing any delegate it had
    pub fn new(adapter: Arc<dyn RadioAdapter>, config: FinderConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let multiplexer = Arc::new(DelegateMultiplexer::new());
        adapter.set_delegate(multiplexer.clone());
        let power = PowerOnAgent::new(adapter.clone(), multiplexer.clone());

        info!("Finder central ready (adapter {})", adapter.state());
        Ok(Self {
            adapter,
            multiplexer,
            power,
            config,
        })
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &Arc<DelegateMultiplexer> {
        &self.multiplexer
    }

    /// Device found by scanning for its signature on first connect
    pub fn device(&self, id: DeviceId, signature: DeviceSignature) -> FinderDevice {
        self.device_for(Arc::new(DeviceIdentity::new(id, signature)))
    }

    /// Device whose peripheral is already known
    pub fn bound_device(
        &self,
        id: DeviceId,
        signature: DeviceSignature,
        peripheral: PeripheralId,
    ) -> FinderDevice {
        self.device_for(Arc::new(DeviceIdentity::with_peripheral(
            id, signature, peripheral,
        )))
    }

    pub fn device_for(&self, identity: Arc<DeviceIdentity>) -> FinderDevice {
        FinderDevice::new(identity, self.adapter.clone(), &self.config)
    }

    pub async fn power_on(&self) -> Result<(), FinderError> {
        Ok(self.power.power_on().await?)
    }

    /// Power the adapter on, then connect to `device`
    ///
    /// `None` uses the configured connect timeout.
    pub async fn connect(
        &self,
        device: &FinderDevice,
        timeout: Option<Duration>,
    ) -> Result<(), FinderError> {
        self.power.power_on().await?;

        ConnectionAgent::new(
            self.adapter.clone(),
            self.multiplexer.clone(),
            device.identity().clone(),
        )
        .with_default_timeout(self.config.connect_timeout())
        .connect(timeout)
        .await?;
        Ok(())
    }

    /// Connect to every device concurrently, one agent each
    ///
    /// Results come back in input order. One device failing does not affect
    /// the others.
    pub async fn connect_many(
        &self,
        devices: &[&FinderDevice],
        timeout: Option<Duration>,
    ) -> Vec<Result<(), FinderError>> {
        join_all(devices.iter().map(|device| self.connect(device, timeout))).await
    }

    pub fn disconnect_all(&self) {
        info!("Disconnecting all peripherals");
        self.adapter.disconnect_all();
    }
}
