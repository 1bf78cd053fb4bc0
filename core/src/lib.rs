// FinderLink Core: BLE central orchestration for finder devices
//
// Powers the shared radio on, connects to many finders at once without their
// callbacks crossing, and moves length-framed packets over small GATT writes.
// Platform radio stacks plug in through `transport::RadioAdapter`.

pub mod central;
pub mod config;
pub mod device;
pub mod sync;
pub mod transport;

use thiserror::Error;

pub use central::FinderCentral;
pub use config::{ConfigError, FinderConfig};
pub use device::{DeviceError, DeviceId, DeviceIdentity, DeviceSignature, FinderDevice};
pub use sync::{
    BoundedLock, BoundedLockGuard, Completion, LockTimeout, LockTimeoutPolicy, ResultState,
    TimerHandle,
};
pub use transport::ble::{
    ConnectionAgent, ConnectionError, FrameError, PacketReassembler, PowerError, PowerOnAgent,
};
pub use transport::{
    AdapterDelegate, AdapterState, Advertisement, DelegateMultiplexer, PeripheralId,
    PeripheralState, RadioAdapter, RadioError, RegistrationToken,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinderError {
    #[error(transparent)]
    Power(#[from] PowerError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Install the global `tracing` subscriber (idempotent)
///
/// Honours `RUST_LOG`; falls back to `info`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
