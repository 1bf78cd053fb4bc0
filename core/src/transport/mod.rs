// Transport module: radio adapter contract and BLE orchestration

pub mod abstraction;
pub mod ble;
pub mod multiplexer;

#[cfg(test)]
pub mod fake;

pub use abstraction::{
    AdapterDelegate, AdapterState, Advertisement, PeripheralId, PeripheralState, RadioAdapter,
    RadioError,
};
pub use multiplexer::{DelegateMultiplexer, RegistrationToken};
