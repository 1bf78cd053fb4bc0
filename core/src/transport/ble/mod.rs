/// BLE (Bluetooth Low Energy) central orchestration
///
/// - **power**: bring the shared adapter to `PoweredOn`
/// - **connection**: scan, bind and connect one device under a timeout
/// - **framing**: length-prefixed packets chunked to the link MTU
/// - **gatt**: characteristic catalog for finder devices
///
/// Platform code implements [`RadioAdapter`](crate::transport::RadioAdapter);
/// everything here is testable without hardware.

pub mod connection;
pub mod framing;
pub mod gatt;
pub mod power;

pub use connection::{ConnectionAgent, ConnectionError, DEFAULT_CONNECT_TIMEOUT};
pub use framing::{
    chunk, frame, frame_with_limit, FrameError, PacketReassembler, DEFAULT_MAX_FRAME_LEN,
    LENGTH_PREFIX_SIZE,
};
pub use gatt::{
    short_uuid, Characteristic, CharacteristicSpec, FinderCatalog, GattCatalog, GattError,
    ValueType, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID, FINDER_SERVICE_UUID,
};
pub use power::{PowerError, PowerOnAgent};
