/// GATT catalog for finder devices
///
/// Static table from logical characteristic names to the service and
/// characteristic UUIDs a finder exposes, plus the value type stored there.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth SIG base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into a full UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Finder control service (0xFE10)
pub const FINDER_SERVICE_UUID: Uuid = short_uuid(0xFE10);

/// Battery service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = short_uuid(0x180F);

/// Device information service (0x180A)
pub const DEVICE_INFO_SERVICE_UUID: Uuid = short_uuid(0x180A);

/// Errors for catalog lookups and value checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(String),
    #[error("Invalid value for {name}: expected {expected} bytes, got {got}")]
    InvalidValueLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },
}

/// How a characteristic value is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Opaque bytes, any length
    Bytes,
    /// One unsigned byte
    U8,
    /// Little-endian u16
    U16,
    /// UTF-8 text
    Utf8,
}

impl ValueType {
    /// Fixed encoded size, if the type has one
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            ValueType::U8 => Some(1),
            ValueType::U16 => Some(2),
            ValueType::Bytes | ValueType::Utf8 => None,
        }
    }
}

/// Characteristics known on finder devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Characteristic {
    /// Single-write device commands (ring, lock, stay awake)
    Command,
    /// Notified chunks of framed inbound packets
    PacketIn,
    /// Written chunks of framed outbound packets
    PacketOut,
    /// Advertising interval in units of 0.625 ms
    AdvertisingInterval,
    /// Battery percentage
    BatteryLevel,
    /// Firmware revision string
    FirmwareRevision,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Characteristic::Command,
        Characteristic::PacketIn,
        Characteristic::PacketOut,
        Characteristic::AdvertisingInterval,
        Characteristic::BatteryLevel,
        Characteristic::FirmwareRevision,
    ];

    /// Logical name used for lookups
    pub fn name(&self) -> &'static str {
        match self {
            Characteristic::Command => "command",
            Characteristic::PacketIn => "packet_in",
            Characteristic::PacketOut => "packet_out",
            Characteristic::AdvertisingInterval => "advertising_interval",
            Characteristic::BatteryLevel => "battery_level",
            Characteristic::FirmwareRevision => "firmware_revision",
        }
    }

    pub fn spec(&self) -> CharacteristicSpec {
        let (service, short, value_type) = match self {
            Characteristic::Command => (FINDER_SERVICE_UUID, 0xFE11, ValueType::Bytes),
            Characteristic::PacketIn => (FINDER_SERVICE_UUID, 0xFE12, ValueType::Bytes),
            Characteristic::PacketOut => (FINDER_SERVICE_UUID, 0xFE13, ValueType::Bytes),
            Characteristic::AdvertisingInterval => (FINDER_SERVICE_UUID, 0xFE14, ValueType::U16),
            Characteristic::BatteryLevel => (BATTERY_SERVICE_UUID, 0x2A19, ValueType::U8),
            Characteristic::FirmwareRevision => (DEVICE_INFO_SERVICE_UUID, 0x2A26, ValueType::Utf8),
        };
        CharacteristicSpec {
            name: self.name(),
            service,
            characteristic: short_uuid(short),
            value_type,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Characteristic {
    type Err = GattError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Characteristic::ALL
            .iter()
            .copied()
            .find(|characteristic| characteristic.name() == name)
            .ok_or_else(|| GattError::UnknownCharacteristic(name.to_string()))
    }
}

/// Where a characteristic lives and what it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSpec {
    pub name: &'static str,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value_type: ValueType,
}

impl CharacteristicSpec {
    /// Check a value against the characteristic's fixed size, if any
    pub fn validate_value(&self, value: &[u8]) -> Result<(), GattError> {
        match self.value_type.fixed_len() {
            Some(expected) if expected != value.len() => Err(GattError::InvalidValueLength {
                name: self.name,
                expected,
                got: value.len(),
            }),
            _ => Ok(()),
        }
    }
}

/// Lookup surface the core needs from a GATT catalog
pub trait GattCatalog: Send + Sync {
    /// Resolve a logical characteristic name
    fn lookup(&self, name: &str) -> Option<CharacteristicSpec>;

    /// Every service UUID the catalog defines, without duplicates
    fn all_defined_services(&self) -> Vec<Uuid>;
}

/// Catalog of the finder device family
#[derive(Debug, Clone, Copy, Default)]
pub struct FinderCatalog;

impl GattCatalog for FinderCatalog {
    fn lookup(&self, name: &str) -> Option<CharacteristicSpec> {
        name.parse::<Characteristic>()
            .ok()
            .map(|characteristic| characteristic.spec())
    }

    fn all_defined_services(&self) -> Vec<Uuid> {
        let mut services = Vec::new();
        for characteristic in Characteristic::ALL {
            let service = characteristic.spec().service;
            if !services.contains(&service) {
                services.push(service);
            }
        }
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            Characteristic::BatteryLevel.spec().characteristic.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_lookup_by_name() {
        let spec = FinderCatalog.lookup("packet_out").expect("known characteristic");
        assert_eq!(spec.service, FINDER_SERVICE_UUID);
        assert_eq!(spec.characteristic, short_uuid(0xFE13));
        assert_eq!(spec.value_type, ValueType::Bytes);

        assert!(FinderCatalog.lookup("self_destruct").is_none());
    }

    #[test]
    fn test_name_roundtrip_for_all_variants() {
        for characteristic in Characteristic::ALL {
            let parsed: Characteristic = characteristic.name().parse().expect("parse");
            assert_eq!(parsed, characteristic);
        }
    }

    #[test]
    fn test_unknown_name_error() {
        let err = "nope".parse::<Characteristic>().unwrap_err();
        assert_eq!(err, GattError::UnknownCharacteristic("nope".to_string()));
    }

    #[test]
    fn test_all_defined_services_unique() {
        let services = FinderCatalog.all_defined_services();
        assert_eq!(
            services,
            vec![
                FINDER_SERVICE_UUID,
                BATTERY_SERVICE_UUID,
                DEVICE_INFO_SERVICE_UUID
            ]
        );
    }

    #[test]
    fn test_characteristic_uuids_distinct() {
        let mut uuids: Vec<Uuid> = Characteristic::ALL
            .iter()
            .map(|characteristic| characteristic.spec().characteristic)
            .collect();
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), Characteristic::ALL.len());
    }

    #[test]
    fn test_validate_fixed_len_values() {
        let battery = Characteristic::BatteryLevel.spec();
        assert!(battery.validate_value(&[80]).is_ok());
        assert_eq!(
            battery.validate_value(&[80, 1]),
            Err(GattError::InvalidValueLength {
                name: "battery_level",
                expected: 1,
                got: 2,
            })
        );

        let command = Characteristic::Command.spec();
        assert!(command.validate_value(&[0x01, 0x02, 0x03]).is_ok());
    }
}
