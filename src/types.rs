//! Core data model: identifiers, UUIDs and the peripheral record.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::advertisement::{self, DataSection};
use crate::ble::transport::AdvertisementReport;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
/// Bits of a base-derived UUID that carry the 16/32-bit short value.
const SHORT_MASK: u128 = 0xFFFF_FFFF << 96;

/// Addresses at or above this value have both most-significant bits set,
/// which marks a random device address.
const RANDOM_ADDRESS_FLOOR: u64 = 0xC000_0000_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid uuid: {0}")]
pub struct InvalidUuid(pub String);

/// A GATT or advertisement UUID.
///
/// 16 and 32-bit UUIDs are stored expanded onto the Bluetooth base UUID and
/// displayed back in short form (`"180d"`); anything else displays as 32
/// lowercase hex digits without dashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BleUuid(Uuid);

impl BleUuid {
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    pub const fn from_u32(short: u32) -> Self {
        BleUuid(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)))
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        BleUuid(uuid)
    }

    /// Build from the little-endian byte order used on air.
    pub fn from_le_bytes(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        BleUuid(Uuid::from_bytes(bytes))
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut bytes = *self.0.as_bytes();
        bytes.reverse();
        bytes
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The 16 or 32-bit short value if this UUID derives from the base UUID.
    pub fn short(&self) -> Option<u32> {
        let value = self.0.as_u128();
        if value & !SHORT_MASK == BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

impl From<Uuid> for BleUuid {
    fn from(uuid: Uuid) -> Self {
        BleUuid(uuid)
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.short() {
            Some(short) if short <= 0xFFFF => write!(f, "{:04x}", short),
            Some(short) => write!(f, "{:08x}", short),
            None => write!(f, "{}", self.0.simple()),
        }
    }
}

impl FromStr for BleUuid {
    type Err = InvalidUuid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        let invalid = || InvalidUuid(s.to_string());
        if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        match cleaned.len() {
            4 => u16::from_str_radix(&cleaned, 16)
                .map(BleUuid::from_u16)
                .map_err(|_| invalid()),
            8 => u32::from_str_radix(&cleaned, 16)
                .map(BleUuid::from_u32)
                .map_err(|_| invalid()),
            32 => Uuid::parse_str(&cleaned)
                .map(BleUuid)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for BleUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BleUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalize a hardware address string into a peripheral id.
///
/// Separators (`:` and `-`) are stripped; the remainder must be exactly 12
/// hex characters. Case is preserved. Returns `None` on any malformed input.
pub fn address_to_id(address: &str) -> Option<String> {
    let id: String = address.chars().filter(|c| *c != ':' && *c != '-').collect();
    if id.len() != 12 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(id)
}

/// Peripheral id for any accepted address form: [`address_to_id`],
/// lowercased.
pub fn canonical_id(address: &str) -> Option<String> {
    address_to_id(address).map(|id| id.to_ascii_lowercase())
}

/// Parse an address or id string into its 48-bit numeric form.
pub fn parse_address(address: &str) -> Option<u64> {
    let id = address_to_id(address)?;
    let bytes = hex::decode(id).ok()?;
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Canonical peripheral id: 12 lowercase hex digits.
pub fn format_id(address: u64) -> String {
    format!("{:012x}", address & 0xFFFF_FFFF_FFFF)
}

/// Colon separated lowercase form, e.g. `aa:bb:cc:dd:ee:ff`.
pub fn format_address(address: u64) -> String {
    let bytes = (address & 0xFFFF_FFFF_FFFF).to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
    Unknown,
}

impl AddressType {
    pub fn from_address(address: u64) -> Self {
        if address >= RANDOM_ADDRESS_FLOOR {
            AddressType::Random
        } else {
            AddressType::Public
        }
    }
}

/// Adapter state as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RadioState {
    Initial,
    Unsupported,
    Unknown,
    PoweredOn,
    PoweredOff,
}

impl RadioState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioState::Initial => "initial",
            RadioState::Unsupported => "unsupported",
            RadioState::Unknown => "unknown",
            RadioState::PoweredOn => "poweredOn",
            RadioState::PoweredOff => "poweredOff",
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GATT characteristic property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u16);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x0001);
    pub const READ: Self = Self(0x0002);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x0004);
    pub const WRITE: Self = Self(0x0008);
    pub const NOTIFY: Self = Self(0x0010);
    pub const INDICATE: Self = Self(0x0020);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x0040);
    pub const EXTENDED_PROPERTIES: Self = Self(0x0080);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "authenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "extendedProperties"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Serialize for CharacteristicProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

/// One service data entry from an advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceData {
    pub uuid: BleUuid,
    #[serde(serialize_with = "crate::event::serialize_hex")]
    pub data: Vec<u8>,
}

/// Advertisement-derived fields of a peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub tx_power_level: Option<i8>,
    #[serde(serialize_with = "crate::event::serialize_opt_hex")]
    pub manufacturer_data: Option<Vec<u8>>,
    /// Unique by uuid, in first-seen order.
    pub service_data: Vec<ServiceData>,
    pub service_uuids: Vec<BleUuid>,
}

impl Advertisement {
    /// Insert or overwrite a service data entry, keeping first-seen order.
    pub fn merge_service_data(&mut self, uuid: BleUuid, data: Vec<u8>) {
        match self.service_data.iter_mut().find(|entry| entry.uuid == uuid) {
            Some(entry) => entry.data = data,
            None => self.service_data.push(ServiceData { uuid, data }),
        }
    }
}

/// A remote device known to the session, discovered by scanning or
/// synthesized by a connect-by-address.
#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
    pub id: String,
    pub address: u64,
    pub address_type: AddressType,
    pub connectable: bool,
    pub rssi: i16,
    pub advertisement: Advertisement,
}

impl Peripheral {
    pub fn from_report(report: &AdvertisementReport) -> Self {
        let mut peripheral = Self::bare(report.address, report.rssi);
        peripheral.apply_report(report);
        peripheral
    }

    /// A peripheral that was never seen advertising, as if discovered with
    /// an empty connectable advertisement.
    pub fn synthesized(address: u64, rssi: i16) -> Self {
        let mut peripheral = Self::bare(address, rssi);
        peripheral.connectable = true;
        peripheral
    }

    fn bare(address: u64, rssi: i16) -> Self {
        Self {
            id: format_id(address),
            address,
            address_type: AddressType::from_address(address),
            connectable: false,
            rssi,
            advertisement: Advertisement::default(),
        }
    }

    /// Replace advertisement fields from a new report. Service data is the
    /// exception: entries merge by uuid across reports.
    pub fn apply_report(&mut self, report: &AdvertisementReport) {
        self.rssi = report.rssi;
        self.connectable = report.kind.is_connectable();

        let sections: &[DataSection] = &report.sections;
        let adv = &mut self.advertisement;
        adv.local_name = report.local_name.clone().filter(|name| !name.is_empty());
        adv.tx_power_level = advertisement::tx_power_level(sections);
        adv.manufacturer_data = advertisement::manufacturer_data(sections);
        adv.service_uuids = report.service_uuids.clone();
        for section in sections {
            if let Some((uuid, data)) = advertisement::service_data(section) {
                adv.merge_service_data(uuid, data);
            }
        }
    }

    pub fn address_string(&self) -> String {
        format_address(self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertisement::{AD_MANUFACTURER_DATA, AD_SERVICE_DATA_16, AD_TX_POWER_LEVEL};
    use crate::ble::transport::AdvertisementKind;

    #[test]
    fn test_address_to_id() {
        assert_eq!(address_to_id("AA:BB:CC:DD:EE:FF").as_deref(), Some("AABBCCDDEEFF"));
        assert_eq!(address_to_id("aa-bb-cc-dd-ee-ff").as_deref(), Some("aabbccddeeff"));
        assert_eq!(address_to_id("AA:BB"), None);
        assert_eq!(address_to_id("GGHHIIJJKKLL"), None);
        assert_eq!(address_to_id(""), None);
        assert_eq!(address_to_id("AABBCCDDEEFF00"), None);
        assert_eq!(canonical_id("AA:BB:CC:DD:EE:FF").as_deref(), Some("aabbccddeeff"));
    }

    #[test]
    fn test_parse_and_format_address() {
        let address = parse_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(address, 0xAABB_CCDD_EEFF);
        assert_eq!(format_id(address), "aabbccddeeff");
        assert_eq!(format_address(address), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_id(0x0102), "000000000102");
    }

    #[test]
    fn test_address_type() {
        assert_eq!(AddressType::from_address(0x0011_2233_4455), AddressType::Public);
        assert_eq!(AddressType::from_address(0xC011_2233_4455), AddressType::Random);
        assert_eq!(AddressType::from_address(0xBFFF_FFFF_FFFF), AddressType::Public);
    }

    #[test]
    fn test_ble_uuid_short_forms() {
        let hr: BleUuid = "180D".parse().unwrap();
        assert_eq!(hr, BleUuid::from_u16(0x180d));
        assert_eq!(hr.to_string(), "180d");
        assert_eq!(hr.short(), Some(0x180d));

        let full: BleUuid = "0000180d-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(full, hr);

        let wide = BleUuid::from_u32(0x1234_5678);
        assert_eq!(wide.to_string(), "12345678");
    }

    #[test]
    fn test_ble_uuid_custom() {
        let nus: BleUuid = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E".parse().unwrap();
        assert_eq!(nus.short(), None);
        assert_eq!(nus.to_string(), "6e400001b5a3f393e0a9e50e24dcca9e");
        assert_eq!(BleUuid::from_le_bytes(nus.to_le_bytes()), nus);
        assert!("18".parse::<BleUuid>().is_err());
        assert!("zzzz".parse::<BleUuid>().is_err());
    }

    #[test]
    fn test_characteristic_property_names() {
        let props = CharacteristicProperties::READ
            | CharacteristicProperties::NOTIFY
            | CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert_eq!(props.names(), vec!["read", "writeWithoutResponse", "notify"]);
        assert!(props.contains(CharacteristicProperties::NOTIFY));
        assert!(!props.contains(CharacteristicProperties::INDICATE));
    }

    fn report(address: u64, rssi: i16, sections: Vec<DataSection>) -> AdvertisementReport {
        AdvertisementReport {
            address,
            rssi,
            kind: AdvertisementKind::ConnectableUndirected,
            local_name: None,
            sections,
            service_uuids: Vec::new(),
        }
    }

    #[test]
    fn test_advertisement_fields_replaced_wholesale() {
        let mut first = report(
            0x1122_3344_5566,
            -40,
            vec![
                DataSection::new(AD_TX_POWER_LEVEL, vec![0x04]),
                DataSection::new(AD_MANUFACTURER_DATA, vec![0x4c, 0x00]),
            ],
        );
        first.local_name = Some("Thermo".into());
        first.service_uuids = vec![BleUuid::from_u16(0x1809)];
        let mut peripheral = Peripheral::from_report(&first);
        assert_eq!(peripheral.advertisement.local_name.as_deref(), Some("Thermo"));
        assert_eq!(peripheral.advertisement.tx_power_level, Some(4));

        let mut second = report(0x1122_3344_5566, -70, vec![]);
        second.kind = AdvertisementKind::ScanResponse;
        peripheral.apply_report(&second);

        assert_eq!(peripheral.rssi, -70);
        assert!(!peripheral.connectable);
        assert_eq!(peripheral.advertisement.local_name, None);
        assert_eq!(peripheral.advertisement.tx_power_level, None);
        assert_eq!(peripheral.advertisement.manufacturer_data, None);
        assert!(peripheral.advertisement.service_uuids.is_empty());
    }

    #[test]
    fn test_service_data_accumulates_by_uuid() {
        let battery = |level: u8| DataSection::new(AD_SERVICE_DATA_16, vec![0x0F, 0x18, level]);
        let temp = DataSection::new(AD_SERVICE_DATA_16, vec![0x09, 0x18, 0x20]);

        let mut peripheral = Peripheral::from_report(&report(1, -50, vec![battery(90), temp]));
        peripheral.apply_report(&report(1, -50, vec![battery(80)]));

        let entries = &peripheral.advertisement.service_data;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uuid, BleUuid::from_u16(0x180F));
        assert_eq!(entries[0].data, vec![80]);
        assert_eq!(entries[1].uuid, BleUuid::from_u16(0x1809));
        assert_eq!(entries[1].data, vec![0x20]);
    }

    #[test]
    fn test_synthesized_peripheral() {
        let peripheral = Peripheral::synthesized(0xC0FF_EE00_0001, 127);
        assert_eq!(peripheral.id, "c0ffee000001");
        assert_eq!(peripheral.address_string(), "c0:ff:ee:00:00:01");
        assert_eq!(peripheral.address_type, AddressType::Random);
        assert!(peripheral.connectable);
        assert_eq!(peripheral.rssi, 127);
        assert_eq!(peripheral.advertisement, Advertisement::default());
    }
}
