//! Advertising data (AD structure) parsing
//!
//! Advertising payloads are a sequence of `[length, type, value...]`
//! structures. Platforms that hand us raw bytes get split into
//! [`DataSection`]s here; the helpers below extract the fields a
//! peripheral record cares about.

use serde::{Deserialize, Serialize};

use crate::types::BleUuid;

pub const AD_INCOMPLETE_UUIDS_16: u8 = 0x02;
pub const AD_COMPLETE_UUIDS_16: u8 = 0x03;
pub const AD_INCOMPLETE_UUIDS_32: u8 = 0x04;
pub const AD_COMPLETE_UUIDS_32: u8 = 0x05;
pub const AD_INCOMPLETE_UUIDS_128: u8 = 0x06;
pub const AD_COMPLETE_UUIDS_128: u8 = 0x07;
pub const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
pub const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TX_POWER_LEVEL: u8 = 0x0A;
pub const AD_SERVICE_DATA_16: u8 = 0x16;
pub const AD_SERVICE_DATA_32: u8 = 0x20;
pub const AD_SERVICE_DATA_128: u8 = 0x21;
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// One AD structure: its type byte and value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSection {
    pub data_type: u8,
    pub data: Vec<u8>,
}

impl DataSection {
    pub fn new(data_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data_type,
            data: data.into(),
        }
    }
}

/// Split raw advertising data into sections. Parsing stops at the first
/// zero-length or truncated structure.
pub fn parse_sections(raw: &[u8]) -> Vec<DataSection> {
    let mut sections = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let len = raw[i] as usize;
        if len == 0 || i + len >= raw.len() {
            break;
        }
        sections.push(DataSection::new(raw[i + 1], &raw[i + 2..i + 1 + len]));
        i += len + 1;
    }
    sections
}

/// Complete local name if present, else the shortened one.
pub fn local_name(sections: &[DataSection]) -> Option<String> {
    let find = |ty: u8| {
        sections
            .iter()
            .find(|s| s.data_type == ty && !s.data.is_empty())
            .map(|s| String::from_utf8_lossy(&s.data).into_owned())
    };
    find(AD_COMPLETE_LOCAL_NAME).or_else(|| find(AD_SHORTENED_LOCAL_NAME))
}

/// Service UUIDs from all 16, 32 and 128-bit UUID list sections, in order.
pub fn service_uuids(sections: &[DataSection]) -> Vec<BleUuid> {
    let mut uuids = Vec::new();
    for section in sections {
        match section.data_type {
            AD_INCOMPLETE_UUIDS_16 | AD_COMPLETE_UUIDS_16 => {
                for chunk in section.data.chunks_exact(2) {
                    uuids.push(BleUuid::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            AD_INCOMPLETE_UUIDS_32 | AD_COMPLETE_UUIDS_32 => {
                for chunk in section.data.chunks_exact(4) {
                    uuids.push(BleUuid::from_u32(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ])));
                }
            }
            AD_INCOMPLETE_UUIDS_128 | AD_COMPLETE_UUIDS_128 => {
                for chunk in section.data.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    uuids.push(BleUuid::from_le_bytes(bytes));
                }
            }
            _ => {}
        }
    }
    uuids
}

/// Signed TX power level in dBm.
pub fn tx_power_level(sections: &[DataSection]) -> Option<i8> {
    sections
        .iter()
        .rev()
        .find(|s| s.data_type == AD_TX_POWER_LEVEL)
        .and_then(|s| s.data.first())
        .map(|b| *b as i8)
}

/// Manufacturer specific data (company id included), last section wins.
pub fn manufacturer_data(sections: &[DataSection]) -> Option<Vec<u8>> {
    sections
        .iter()
        .rev()
        .find(|s| s.data_type == AD_MANUFACTURER_DATA)
        .map(|s| s.data.clone())
}

/// Embedded UUID and payload of a service data section, or `None` if the
/// section is not service data or too short to hold its UUID.
pub fn service_data(section: &DataSection) -> Option<(BleUuid, Vec<u8>)> {
    let data = &section.data;
    match section.data_type {
        AD_SERVICE_DATA_16 if data.len() >= 2 => Some((
            BleUuid::from_u16(u16::from_le_bytes([data[0], data[1]])),
            data[2..].to_vec(),
        )),
        AD_SERVICE_DATA_32 if data.len() >= 4 => Some((
            BleUuid::from_u32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            data[4..].to_vec(),
        )),
        AD_SERVICE_DATA_128 if data.len() >= 16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&data[..16]);
            Some((BleUuid::from_le_bytes(bytes), data[16..].to_vec()))
        }
        _ => None,
    }
}
