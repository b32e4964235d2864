use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A Bluetooth attribute UUID.
///
/// Stored as a full 128-bit value in little-endian byte order. 16-bit and
/// 32-bit SIG-assigned values are expanded onto the Bluetooth base UUID, so a
/// short UUID and its expanded form compare equal.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// "00000000-0000-1000-8000-00805F9B34FB" in little-endian order.
const BASE_UUID_BYTES: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Offset within the base UUID where the 16/32-bit value is inserted.
const BASE_OFFSET: usize = 12;

impl Uuid {
    /// Creates a UUID from 16 bytes in little-endian order.
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    /// Creates a UUID from 16 bytes in big-endian (textual) order.
    pub fn from_bytes_be(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        Uuid { bytes }
    }

    /// Creates a UUID from its 128-bit integer value, e.g. `0x0000180D_0000_1000_8000_00805F9B34FB`.
    pub const fn from_u128(value: u128) -> Self {
        Uuid {
            bytes: value.to_le_bytes(),
        }
    }

    /// Expands a 16-bit SIG-assigned value onto the base UUID.
    pub const fn from_u16(uuid16: u16) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid16 as u8;
        bytes[BASE_OFFSET + 1] = (uuid16 >> 8) as u8;
        Uuid { bytes }
    }

    /// Expands a 32-bit SIG-assigned value onto the base UUID.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid32 as u8;
        bytes[BASE_OFFSET + 1] = (uuid32 >> 8) as u8;
        bytes[BASE_OFFSET + 2] = (uuid32 >> 16) as u8;
        bytes[BASE_OFFSET + 3] = (uuid32 >> 24) as u8;
        Uuid { bytes }
    }

    /// The 128-bit integer value of this UUID.
    pub const fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.bytes)
    }

    /// Returns the underlying bytes in little-endian order.
    pub const fn as_bytes_le(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Returns the underlying bytes in big-endian order.
    pub fn as_bytes_be(&self) -> [u8; 16] {
        let mut bytes = self.bytes;
        bytes.reverse();
        bytes
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[0..BASE_OFFSET] == BASE_UUID_BYTES[0..BASE_OFFSET]
    }

    /// The 16-bit short form, if this is a SIG-assigned 16-bit UUID.
    pub fn as_u16(&self) -> Option<u16> {
        if self.is_sig_assigned()
            && self.bytes[BASE_OFFSET + 2] == 0
            && self.bytes[BASE_OFFSET + 3] == 0
        {
            Some(u16::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
            ]))
        } else {
            None
        }
    }

    /// The 32-bit short form, if this UUID sits on the base UUID.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
                self.bytes[BASE_OFFSET + 2],
                self.bytes[BASE_OFFSET + 3],
            ]))
        } else {
            None
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl From<u128> for Uuid {
    fn from(value: u128) -> Self {
        Uuid::from_u128(value)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.as_bytes_be();
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "Uuid(0x{:04X})", short),
            None => write!(f, "Uuid({})", self),
        }
    }
}

/// Errors produced when parsing a UUID from text
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UuidParseError {
    #[error("UUID must have 4, 8 or 32 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex in UUID: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts "180D", "0000180D", and the full form with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != '-').collect();

        match cleaned.len() {
            4 => {
                let mut be = [0u8; 2];
                hex::decode_to_slice(&cleaned, &mut be)?;
                Ok(Uuid::from_u16(u16::from_be_bytes(be)))
            }
            8 => {
                let mut be = [0u8; 4];
                hex::decode_to_slice(&cleaned, &mut be)?;
                Ok(Uuid::from_u32(u32::from_be_bytes(be)))
            }
            32 => {
                let mut be = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut be)?;
                Ok(Uuid::from_bytes_be(be))
            }
            n => Err(UuidParseError::InvalidLength(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms_expand_onto_base_uuid() {
        let hrs = Uuid::from_u16(0x180D);
        assert_eq!(hrs.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(hrs.as_u16(), Some(0x180D));
        assert_eq!(hrs, Uuid::from_u128(0x0000180D_0000_1000_8000_00805F9B34FB));
        assert_eq!(Uuid::from_u32(0x0000_180D), hrs);
    }

    #[test]
    fn test_vendor_uuid_has_no_short_form() {
        let button = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);
        assert_eq!(button.as_u16(), None);
        assert_eq!(button.as_u32(), None);
        assert_eq!(button.to_string(), "00001524-1212-efde-1523-785feabcd123");
    }

    #[test]
    fn test_parse() {
        assert_eq!("2A37".parse::<Uuid>().unwrap(), Uuid::from_u16(0x2A37));
        assert_eq!(
            "00002a37-0000-1000-8000-00805f9b34fb".parse::<Uuid>().unwrap(),
            Uuid::from_u16(0x2A37)
        );
        assert_eq!(
            "123".parse::<Uuid>(),
            Err(UuidParseError::InvalidLength(3))
        );
        assert!(matches!(
            "zz00".parse::<Uuid>(),
            Err(UuidParseError::InvalidHex(_))
        ));
    }
}
