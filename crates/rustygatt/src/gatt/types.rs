//! Common types for GATT operations

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Attribute handle. Unique within one GATT tree, it doubles as the instance
/// id that disambiguates attributes sharing a UUID.
pub type Handle = u16;

bitflags! {
    /// Characteristic properties as defined in the Bluetooth specification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperty: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperty {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_write_without_response(&self) -> bool {
        self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }

    /// Whether a client can subscribe to value changes
    pub fn can_subscribe(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

bitflags! {
    /// Attribute permissions, only meaningful for the local (server) tree
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permission: u16 {
        const READ = 0x0001;
        const READ_ENCRYPTED = 0x0002;
        const READ_ENCRYPTED_MITM = 0x0004;
        const WRITE = 0x0010;
        const WRITE_ENCRYPTED = 0x0020;
        const WRITE_ENCRYPTED_MITM = 0x0040;
        const WRITE_SIGNED = 0x0080;
        const WRITE_SIGNED_MITM = 0x0100;
    }
}

impl Permission {
    pub fn can_read(&self) -> bool {
        self.intersects(Self::READ | Self::READ_ENCRYPTED | Self::READ_ENCRYPTED_MITM)
    }

    pub fn can_write(&self) -> bool {
        self.intersects(
            Self::WRITE
                | Self::WRITE_ENCRYPTED
                | Self::WRITE_ENCRYPTED_MITM
                | Self::WRITE_SIGNED
                | Self::WRITE_SIGNED_MITM,
        )
    }

    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }
}

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// Write request, acknowledged by the peer
    WithResponse,
    /// Write command, no acknowledgement on the air
    WithoutResponse,
    /// Signed write command
    Signed,
}

impl WriteType {
    pub fn needs_response(&self) -> bool {
        *self == WriteType::WithResponse
    }
}

/// Physical layer of one direction of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Coding preference for [`Phy::LeCoded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhyOption {
    NoPreferred,
    S2,
    S8,
}

/// Negotiated transmitter and receiver PHY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhyPair {
    pub tx: Phy,
    pub rx: Phy,
}

impl Default for PhyPair {
    fn default() -> Self {
        Self {
            tx: Phy::Le1M,
            rx: Phy::Le1M,
        }
    }
}

/// Service declaration type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Primary,
    Secondary,
}

/// Subscription state held in a client characteristic configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CccdState {
    pub notify: bool,
    pub indicate: bool,
}

impl CccdState {
    pub const DISABLED: CccdState = CccdState {
        notify: false,
        indicate: false,
    };

    /// Decodes a CCCD value. Anything but two bytes is rejected.
    pub fn parse(value: &[u8]) -> Option<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};

        if value.len() != 2 {
            return None;
        }
        let mut reader = value;
        let flags = reader.read_u16::<LittleEndian>().ok()?;
        Some(Self {
            notify: flags & 0x0001 != 0,
            indicate: flags & 0x0002 != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        let mut flags = 0u16;
        if self.notify {
            flags |= 0x0001;
        }
        if self.indicate {
            flags |= 0x0002;
        }
        flags.to_le_bytes()
    }

    pub fn is_enabled(&self) -> bool {
        self.notify || self.indicate
    }
}
