//! Remote device identity

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 48-bit Bluetooth device address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Creates an address from its bytes in display order
    pub const fn new(bytes: [u8; 6]) -> Self {
        DeviceAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({})", self)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid device address: {0:?}")]
pub struct AddressParseError(pub String);

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(DeviceAddress(bytes))
    }
}

/// Bonding state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// A remote peripheral (client role) or a remote central (server role)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub bond_state: BondState,
}

impl Device {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            name: None,
            bond_state: BondState::None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The name, falling back to the address
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]);
        assert_eq!(addr.to_string(), "AA:BB:CC:00:11:22");
        assert_eq!("aa:bb:cc:00:11:22".parse::<DeviceAddress>().unwrap(), addr);
        assert!("AA:BB:CC:00:11".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:00:11:22:33".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:00:11:ZZ".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let device = Device::new(DeviceAddress::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(device.display_name(), "01:02:03:04:05:06");
        assert_eq!(device.with_name("HRM").display_name(), "HRM");
    }
}
