//! GATT constants

use crate::uuid::Uuid;

// Declaration and descriptor UUIDs
pub const PRIMARY_SERVICE_UUID: u16 = 0x2800;
pub const SECONDARY_SERVICE_UUID: u16 = 0x2801;
pub const CHARACTERISTIC_UUID: u16 = 0x2803;
pub const CHAR_USER_DESC_UUID: u16 = 0x2901;
pub const CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;

/// Client characteristic configuration descriptor
pub const CCCD: Uuid = Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID);

// CCCD values
pub const CCCD_DISABLED: [u8; 2] = [0x00, 0x00];
pub const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];
pub const CCCD_INDICATE: [u8; 2] = [0x02, 0x00];

// MTU limits
pub const DEFAULT_MTU: u16 = 23;
pub const MAX_MTU: u16 = 517;

/// Opcode (1) + handle (2)
pub const MTU_HEADER_SIZE: usize = 3;

/// Prepared writes held per reliable write transaction
pub const PREPARE_WRITE_QUEUE_SIZE: usize = 64;

/// First handle handed out by the tree builder
pub const HANDLE_MIN: u16 = 0x0001;
