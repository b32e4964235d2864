//! Platform status codes
//!
//! Operation results carry a [`GattStatus`]; connection lifecycle callbacks
//! carry a [`ConnectionStatus`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub const GATT_SUCCESS: u16 = 0x0000;
pub const GATT_INVALID_HANDLE: u16 = 0x0001;
pub const GATT_READ_NOT_PERMITTED: u16 = 0x0002;
pub const GATT_WRITE_NOT_PERMITTED: u16 = 0x0003;
pub const GATT_INVALID_PDU: u16 = 0x0004;
pub const GATT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const GATT_REQUEST_NOT_SUPPORTED: u16 = 0x0006;
pub const GATT_INVALID_OFFSET: u16 = 0x0007;
pub const GATT_INSUFFICIENT_AUTHORIZATION: u16 = 0x0008;
pub const GATT_PREPARE_QUEUE_FULL: u16 = 0x0009;
pub const GATT_ATTRIBUTE_NOT_FOUND: u16 = 0x000A;
pub const GATT_ATTRIBUTE_NOT_LONG: u16 = 0x000B;
pub const GATT_INSUFFICIENT_ENCRYPTION_KEY_SIZE: u16 = 0x000C;
pub const GATT_INVALID_ATTRIBUTE_VALUE_LENGTH: u16 = 0x000D;
pub const GATT_UNLIKELY: u16 = 0x000E;
pub const GATT_INSUFFICIENT_ENCRYPTION: u16 = 0x000F;
pub const GATT_UNSUPPORTED_GROUP_TYPE: u16 = 0x0010;
pub const GATT_INSUFFICIENT_RESOURCES: u16 = 0x0011;
pub const GATT_DATABASE_OUT_OF_SYNC: u16 = 0x0012;
pub const GATT_VALUE_NOT_ALLOWED: u16 = 0x0013;
pub const GATT_APPLICATION_ERROR_START: u16 = 0x0080;
pub const GATT_APPLICATION_ERROR_END: u16 = 0x009F;
pub const GATT_COMMON_PROFILE_ERROR_START: u16 = 0x00E0;
pub const GATT_COMMON_PROFILE_ERROR_END: u16 = 0x00FF;
pub const GATT_ERROR: u16 = 0x0085;
pub const GATT_CONNECTION_CONGESTED: u16 = 0x008F;
pub const GATT_FAILURE: u16 = 0x0101;

/// Status delivered with the result of a GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    Unlikely,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    DatabaseOutOfSync,
    ValueNotAllowed,
    /// Generic stack error, the infamous 133
    GattError,
    ConnectionCongested,
    Failure,
    ApplicationError(u8),
    CommonProfileError(u8),
    Unknown(u16),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }

    /// The raw platform code
    pub fn code(&self) -> u16 {
        match self {
            GattStatus::Success => GATT_SUCCESS,
            GattStatus::InvalidHandle => GATT_INVALID_HANDLE,
            GattStatus::ReadNotPermitted => GATT_READ_NOT_PERMITTED,
            GattStatus::WriteNotPermitted => GATT_WRITE_NOT_PERMITTED,
            GattStatus::InvalidPdu => GATT_INVALID_PDU,
            GattStatus::InsufficientAuthentication => GATT_INSUFFICIENT_AUTHENTICATION,
            GattStatus::RequestNotSupported => GATT_REQUEST_NOT_SUPPORTED,
            GattStatus::InvalidOffset => GATT_INVALID_OFFSET,
            GattStatus::InsufficientAuthorization => GATT_INSUFFICIENT_AUTHORIZATION,
            GattStatus::PrepareQueueFull => GATT_PREPARE_QUEUE_FULL,
            GattStatus::AttributeNotFound => GATT_ATTRIBUTE_NOT_FOUND,
            GattStatus::AttributeNotLong => GATT_ATTRIBUTE_NOT_LONG,
            GattStatus::InsufficientEncryptionKeySize => GATT_INSUFFICIENT_ENCRYPTION_KEY_SIZE,
            GattStatus::InvalidAttributeValueLength => GATT_INVALID_ATTRIBUTE_VALUE_LENGTH,
            GattStatus::Unlikely => GATT_UNLIKELY,
            GattStatus::InsufficientEncryption => GATT_INSUFFICIENT_ENCRYPTION,
            GattStatus::UnsupportedGroupType => GATT_UNSUPPORTED_GROUP_TYPE,
            GattStatus::InsufficientResources => GATT_INSUFFICIENT_RESOURCES,
            GattStatus::DatabaseOutOfSync => GATT_DATABASE_OUT_OF_SYNC,
            GattStatus::ValueNotAllowed => GATT_VALUE_NOT_ALLOWED,
            GattStatus::GattError => GATT_ERROR,
            GattStatus::ConnectionCongested => GATT_CONNECTION_CONGESTED,
            GattStatus::Failure => GATT_FAILURE,
            GattStatus::ApplicationError(code) => *code as u16,
            GattStatus::CommonProfileError(code) => *code as u16,
            GattStatus::Unknown(code) => *code,
        }
    }
}

impl From<u16> for GattStatus {
    fn from(code: u16) -> Self {
        match code {
            GATT_SUCCESS => GattStatus::Success,
            GATT_INVALID_HANDLE => GattStatus::InvalidHandle,
            GATT_READ_NOT_PERMITTED => GattStatus::ReadNotPermitted,
            GATT_WRITE_NOT_PERMITTED => GattStatus::WriteNotPermitted,
            GATT_INVALID_PDU => GattStatus::InvalidPdu,
            GATT_INSUFFICIENT_AUTHENTICATION => GattStatus::InsufficientAuthentication,
            GATT_REQUEST_NOT_SUPPORTED => GattStatus::RequestNotSupported,
            GATT_INVALID_OFFSET => GattStatus::InvalidOffset,
            GATT_INSUFFICIENT_AUTHORIZATION => GattStatus::InsufficientAuthorization,
            GATT_PREPARE_QUEUE_FULL => GattStatus::PrepareQueueFull,
            GATT_ATTRIBUTE_NOT_FOUND => GattStatus::AttributeNotFound,
            GATT_ATTRIBUTE_NOT_LONG => GattStatus::AttributeNotLong,
            GATT_INSUFFICIENT_ENCRYPTION_KEY_SIZE => GattStatus::InsufficientEncryptionKeySize,
            GATT_INVALID_ATTRIBUTE_VALUE_LENGTH => GattStatus::InvalidAttributeValueLength,
            GATT_UNLIKELY => GattStatus::Unlikely,
            GATT_INSUFFICIENT_ENCRYPTION => GattStatus::InsufficientEncryption,
            GATT_UNSUPPORTED_GROUP_TYPE => GattStatus::UnsupportedGroupType,
            GATT_INSUFFICIENT_RESOURCES => GattStatus::InsufficientResources,
            GATT_DATABASE_OUT_OF_SYNC => GattStatus::DatabaseOutOfSync,
            GATT_VALUE_NOT_ALLOWED => GattStatus::ValueNotAllowed,
            // Platform codes live inside the application range, match them first
            GATT_ERROR => GattStatus::GattError,
            GATT_CONNECTION_CONGESTED => GattStatus::ConnectionCongested,
            GATT_FAILURE => GattStatus::Failure,
            c if (GATT_APPLICATION_ERROR_START..=GATT_APPLICATION_ERROR_END).contains(&c) => {
                GattStatus::ApplicationError(c as u8)
            }
            c if (GATT_COMMON_PROFILE_ERROR_START..=GATT_COMMON_PROFILE_ERROR_END).contains(&c) => {
                GattStatus::CommonProfileError(c as u8)
            }
            c => GattStatus::Unknown(c),
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::ApplicationError(code) => write!(f, "ApplicationError(0x{:02X})", code),
            GattStatus::CommonProfileError(code) => {
                write!(f, "CommonProfileError(0x{:02X})", code)
            }
            GattStatus::Unknown(code) => write!(f, "Unknown(0x{:04X})", code),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Status delivered with a connection state change.
///
/// Anything other than [`ConnectionStatus::Success`] and the two deliberate
/// terminations means the link failed or was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Success,
    /// Disconnected on request of this device
    TerminateLocalHost,
    /// Disconnected on request of the peer
    TerminatePeerUser,
    /// Supervision timeout, the remote went out of range
    LinkLoss,
    /// The link could not be established
    FailedToEstablish,
    /// Connected, but the peer lacks required services
    NotSupported,
    Other(u16),
}

impl ConnectionStatus {
    /// Whether the link ended cleanly
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Success
                | ConnectionStatus::TerminateLocalHost
                | ConnectionStatus::TerminatePeerUser
        )
    }

    pub fn code(&self) -> u16 {
        match self {
            ConnectionStatus::Success => 0x00,
            ConnectionStatus::LinkLoss => 0x08,
            ConnectionStatus::TerminatePeerUser => 0x13,
            ConnectionStatus::TerminateLocalHost => 0x16,
            ConnectionStatus::FailedToEstablish => 0x3E,
            ConnectionStatus::NotSupported => 0x1A,
            ConnectionStatus::Unknown => 0xFFFF,
            ConnectionStatus::Other(code) => *code,
        }
    }
}

impl From<u16> for ConnectionStatus {
    fn from(code: u16) -> Self {
        match code {
            0x00 => ConnectionStatus::Success,
            0x08 => ConnectionStatus::LinkLoss,
            0x13 => ConnectionStatus::TerminatePeerUser,
            0x16 => ConnectionStatus::TerminateLocalHost,
            0x3E => ConnectionStatus::FailedToEstablish,
            0x1A => ConnectionStatus::NotSupported,
            0xFFFF => ConnectionStatus::Unknown,
            other => ConnectionStatus::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(GattStatus::from(0x0000), GattStatus::Success);
        assert_eq!(GattStatus::from(0x0003), GattStatus::WriteNotPermitted);
        assert_eq!(GattStatus::from(0x0085), GattStatus::GattError);
        assert_eq!(GattStatus::from(0x0081), GattStatus::ApplicationError(0x81));
        assert_eq!(GattStatus::from(0x00E1), GattStatus::CommonProfileError(0xE1));
        assert_eq!(GattStatus::from(0x0101), GattStatus::Failure);
        assert_eq!(GattStatus::from(0x0042), GattStatus::Unknown(0x42));

        for code in [0x0001u16, 0x000D, 0x0085, 0x008F, 0x0090, 0x00E5, 0x0101] {
            assert_eq!(GattStatus::from(code).code(), code);
        }
    }

    #[test]
    fn test_connection_status_cleanliness() {
        assert!(ConnectionStatus::Success.is_clean());
        assert!(ConnectionStatus::TerminateLocalHost.is_clean());
        assert!(!ConnectionStatus::LinkLoss.is_clean());
        assert!(!ConnectionStatus::NotSupported.is_clean());
        assert_eq!(ConnectionStatus::from(0x08), ConnectionStatus::LinkLoss);
    }
}
