//! Error types for the rustygatt library
//!
//! Every fallible operation in the crate returns [`GattError`]. Failures are
//! delivered to the caller that issued the specific operation; only
//! [`GattError::ConnectionLost`] drains a whole connection queue.

use thiserror::Error;

use crate::gatt::operation::OperationKind;
use crate::gatt::status::GattStatus;
use crate::gatt::state::LinkState;
use crate::uuid::Uuid;

/// Errors that can occur while talking GATT over a connection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GattError {
    #[error("Connection lost")]
    ConnectionLost,

    #[error("{kind} timed out waiting for its callback")]
    OperationTimeout { kind: OperationKind },

    #[error("{kind} failed with status {status} (0x{code:04X})", code = .status.code())]
    PlatformStatus { kind: OperationKind, status: GattStatus },

    #[error("Not ready: the link is not up or services are not discovered")]
    NotReady,

    #[error("{what} {uuid} not found")]
    NotFound { what: &'static str, uuid: Uuid },

    #[error("Attribute with handle 0x{0:04X} not found")]
    HandleNotFound(u16),

    #[error("{uuid} matches {count} instances, use the instance id")]
    Ambiguous { uuid: Uuid, count: usize },

    #[error("Attribute table needs more than 0xFFFF handles")]
    HandleSpaceExhausted,

    #[error("Reliable write transaction already open")]
    TransactionAlreadyOpen,

    #[error("No reliable write transaction is open")]
    NoOpenTransaction,

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Invalid state transition from {from:?} on {event}")]
    InvalidState { from: LinkState, event: &'static str },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    Closed,
}

impl GattError {
    /// Whether this failure ends the connection rather than a single operation
    pub fn is_fatal(&self) -> bool {
        matches!(self, GattError::ConnectionLost | GattError::Closed)
    }

    /// Platform status carried by this error, if any
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            GattError::PlatformStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GattError>;
