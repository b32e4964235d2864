//! Operations issued through the operation gate

use std::fmt;

use tokio::time::Instant;

use crate::gatt::tree::Service;
use crate::gatt::types::{Handle, Phy, PhyOption, PhyPair, WriteType};

/// What an operation does, used together with [`Target`] to correlate its
/// callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Discover,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
    RequestMtu,
    SetPhy,
    ReadPhy,
    ReliableWriteBegin,
    ReliableWriteExecute,
    ReliableWriteAbort,
    Notify,
    Indicate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "Connect",
            OperationKind::Disconnect => "Disconnect",
            OperationKind::Discover => "Service discovery",
            OperationKind::ReadCharacteristic => "Characteristic read",
            OperationKind::WriteCharacteristic => "Characteristic write",
            OperationKind::ReadDescriptor => "Descriptor read",
            OperationKind::WriteDescriptor => "Descriptor write",
            OperationKind::ReadRssi => "RSSI read",
            OperationKind::RequestMtu => "MTU request",
            OperationKind::SetPhy => "PHY update",
            OperationKind::ReadPhy => "PHY read",
            OperationKind::ReliableWriteBegin => "Reliable write begin",
            OperationKind::ReliableWriteExecute => "Reliable write execute",
            OperationKind::ReliableWriteAbort => "Reliable write abort",
            OperationKind::Notify => "Notification",
            OperationKind::Indicate => "Indication",
        };
        f.write_str(name)
    }
}

/// The attribute an operation is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    None,
    /// Characteristic value handle
    Characteristic(Handle),
    /// Descriptor handle
    Descriptor(Handle),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::None => f.write_str("-"),
            Target::Characteristic(handle) => write!(f, "characteristic 0x{:04X}", handle),
            Target::Descriptor(handle) => write!(f, "descriptor 0x{:04X}", handle),
        }
    }
}

/// The single operation a connection may have outstanding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub target: Target,
    pub created: Instant,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, target: Target) -> Self {
        Self {
            kind,
            target,
            created: Instant::now(),
        }
    }

    /// Whether a callback of this kind and target belongs to this operation
    pub fn matches(&self, kind: OperationKind, target: Target) -> bool {
        self.kind == kind && self.target == target
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::None => write!(f, "{}", self.kind),
            target => write!(f, "{} ({})", self.kind, target),
        }
    }
}

/// A single platform call made by a client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    DiscoverServices,
    ReadCharacteristic {
        handle: Handle,
    },
    WriteCharacteristic {
        handle: Handle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor {
        handle: Handle,
    },
    WriteDescriptor {
        handle: Handle,
        value: Vec<u8>,
    },
    ReadRssi,
    RequestMtu {
        mtu: u16,
    },
    SetPreferredPhy {
        tx: Phy,
        rx: Phy,
        option: PhyOption,
    },
    ReadPhy,
    BeginReliableWrite,
    ExecuteReliableWrite,
    AbortReliableWrite,
}

impl GattRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            GattRequest::DiscoverServices => OperationKind::Discover,
            GattRequest::ReadCharacteristic { .. } => OperationKind::ReadCharacteristic,
            GattRequest::WriteCharacteristic { .. } => OperationKind::WriteCharacteristic,
            GattRequest::ReadDescriptor { .. } => OperationKind::ReadDescriptor,
            GattRequest::WriteDescriptor { .. } => OperationKind::WriteDescriptor,
            GattRequest::ReadRssi => OperationKind::ReadRssi,
            GattRequest::RequestMtu { .. } => OperationKind::RequestMtu,
            GattRequest::SetPreferredPhy { .. } => OperationKind::SetPhy,
            GattRequest::ReadPhy => OperationKind::ReadPhy,
            GattRequest::BeginReliableWrite => OperationKind::ReliableWriteBegin,
            GattRequest::ExecuteReliableWrite => OperationKind::ReliableWriteExecute,
            GattRequest::AbortReliableWrite => OperationKind::ReliableWriteAbort,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            GattRequest::ReadCharacteristic { handle }
            | GattRequest::WriteCharacteristic { handle, .. } => Target::Characteristic(*handle),
            GattRequest::ReadDescriptor { handle } | GattRequest::WriteDescriptor { handle, .. } => {
                Target::Descriptor(*handle)
            }
            _ => Target::None,
        }
    }

    /// Begin and abort return synchronously on the platform; every other
    /// call completes through a callback.
    pub fn expects_callback(&self) -> bool {
        !matches!(
            self,
            GattRequest::BeginReliableWrite | GattRequest::AbortReliableWrite
        )
    }

    pub fn pending(&self) -> PendingOperation {
        PendingOperation::new(self.kind(), self.target())
    }
}

/// Successful outcome of a resolved operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Operation completed without a callback payload
    Done,
    Services(Vec<Service>),
    /// Value read, or value acknowledged by a write
    Value(Vec<u8>),
    Rssi(i16),
    Mtu(u16),
    Phy(PhyPair),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_identity() {
        let read = GattRequest::ReadCharacteristic { handle: 0x0003 };
        assert_eq!(read.kind(), OperationKind::ReadCharacteristic);
        assert_eq!(read.target(), Target::Characteristic(0x0003));
        assert!(read.expects_callback());

        let desc = GattRequest::WriteDescriptor {
            handle: 0x0006,
            value: vec![0x01, 0x00],
        };
        assert_eq!(desc.target(), Target::Descriptor(0x0006));
        assert_eq!(GattRequest::ReadRssi.target(), Target::None);
        assert!(!GattRequest::AbortReliableWrite.expects_callback());
    }

    #[test]
    fn test_pending_operation_matching() {
        let pending = GattRequest::ReadDescriptor { handle: 6 }.pending();
        assert!(pending.matches(OperationKind::ReadDescriptor, Target::Descriptor(6)));
        assert!(!pending.matches(OperationKind::ReadDescriptor, Target::Descriptor(9)));
        assert!(!pending.matches(OperationKind::WriteDescriptor, Target::Descriptor(6)));
        assert_eq!(pending.to_string(), "Descriptor read (descriptor 0x0006)");
    }
}
