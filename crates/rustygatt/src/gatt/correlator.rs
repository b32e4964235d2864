//! Event correlator
//!
//! Platform callbacks carry no request identity. Result-shaped events are
//! matched to the in-flight operation by kind and target; everything else is
//! handed back to the session as unsolicited.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{GattError, Result};
use crate::gatt::event::ClientEvent;
use crate::gatt::gate::OperationGate;
use crate::gatt::operation::{OperationKind, Response, Target};
use crate::gatt::status::GattStatus;
use crate::gatt::types::PhyPair;

/// Classification of one inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Result of an operation
    Result {
        kind: OperationKind,
        target: Target,
        result: Result<Response>,
    },
    /// No operation produces this event
    Unsolicited(ClientEvent),
}

/// Sorts an event into operation results and unsolicited events
pub fn classify(event: ClientEvent) -> Classified {
    fn outcome(
        kind: OperationKind,
        target: Target,
        status: GattStatus,
        response: Response,
    ) -> Classified {
        let result = if status.is_success() {
            Ok(response)
        } else {
            Err(GattError::PlatformStatus { kind, status })
        };
        Classified::Result {
            kind,
            target,
            result,
        }
    }

    match event {
        ClientEvent::ServicesDiscovered { services, status } => outcome(
            OperationKind::Discover,
            Target::None,
            status,
            Response::Services(services),
        ),
        ClientEvent::CharacteristicRead {
            handle,
            value,
            status,
        } => outcome(
            OperationKind::ReadCharacteristic,
            Target::Characteristic(handle),
            status,
            Response::Value(value),
        ),
        ClientEvent::CharacteristicWrite {
            handle,
            value,
            status,
        } => outcome(
            OperationKind::WriteCharacteristic,
            Target::Characteristic(handle),
            status,
            Response::Value(value),
        ),
        ClientEvent::DescriptorRead {
            handle,
            value,
            status,
        } => outcome(
            OperationKind::ReadDescriptor,
            Target::Descriptor(handle),
            status,
            Response::Value(value),
        ),
        ClientEvent::DescriptorWrite {
            handle,
            value,
            status,
        } => outcome(
            OperationKind::WriteDescriptor,
            Target::Descriptor(handle),
            status,
            Response::Value(value),
        ),
        ClientEvent::ReadRemoteRssi { rssi, status } => outcome(
            OperationKind::ReadRssi,
            Target::None,
            status,
            Response::Rssi(rssi),
        ),
        ClientEvent::MtuChanged { mtu, status } => outcome(
            OperationKind::RequestMtu,
            Target::None,
            status,
            Response::Mtu(mtu),
        ),
        ClientEvent::PhyRead { tx, rx, status } => outcome(
            OperationKind::ReadPhy,
            Target::None,
            status,
            Response::Phy(PhyPair { tx, rx }),
        ),
        ClientEvent::PhyUpdate { tx, rx, status } => outcome(
            OperationKind::SetPhy,
            Target::None,
            status,
            Response::Phy(PhyPair { tx, rx }),
        ),
        ClientEvent::ReliableWriteCompleted { status } => outcome(
            OperationKind::ReliableWriteExecute,
            Target::None,
            status,
            Response::Done,
        ),
        event @ (ClientEvent::CharacteristicChanged { .. }
        | ClientEvent::ConnectionStateChanged { .. }
        | ClientEvent::BondStateChanged { .. }
        | ClientEvent::ServiceChanged) => Classified::Unsolicited(event),
    }
}

/// Where an event ended up
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Delivered to the waiting operation
    Resolved { kind: OperationKind, target: Target },
    /// A result nobody was waiting for
    Dropped,
    /// For the session to handle
    Unsolicited(ClientEvent),
}

/// Matches the events of one connection against its gate
#[derive(Debug)]
pub struct EventCorrelator {
    name: String,
    gate: Arc<OperationGate>,
}

impl EventCorrelator {
    pub fn new(name: impl Into<String>, gate: Arc<OperationGate>) -> Self {
        Self {
            name: name.into(),
            gate,
        }
    }

    /// Routes one event. `apply` sees a successful matched payload before
    /// the waiting operation completes.
    pub fn correlate(
        &self,
        event: ClientEvent,
        apply: impl FnOnce(OperationKind, Target, &Response),
    ) -> Routed {
        let (kind, target, result) = match classify(event) {
            Classified::Unsolicited(event) => return Routed::Unsolicited(event),
            Classified::Result {
                kind,
                target,
                result,
            } => (kind, target, result),
        };

        let resolved = self.gate.resolve_with(kind, target, result.clone(), |result| {
            if let Ok(response) = result {
                apply(kind, target, response);
            }
        });
        if resolved {
            return Routed::Resolved { kind, target };
        }

        // A PHY change the peer started on its own
        if kind == OperationKind::SetPhy {
            if let Ok(Response::Phy(phy)) = result {
                debug!("{}: peer changed PHY to {:?}", self.name, phy);
                return Routed::Unsolicited(ClientEvent::PhyUpdate {
                    tx: phy.tx,
                    rx: phy.rx,
                    status: GattStatus::Success,
                });
            }
        }

        match self.gate.in_flight() {
            Some(pending) => warn!(
                "{}: {} callback for {} does not match in-flight {}, ignoring",
                self.name, kind, target, pending
            ),
            None => warn!(
                "{}: {} callback for {} with nothing in flight, ignoring",
                self.name, kind, target
            ),
        }
        Routed::Dropped
    }
}
