//! GATT (Generic Attribute Profile) sessions
//!
//! This module provides client and server sessions over a platform
//! transport. Every connection serializes its operations through an
//! [`OperationGate`] and routes platform callbacks through an
//! [`EventCorrelator`].

pub mod client;
pub mod constants;
pub mod correlator;
pub mod event;
pub mod gate;
pub mod notify;
pub mod operation;
pub mod reliable;
pub mod server;
pub mod state;
pub mod status;
pub mod tree;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{Central, ClientSession, ConnectionParams};
pub use correlator::EventCorrelator;
pub use event::{ClientEvent, ServerEvent};
pub use gate::OperationGate;
pub use notify::NotificationStream;
pub use operation::{GattRequest, OperationKind, PendingOperation, Response, Target};
pub use reliable::{ReliableWrite, ReliableWriteTransaction};
pub use server::{NotifyReport, ServerConnectionEvent, ServerSession, ValueChanged};
pub use state::{ConnectionSnapshot, ConnectionStateMachine, LinkState};
pub use status::{ConnectionStatus, GattStatus};
pub use tree::{
    Characteristic, CharacteristicConfig, Descriptor, DescriptorConfig, GattTree, Service,
    ServiceConfig,
};
pub use types::{CharacteristicProperty, Handle, Permission, Phy, PhyOption, PhyPair, WriteType};
