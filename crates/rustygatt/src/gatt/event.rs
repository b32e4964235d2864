//! Inbound platform events
//!
//! Each connection owns one ordered channel of these. The client side feeds
//! [`ClientEvent`]s to its correlator, the server side feeds [`ServerEvent`]s
//! to its session.

use crate::device::{BondState, Device};
use crate::gatt::status::{ConnectionStatus, GattStatus};
use crate::gatt::tree::Service;
use crate::gatt::types::{Handle, Phy};

/// Callback delivered to a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionStateChanged {
        connected: bool,
        status: ConnectionStatus,
    },
    ServicesDiscovered {
        services: Vec<Service>,
        status: GattStatus,
    },
    CharacteristicRead {
        handle: Handle,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        handle: Handle,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Notification or indication from the peer
    CharacteristicChanged {
        handle: Handle,
        value: Vec<u8>,
    },
    DescriptorRead {
        handle: Handle,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        handle: Handle,
        value: Vec<u8>,
        status: GattStatus,
    },
    ReadRemoteRssi {
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    PhyRead {
        tx: Phy,
        rx: Phy,
        status: GattStatus,
    },
    /// Answer to a PHY preference, or a peer-initiated PHY change
    PhyUpdate {
        tx: Phy,
        rx: Phy,
        status: GattStatus,
    },
    ReliableWriteCompleted {
        status: GattStatus,
    },
    BondStateChanged {
        state: BondState,
    },
    /// The peer's attribute database changed; discovered services are stale
    ServiceChanged,
}

/// Request or lifecycle event delivered to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionStateChanged {
        device: Device,
        connected: bool,
        status: ConnectionStatus,
    },
    /// Read of a characteristic value or descriptor
    ReadRequest {
        device: Device,
        request_id: u32,
        handle: Handle,
        offset: u16,
    },
    /// Write or prepared write of a characteristic value or descriptor
    WriteRequest {
        device: Device,
        request_id: u32,
        handle: Handle,
        prepared: bool,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWrite {
        device: Device,
        request_id: u32,
        execute: bool,
    },
    /// A notification left the radio, or an indication was confirmed
    NotificationSent {
        device: Device,
        status: GattStatus,
    },
    MtuChanged {
        device: Device,
        mtu: u16,
    },
    PhyUpdate {
        device: Device,
        tx: Phy,
        rx: Phy,
        status: GattStatus,
    },
}

impl ServerEvent {
    /// The central this event concerns
    pub fn device(&self) -> &Device {
        match self {
            ServerEvent::ConnectionStateChanged { device, .. }
            | ServerEvent::ReadRequest { device, .. }
            | ServerEvent::WriteRequest { device, .. }
            | ServerEvent::ExecuteWrite { device, .. }
            | ServerEvent::NotificationSent { device, .. }
            | ServerEvent::MtuChanged { device, .. }
            | ServerEvent::PhyUpdate { device, .. } => device,
        }
    }
}
