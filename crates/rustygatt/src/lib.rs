//! RustyGatt - GATT operation serialization and event correlation
//!
//! This library sits between application code and a platform BLE transport
//! whose GATT calls are single-outstanding and whose results arrive as
//! asynchronous callbacks. It turns that into a sequential async request API
//! for GATT clients, a request/response and notification API for GATT
//! servers, and an in-memory mock backend that runs both roles end to end.

pub mod advertiser;
pub mod config;
pub mod device;
pub mod error;
pub mod gatt;
pub mod snapshot;
pub mod transport;
pub mod uuid;

// Re-export common types for convenience
pub use advertiser::{Advertiser, AdvertisingConfig, AdvertisingEvent, MockAdvertiser};
pub use config::GattConfig;
pub use device::{BondState, Device, DeviceAddress};
pub use error::{GattError, Result};
pub use gatt::{
    Central, Characteristic, CharacteristicConfig, CharacteristicProperty, ClientSession,
    ConnectionStatus, GattStatus, GattTree, LinkState, Permission, ServerSession, Service,
    ServiceConfig,
};
pub use snapshot::{watch_client, watch_server, ClientStatus, ServerStatus};
pub use transport::mock::{MockNetwork, MockPeripheral};
pub use transport::{ClientTransport, Connector, ServerTransport};
pub use uuid::Uuid;
