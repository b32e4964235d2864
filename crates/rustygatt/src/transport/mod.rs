//! Platform transports
//!
//! A backend issues single platform calls and delivers their callbacks on one
//! ordered channel per connection. Sessions are built on these traits; the
//! backend (real radio or the in-memory [`mock`]) is picked at construction.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device::Device;
use crate::error::Result;
use crate::gatt::event::{ClientEvent, ServerEvent};
use crate::gatt::operation::GattRequest;
use crate::gatt::status::GattStatus;
use crate::gatt::types::Handle;

/// Client side of one connection
pub trait ClientTransport: Send + Sync {
    /// Fires one platform call. Its result arrives later as a [`ClientEvent`].
    fn issue(&self, request: GattRequest) -> Result<()>;

    /// Asks the platform to drop the link. Completion is reported as a
    /// connection state change.
    fn disconnect(&self) -> Result<()>;

    /// Releases the platform handle
    fn close(&self);
}

/// Server side, shared by every connected central
pub trait ServerTransport: Send + Sync {
    /// Answers a read, write or execute request
    fn send_response(
        &self,
        device: &Device,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Sends a notification, or an indication when `confirm` is set. An
    /// indication completes with [`ServerEvent::NotificationSent`].
    fn notify_characteristic_changed(
        &self,
        device: &Device,
        handle: Handle,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<()>;

    /// Drops the link to one central
    fn cancel_connection(&self, device: &Device) -> Result<()>;

    /// Shuts the server down
    fn close(&self);
}

/// An opened client link: the transport and its callback channel
pub struct ClientLink {
    pub transport: Arc<dyn ClientTransport>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Opened server: the transport and its request channel
pub struct ServerLink {
    pub transport: Arc<dyn ServerTransport>,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Ability to open a client connection to a remote peripheral
#[async_trait]
pub trait Connector: Send + Sync {
    /// Starts connecting. The link is up once the event channel reports it.
    async fn open(&self, device: &Device) -> Result<ClientLink>;
}
