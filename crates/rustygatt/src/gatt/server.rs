//! GATT server
//!
//! A [`ServerSession`] advertises one local [`GattTree`] to any number of
//! connected centrals. Read requests are answered from the tree, accepted
//! writes land in it, and each central has its own subscription state,
//! notification gate and reliable write transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::GattConfig;
use crate::device::{Device, DeviceAddress};
use crate::error::{GattError, Result};
use crate::gatt::constants::DEFAULT_MTU;
use crate::gatt::event::ServerEvent;
use crate::gatt::gate::OperationGate;
use crate::gatt::operation::{OperationKind, PendingOperation, Response, Target};
use crate::gatt::reliable::ReliableWrite;
use crate::gatt::state::{ConnectionStateMachine, LinkEvent};
use crate::gatt::status::{ConnectionStatus, GattStatus};
use crate::gatt::tree::{Attribute, GattTree, ServiceConfig};
use crate::gatt::types::{CccdState, Handle, PhyPair};
use crate::transport::{ServerLink, ServerTransport};

/// A central connecting or going away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerConnectionEvent {
    DeviceConnected(Device),
    DeviceDisconnected {
        device: Device,
        status: ConnectionStatus,
    },
}

/// A value accepted from a central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChanged {
    pub device: Device,
    pub handle: Handle,
    pub value: Vec<u8>,
}

/// Outcome of [`ServerSession::set_value_and_notify`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyReport {
    /// Centrals a notification was queued for
    pub notified: Vec<DeviceAddress>,
    /// Centrals that confirmed an indication
    pub indicated: Vec<DeviceAddress>,
    pub failed: Vec<(DeviceAddress, GattError)>,
}

impl NotifyReport {
    /// Centrals that got the value
    pub fn delivered(&self) -> usize {
        self.notified.len() + self.indicated.len()
    }
}

/// Per-central state
struct ServerConnection {
    device: Device,
    state: ConnectionStateMachine,
    gate: Arc<OperationGate>,
    /// Keyed by characteristic value handle
    subscriptions: Mutex<HashMap<Handle, CccdState>>,
    reliable: Mutex<ReliableWrite>,
    mtu: AtomicU16,
    phy: Mutex<PhyPair>,
}

impl ServerConnection {
    fn subscription(&self, handle: Handle) -> CccdState {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle)
            .copied()
            .unwrap_or_default()
    }

    fn reliable(&self) -> std::sync::MutexGuard<'_, ReliableWrite> {
        self.reliable.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ServerInner {
    name: String,
    config: GattConfig,
    tree: Arc<GattTree>,
    transport: Arc<dyn ServerTransport>,
    connections: RwLock<HashMap<DeviceAddress, Arc<ServerConnection>>>,
    connection_events: broadcast::Sender<ServerConnectionEvent>,
    value_events: broadcast::Sender<ValueChanged>,
    closed: AtomicBool,
}

/// Local GATT server shared by every connected central
#[derive(Clone)]
pub struct ServerSession {
    inner: Arc<ServerInner>,
}

impl ServerSession {
    /// Builds the tree from the service declarations and starts serving
    pub fn new(
        name: impl Into<String>,
        services: &[ServiceConfig],
        link: ServerLink,
        config: GattConfig,
    ) -> Result<Self> {
        let tree = Arc::new(GattTree::build(services)?);
        Ok(Self::with_tree(name, tree, link, config))
    }

    pub fn with_tree(
        name: impl Into<String>,
        tree: Arc<GattTree>,
        link: ServerLink,
        config: GattConfig,
    ) -> Self {
        let (connection_events, _) = broadcast::channel(config.event_buffer);
        let (value_events, _) = broadcast::channel(config.event_buffer);
        let inner = Arc::new(ServerInner {
            name: name.into(),
            config,
            tree,
            transport: link.transport,
            connections: RwLock::new(HashMap::new()),
            connection_events,
            value_events,
            closed: AtomicBool::new(false),
        });
        info!(
            "{}: serving {} service(s)",
            inner.name,
            inner.tree.services().len()
        );
        tokio::spawn(run(inner.clone(), link.events));
        Self { inner }
    }

    pub fn tree(&self) -> &Arc<GattTree> {
        &self.inner.tree
    }

    pub fn value(&self, handle: Handle) -> Result<Vec<u8>> {
        self.inner.tree.value(handle)
    }

    /// Changes a value without telling anyone
    pub fn set_value(&self, handle: Handle, value: &[u8]) -> Result<()> {
        self.inner.tree.set_value(handle, value.to_vec())
    }

    /// Changes a characteristic value and sends it to every subscribed
    /// central. Indications are awaited until each central confirms;
    /// notifications are only queued on each central's gate.
    pub async fn set_value_and_notify(&self, handle: Handle, value: &[u8]) -> Result<NotifyReport> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(GattError::Closed);
        }
        let characteristic = inner.tree.characteristic_by_handle(handle)?;
        let properties = characteristic.properties;
        inner.tree.set_value(handle, value.to_vec())?;

        let mut report = NotifyReport::default();
        let mut indications = Vec::new();

        for connection in inner.connections_snapshot() {
            let subscription = connection.subscription(handle);
            let confirm = if subscription.indicate && properties.can_indicate() {
                true
            } else if subscription.notify && properties.can_notify() {
                false
            } else {
                continue;
            };

            let kind = if confirm {
                OperationKind::Indicate
            } else {
                OperationKind::Notify
            };
            let address = connection.device.address;
            let transport = inner.transport.clone();
            let device = connection.device.clone();
            let payload = value.to_vec();
            let queued = connection.gate.submit(
                PendingOperation::new(kind, Target::Characteristic(handle)),
                confirm,
                Box::new(move || {
                    transport.notify_characteristic_changed(&device, handle, payload, confirm)
                }),
            );
            let sent = match queued {
                Ok(sent) => sent,
                Err(e) => {
                    report.failed.push((address, e));
                    continue;
                }
            };

            if confirm {
                indications.push(async move {
                    (address, sent.await.unwrap_or(Err(GattError::ConnectionLost)))
                });
            } else {
                // The receiver must outlive admission or the send is withdrawn
                let name = inner.name.clone();
                tokio::spawn(async move {
                    if let Ok(Err(e)) = sent.await {
                        warn!("{}: notification to {} failed: {}", name, address, e);
                    }
                });
                report.notified.push(address);
            }
        }

        for (address, result) in join_all(indications).await {
            match result {
                Ok(_) => report.indicated.push(address),
                Err(e) => report.failed.push((address, e)),
            }
        }
        trace!(
            "{}: 0x{:04X} = {} delivered to {}",
            inner.name,
            handle,
            hex::encode(value),
            report.delivered()
        );
        Ok(report)
    }

    /// Centrals currently connected
    pub fn connected_devices(&self) -> Vec<Device> {
        self.inner
            .connections_snapshot()
            .into_iter()
            .map(|c| c.device.clone())
            .collect()
    }

    /// Subscription state a central wrote for a characteristic
    pub fn subscription(&self, address: &DeviceAddress, handle: Handle) -> CccdState {
        self.inner
            .connection(address)
            .map(|c| c.subscription(handle))
            .unwrap_or_default()
    }

    /// MTU negotiated with a central
    pub fn mtu(&self, address: &DeviceAddress) -> Option<u16> {
        self.inner
            .connection(address)
            .map(|c| c.mtu.load(Ordering::SeqCst))
    }

    pub fn phy(&self, address: &DeviceAddress) -> Option<PhyPair> {
        self.inner
            .connection(address)
            .map(|c| *c.phy.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ServerConnectionEvent> {
        self.inner.connection_events.subscribe()
    }

    pub fn value_events(&self) -> broadcast::Receiver<ValueChanged> {
        self.inner.value_events.subscribe()
    }

    /// Opens a reliable write for a central. Prepared writes from it are
    /// queued until execute or cancel.
    pub fn begin_reliable_write(&self, address: &DeviceAddress) -> Result<()> {
        let connection = self.inner.connection(address).ok_or(GattError::ConnectionLost)?;
        let limit = self.inner.config.prepare_queue_limit;
        let mut reliable = connection.reliable();
        reliable.begin(limit)
    }

    /// Applies every write queued by a central at once. Returns the handles
    /// that changed.
    pub fn execute_reliable_write(&self, address: &DeviceAddress) -> Result<Vec<Handle>> {
        let connection = self.inner.connection(address).ok_or(GattError::ConnectionLost)?;
        self.inner.execute(&connection)
    }

    /// Discards every write queued by a central
    pub fn cancel_reliable_write(&self, address: &DeviceAddress) -> Result<()> {
        let connection = self.inner.connection(address).ok_or(GattError::ConnectionLost)?;
        let dropped = connection.reliable().cancel()?;
        debug!(
            "{}: {} prepared write(s) from {} discarded",
            self.inner.name, dropped, address
        );
        Ok(())
    }

    pub fn has_open_transaction(&self, address: &DeviceAddress) -> bool {
        self.inner
            .connection(address)
            .map(|c| c.reliable().is_open())
            .unwrap_or(false)
    }

    /// Drops the link to one central
    pub fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        let connection = self.inner.connection(address).ok_or(GattError::ConnectionLost)?;
        connection.state.apply(LinkEvent::DisconnectRequested)?;
        self.inner.transport.cancel_connection(&connection.device)
    }

    /// Stops serving. Every connection is dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: closing", self.inner.name);
        let connections: Vec<_> = self
            .inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            self.inner
                .drop_connection(&connection, LinkEvent::Close, ConnectionStatus::TerminateLocalHost);
        }
        self.inner.transport.close();
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("name", &self.inner.name)
            .field("connections", &self.connected_devices().len())
            .finish()
    }
}

impl ServerInner {
    fn connection(&self, address: &DeviceAddress) -> Option<Arc<ServerConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    fn connections_snapshot(&self) -> Vec<Arc<ServerConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn respond(&self, device: &Device, request_id: u32, status: GattStatus, offset: u16, value: Vec<u8>) {
        if let Err(e) = self
            .transport
            .send_response(device, request_id, status, offset, value)
        {
            warn!("{}: response to {} failed: {}", self.name, device.address, e);
        }
    }

    fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionStateChanged {
                device,
                connected: true,
                ..
            } => self.on_connected(device),
            ServerEvent::ConnectionStateChanged {
                device,
                connected: false,
                status,
            } => {
                let removed = self
                    .connections
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&device.address);
                if let Some(connection) = removed {
                    self.drop_connection(&connection, LinkEvent::Disconnected(status), status);
                }
            }
            ServerEvent::ReadRequest {
                device,
                request_id,
                handle,
                offset,
            } => {
                let (status, value) = match self.connection(&device.address) {
                    Some(connection) => self.read(&connection, handle, offset),
                    None => (GattStatus::Failure, Vec::new()),
                };
                self.respond(&device, request_id, status, offset, value);
            }
            ServerEvent::WriteRequest {
                device,
                request_id,
                handle,
                prepared,
                response_needed,
                offset,
                value,
            } => {
                let status = match self.connection(&device.address) {
                    Some(connection) => self.write(&connection, handle, prepared, offset, &value),
                    None => GattStatus::Failure,
                };
                if response_needed {
                    self.respond(&device, request_id, status, offset, value);
                }
            }
            ServerEvent::ExecuteWrite {
                device,
                request_id,
                execute,
            } => {
                let status = match self.connection(&device.address) {
                    Some(connection) if execute => match self.execute(&connection) {
                        // An execute with nothing prepared is a no-op
                        Ok(_) | Err(GattError::NoOpenTransaction) => GattStatus::Success,
                        Err(e) => e.status().unwrap_or(GattStatus::InvalidHandle),
                    },
                    Some(connection) => {
                        let dropped = connection.reliable().cancel().unwrap_or(0);
                        debug!(
                            "{}: {} cancelled {} prepared write(s)",
                            self.name, device.address, dropped
                        );
                        GattStatus::Success
                    }
                    None => GattStatus::Failure,
                };
                self.respond(&device, request_id, status, 0, Vec::new());
            }
            ServerEvent::NotificationSent { device, status } => {
                let Some(connection) = self.connection(&device.address) else {
                    return;
                };
                let in_flight = connection.gate.in_flight();
                match in_flight {
                    Some(op) if op.kind == OperationKind::Indicate => {
                        let result = if status.is_success() {
                            Ok(Response::Done)
                        } else {
                            Err(GattError::PlatformStatus {
                                kind: OperationKind::Indicate,
                                status,
                            })
                        };
                        connection.gate.resolve(op.kind, op.target, result);
                    }
                    _ => trace!("{}: unexpected confirmation from {}", self.name, device.address),
                }
            }
            ServerEvent::MtuChanged { device, mtu } => {
                if let Some(connection) = self.connection(&device.address) {
                    debug!("{}: MTU with {} is {}", self.name, device.address, mtu);
                    connection.mtu.store(mtu, Ordering::SeqCst);
                }
            }
            ServerEvent::PhyUpdate {
                device, tx, rx, status,
            } => {
                if let Some(connection) = self.connection(&device.address) {
                    if status.is_success() {
                        *connection.phy.lock().unwrap_or_else(|e| e.into_inner()) =
                            PhyPair { tx, rx };
                    }
                }
            }
        }
    }

    fn on_connected(&self, device: Device) {
        let name = format!("{}/{}", self.name, device.address);
        let connection = Arc::new(ServerConnection {
            state: ConnectionStateMachine::new(name.clone()),
            gate: Arc::new(OperationGate::new(name, self.config.operation_timeout)),
            device: device.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            reliable: Mutex::new(ReliableWrite::default()),
            mtu: AtomicU16::new(DEFAULT_MTU),
            phy: Mutex::new(PhyPair::default()),
        });
        if let Err(e) = connection.state.apply(LinkEvent::Connected) {
            warn!("{}: {}", self.name, e);
        }

        let previous = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.address, connection);
        if let Some(previous) = previous {
            self.drop_connection(&previous, LinkEvent::Close, ConnectionStatus::Unknown);
        }
        info!("{}: {} connected", self.name, device.display_name());
        let _ = self
            .connection_events
            .send(ServerConnectionEvent::DeviceConnected(device));
    }

    /// Releases everything tied to a central
    fn drop_connection(&self, connection: &ServerConnection, event: LinkEvent, status: ConnectionStatus) {
        let ended = connection
            .state
            .apply(event)
            .map(|t| t.ends_connection())
            .unwrap_or(false);
        if !ended {
            return;
        }
        connection.gate.close();
        if let Ok(dropped) = connection.reliable().cancel() {
            debug!(
                "{}: reliable write of {} cancelled by disconnect ({} part(s))",
                self.name, connection.device.address, dropped
            );
        }
        info!(
            "{}: {} disconnected ({:?})",
            self.name,
            connection.device.display_name(),
            status
        );
        let _ = self
            .connection_events
            .send(ServerConnectionEvent::DeviceDisconnected {
                device: connection.device.clone(),
                status,
            });
    }

    fn read(&self, connection: &ServerConnection, handle: Handle, offset: u16) -> (GattStatus, Vec<u8>) {
        let value = match self.tree.attribute(handle) {
            Err(_) => return (GattStatus::InvalidHandle, Vec::new()),
            Ok(Attribute::Descriptor(characteristic, descriptor)) if descriptor.is_cccd() => {
                connection.subscription(characteristic.handle).to_bytes().to_vec()
            }
            Ok(attribute) => {
                let permissions = match attribute {
                    Attribute::Characteristic(c) => c.permissions,
                    Attribute::Descriptor(_, d) => d.permissions,
                };
                if !permissions.can_read() {
                    return (GattStatus::ReadNotPermitted, Vec::new());
                }
                match self.tree.value(handle) {
                    Ok(value) => value,
                    Err(_) => return (GattStatus::InvalidHandle, Vec::new()),
                }
            }
        };

        let offset = offset as usize;
        if offset > value.len() {
            return (GattStatus::InvalidOffset, Vec::new());
        }
        (GattStatus::Success, value[offset..].to_vec())
    }

    fn write(
        &self,
        connection: &ServerConnection,
        handle: Handle,
        prepared: bool,
        offset: u16,
        value: &[u8],
    ) -> GattStatus {
        let attribute = match self.tree.attribute(handle) {
            Ok(attribute) => attribute,
            Err(_) => return GattStatus::InvalidHandle,
        };
        let permissions = match attribute {
            Attribute::Characteristic(c) => c.permissions,
            Attribute::Descriptor(_, d) => d.permissions,
        };
        if !permissions.can_write() {
            return GattStatus::WriteNotPermitted;
        }

        if prepared {
            let mut reliable = connection.reliable();
            if !reliable.is_open() {
                // A prepared write opens the transaction implicitly
                let _ = reliable.begin(self.config.prepare_queue_limit);
            }
            return match reliable.transaction_mut() {
                Some(transaction) => match transaction.prepare(handle, offset, value.to_vec()) {
                    Ok(()) => GattStatus::Success,
                    Err(status) => status,
                },
                None => GattStatus::Unlikely,
            };
        }

        if let Attribute::Descriptor(characteristic, descriptor) = attribute {
            if descriptor.is_cccd() {
                return match CccdState::parse(value) {
                    Some(state) => {
                        debug!(
                            "{}: {} set {} to {:?}",
                            self.name, connection.device.address, characteristic.uuid, state
                        );
                        connection
                            .subscriptions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(characteristic.handle, state);
                        GattStatus::Success
                    }
                    None => GattStatus::InvalidAttributeValueLength,
                };
            }
        }

        let new_value = if offset == 0 {
            value.to_vec()
        } else {
            let mut current = match self.tree.value(handle) {
                Ok(current) => current,
                Err(_) => return GattStatus::InvalidHandle,
            };
            if offset as usize > current.len() {
                return GattStatus::InvalidOffset;
            }
            current.truncate(offset as usize);
            current.extend_from_slice(value);
            current
        };

        if self.tree.set_value(handle, new_value.clone()).is_err() {
            return GattStatus::InvalidHandle;
        }
        debug!(
            "{}: {} wrote 0x{:04X} = {}",
            self.name,
            connection.device.address,
            handle,
            hex::encode(&new_value)
        );
        let _ = self.value_events.send(ValueChanged {
            device: connection.device.clone(),
            handle,
            value: new_value,
        });
        GattStatus::Success
    }

    /// Validates the open transaction and lands every value in one batch
    fn execute(&self, connection: &ServerConnection) -> Result<Vec<Handle>> {
        let transaction = connection.reliable().take()?;
        let combined = transaction.combine().map_err(|(handle, status)| {
            warn!(
                "{}: reliable write from {} rejected at 0x{:04X}: {}",
                self.name, connection.device.address, handle, status
            );
            GattError::PlatformStatus {
                kind: OperationKind::ReliableWriteExecute,
                status,
            }
        })?;
        self.tree.set_values(&combined)?;

        info!(
            "{}: {} executed reliable write of {} attribute(s)",
            self.name,
            connection.device.address,
            combined.len()
        );
        let mut handles = Vec::with_capacity(combined.len());
        for (handle, value) in combined {
            handles.push(handle);
            let _ = self.value_events.send(ValueChanged {
                device: connection.device.clone(),
                handle,
                value,
            });
        }
        Ok(handles)
    }
}

async fn run(inner: Arc<ServerInner>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.handle(event);
    }
    debug!("{}: event loop finished", inner.name);
}
