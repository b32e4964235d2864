//! GATT client
//!
//! A [`ClientSession`] gives a sequential request API over one remote
//! peripheral. Calls may be issued concurrently from independent tasks; the
//! connection's [`OperationGate`] admits them one at a time in call order.
//! A background task drains the connection's event channel through the
//! [`EventCorrelator`], resolving waiting calls and routing notifications
//! and lifecycle events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::GattConfig;
use crate::device::{Device, DeviceAddress};
use crate::error::{GattError, Result};
use crate::gatt::constants::{
    CCCD, CCCD_DISABLED, CCCD_INDICATE, CCCD_NOTIFY, DEFAULT_MTU, MTU_HEADER_SIZE,
};
use crate::gatt::correlator::{EventCorrelator, Routed};
use crate::gatt::event::ClientEvent;
use crate::gatt::gate::OperationGate;
use crate::gatt::notify::{NotificationHub, NotificationStream};
use crate::gatt::operation::{GattRequest, OperationKind, Response, Target};
use crate::gatt::state::{ConnectionSnapshot, ConnectionStateMachine, LinkEvent, LinkState};
use crate::gatt::status::ConnectionStatus;
use crate::gatt::tree::{Characteristic, Descriptor, GattTree};
use crate::gatt::types::{CharacteristicProperty, Phy, PhyOption, PhyPair, WriteType};
use crate::transport::{ClientTransport, Connector};

/// Negotiated link parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub mtu: u16,
    pub phy: PhyPair,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            phy: PhyPair::default(),
        }
    }
}

impl ConnectionParams {
    /// Largest value that fits in a single write command or notification
    pub fn max_payload(&self) -> usize {
        (self.mtu as usize).saturating_sub(MTU_HEADER_SIZE)
    }
}

struct ClientInner {
    name: String,
    config: GattConfig,
    device: RwLock<Device>,
    transport: Arc<dyn ClientTransport>,
    gate: Arc<OperationGate>,
    correlator: EventCorrelator,
    state: ConnectionStateMachine,
    notifications: NotificationHub,
    tree: RwLock<Option<Arc<GattTree>>>,
    subscribed: Mutex<HashSet<u16>>,
    reliable_open: AtomicBool,
    params: RwLock<ConnectionParams>,
}

/// Client connection to one remote peripheral
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    /// Connects to a peripheral and waits until the link is up
    pub async fn connect(
        device: Device,
        connector: &dyn Connector,
        config: GattConfig,
    ) -> Result<Self> {
        let session = Self::open(device, connector, config).await?;
        session.wait_until_connected().await?;
        Ok(session)
    }

    /// Starts connecting without waiting for the link. The session is
    /// `Connecting` until the platform reports the outcome.
    pub async fn open(device: Device, connector: &dyn Connector, config: GattConfig) -> Result<Self> {
        let name = device.display_name();
        let state = ConnectionStateMachine::new(name.clone());
        state.apply(LinkEvent::ConnectRequested)?;

        let link = match connector.open(&device).await {
            Ok(link) => link,
            Err(e) => {
                warn!("{}: connect failed: {}", name, e);
                state.apply(LinkEvent::Disconnected(ConnectionStatus::FailedToEstablish))?;
                return Err(e);
            }
        };

        let gate = Arc::new(OperationGate::new(name.clone(), config.operation_timeout));
        let inner = Arc::new(ClientInner {
            correlator: EventCorrelator::new(name.clone(), gate.clone()),
            notifications: NotificationHub::new(name.clone()),
            name,
            config,
            device: RwLock::new(device),
            transport: link.transport,
            gate,
            state,
            tree: RwLock::new(None),
            subscribed: Mutex::new(HashSet::new()),
            reliable_open: AtomicBool::new(false),
            params: RwLock::new(ConnectionParams::default()),
        });
        tokio::spawn(run(inner.clone(), link.events));
        Ok(Self { inner })
    }

    /// Waits for a `Connecting` session to come up
    pub async fn wait_until_connected(&self) -> Result<()> {
        let settled = self
            .wait_for_state(|s| s == LinkState::Connected || s.is_terminal())
            .await;
        match settled {
            Some(LinkState::Connected) => Ok(()),
            Some(_) => Err(GattError::ConnectionLost),
            None => {
                warn!("{}: connect timed out", self.inner.name);
                self.inner.transport.close();
                self.inner
                    .finish(LinkEvent::Disconnected(ConnectionStatus::FailedToEstablish));
                Err(GattError::OperationTimeout {
                    kind: OperationKind::Connect,
                })
            }
        }
    }

    /// Waits up to the connect timeout for a state matching `done`
    async fn wait_for_state(&self, done: impl Fn(LinkState) -> bool) -> Option<LinkState> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            self.inner.config.connect_timeout,
            rx.wait_for(|snapshot| done(snapshot.state)),
        )
        .await;
        match waited {
            Ok(Ok(snapshot)) => Some(snapshot.state),
            // Sender lives in the session, so this only happens on teardown
            Ok(Err(_)) => Some(LinkState::Closed),
            Err(_) => None,
        }
    }

    pub fn device(&self) -> Device {
        self.inner
            .device
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn address(&self) -> DeviceAddress {
        self.device().address
    }

    /// Follow the connection state
    pub fn connection_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.state() == LinkState::Connected
    }

    /// Negotiated MTU and PHY
    pub fn params(&self) -> ConnectionParams {
        *self.inner.params.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs one platform call through the gate. Fails with `NotReady` until
    /// the link is up; a link that is gone fails in the gate.
    async fn request(&self, request: GattRequest) -> Result<Response> {
        if matches!(
            self.inner.state.state(),
            LinkState::Idle | LinkState::Connecting
        ) {
            return Err(GattError::NotReady);
        }
        let transport = self.inner.transport.clone();
        let pending = request.pending();
        let expects_callback = request.expects_callback();
        self.inner
            .gate
            .enqueue(
                pending,
                expects_callback,
                Box::new(move || transport.issue(request)),
            )
            .await
    }

    /// Discovers the remote services. The result is cached until the peer
    /// signals a service change, so later calls return the same tree.
    pub async fn discover_services(&self) -> Result<Arc<GattTree>> {
        if let Some(tree) = self.cached_tree() {
            return Ok(tree);
        }
        match self.request(GattRequest::DiscoverServices).await? {
            Response::Services(services) => {
                let mut cached = self.inner.tree.write().unwrap_or_else(|e| e.into_inner());
                // A concurrent discovery may have landed first
                if let Some(tree) = cached.as_ref() {
                    return Ok(tree.clone());
                }
                info!(
                    "{}: discovered {} service(s)",
                    self.inner.name,
                    services.len()
                );
                let tree = Arc::new(GattTree::from_services(services));
                *cached = Some(tree.clone());
                Ok(tree)
            }
            other => Err(unexpected(OperationKind::Discover, other)),
        }
    }

    fn cached_tree(&self) -> Option<Arc<GattTree>> {
        self.inner
            .tree
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The discovered tree, or `NotReady` before discovery
    pub fn tree(&self) -> Result<Arc<GattTree>> {
        self.cached_tree().ok_or(GattError::NotReady)
    }

    /// Checks that the characteristic belongs to the discovered tree
    fn known_characteristic(&self, characteristic: &Characteristic) -> Result<Arc<GattTree>> {
        let tree = self.tree()?;
        tree.characteristic_by_handle(characteristic.handle)?;
        Ok(tree)
    }

    fn known_descriptor(&self, descriptor: &Descriptor) -> Result<Arc<GattTree>> {
        let tree = self.tree()?;
        tree.descriptor_by_handle(descriptor.handle)?;
        Ok(tree)
    }

    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.known_characteristic(characteristic)?;
        if !characteristic.properties.can_read() {
            return Err(GattError::NotPermitted(format!(
                "{} is not readable",
                characteristic.uuid
            )));
        }
        let request = GattRequest::ReadCharacteristic {
            handle: characteristic.handle,
        };
        match self.request(request).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected(OperationKind::ReadCharacteristic, other)),
        }
    }

    /// Writes a characteristic value. While a reliable write is open, writes
    /// with response are queued on the peer until execute or abort.
    pub async fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.known_characteristic(characteristic)?;

        let properties = characteristic.properties;
        let allowed = match write_type {
            WriteType::WithResponse => properties.can_write(),
            WriteType::WithoutResponse => properties.can_write_without_response(),
            WriteType::Signed => {
                properties.contains(CharacteristicProperty::AUTHENTICATED_SIGNED_WRITES)
            }
        };
        if !allowed {
            return Err(GattError::NotPermitted(format!(
                "{} does not support {:?} writes",
                characteristic.uuid, write_type
            )));
        }
        if !write_type.needs_response() && value.len() > self.params().max_payload() {
            return Err(GattError::NotPermitted(format!(
                "{} bytes exceed the {} byte payload of a write command",
                value.len(),
                self.params().max_payload()
            )));
        }

        let reliable = self.inner.reliable_open.load(Ordering::SeqCst);
        let request = GattRequest::WriteCharacteristic {
            handle: characteristic.handle,
            value: value.to_vec(),
            write_type,
        };
        match self.request(request).await? {
            Response::Value(echo) if reliable && write_type.needs_response() && echo != value => {
                warn!(
                    "{}: reliable write echo mismatch on 0x{:04X}, aborting",
                    self.inner.name, characteristic.handle
                );
                self.abort_reliable_write().await?;
                Err(GattError::Transport(
                    "peer echoed a different value for a prepared write".to_string(),
                ))
            }
            Response::Value(_) => Ok(()),
            other => Err(unexpected(OperationKind::WriteCharacteristic, other)),
        }
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.known_descriptor(descriptor)?;
        let request = GattRequest::ReadDescriptor {
            handle: descriptor.handle,
        };
        match self.request(request).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected(OperationKind::ReadDescriptor, other)),
        }
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        self.known_descriptor(descriptor)?;
        let request = GattRequest::WriteDescriptor {
            handle: descriptor.handle,
            value: value.to_vec(),
        };
        match self.request(request).await? {
            Response::Value(_) => Ok(()),
            other => Err(unexpected(OperationKind::WriteDescriptor, other)),
        }
    }

    pub async fn read_rssi(&self) -> Result<i16> {
        match self.request(GattRequest::ReadRssi).await? {
            Response::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(OperationKind::ReadRssi, other)),
        }
    }

    /// Requests an MTU and returns the negotiated one
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        match self.request(GattRequest::RequestMtu { mtu }).await? {
            Response::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected(OperationKind::RequestMtu, other)),
        }
    }

    /// Sets the preferred PHY and returns the PHY actually in use
    pub async fn set_preferred_phy(&self, tx: Phy, rx: Phy, option: PhyOption) -> Result<PhyPair> {
        match self
            .request(GattRequest::SetPreferredPhy { tx, rx, option })
            .await?
        {
            Response::Phy(phy) => Ok(phy),
            other => Err(unexpected(OperationKind::SetPhy, other)),
        }
    }

    pub async fn read_phy(&self) -> Result<PhyPair> {
        match self.request(GattRequest::ReadPhy).await? {
            Response::Phy(phy) => Ok(phy),
            other => Err(unexpected(OperationKind::ReadPhy, other)),
        }
    }

    /// Enables notifications (or indications, when the characteristic only
    /// indicates) and returns a stream of values. The CCCD is written once
    /// per connection; later calls just open another stream.
    pub async fn subscribe(&self, characteristic: &Characteristic) -> Result<NotificationStream> {
        self.known_characteristic(characteristic)?;
        let properties = characteristic.properties;
        if !properties.can_subscribe() {
            return Err(GattError::NotPermitted(format!(
                "{} neither notifies nor indicates",
                characteristic.uuid
            )));
        }
        let cccd = characteristic.cccd().ok_or(GattError::NotFound {
            what: "Descriptor",
            uuid: CCCD,
        })?;

        // Open the stream first so no value slips between the CCCD write and it
        let stream = self.inner.notifications.subscribe(characteristic.handle);
        if self.is_subscribed(characteristic) {
            return Ok(stream);
        }

        let value = if properties.can_notify() {
            CCCD_NOTIFY
        } else {
            CCCD_INDICATE
        };
        self.write_descriptor(cccd, &value).await?;
        self.inner
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(characteristic.handle);
        debug!(
            "{}: subscribed to {}",
            self.inner.name, characteristic.uuid
        );
        Ok(stream)
    }

    /// A stream of values without touching the CCCD
    pub fn notifications(&self, characteristic: &Characteristic) -> Result<NotificationStream> {
        self.known_characteristic(characteristic)?;
        Ok(self.inner.notifications.subscribe(characteristic.handle))
    }

    /// Disables notifications and indications
    pub async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<()> {
        self.known_characteristic(characteristic)?;
        let removed = self
            .inner
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&characteristic.handle);
        if !removed {
            return Ok(());
        }
        let cccd = characteristic.cccd().ok_or(GattError::NotFound {
            what: "Descriptor",
            uuid: CCCD,
        })?;
        self.write_descriptor(cccd, &CCCD_DISABLED).await
    }

    pub fn is_subscribed(&self, characteristic: &Characteristic) -> bool {
        self.inner
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&characteristic.handle)
    }

    /// Opens a reliable write. Writes with response are prepared on the peer
    /// until [`Self::execute_reliable_write`] or [`Self::abort_reliable_write`].
    pub async fn begin_reliable_write(&self) -> Result<()> {
        if self.inner.reliable_open.swap(true, Ordering::SeqCst) {
            return Err(GattError::TransactionAlreadyOpen);
        }
        if let Err(e) = self.request(GattRequest::BeginReliableWrite).await {
            self.inner.reliable_open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Applies every prepared write on the peer at once
    pub async fn execute_reliable_write(&self) -> Result<()> {
        if !self.inner.reliable_open.swap(false, Ordering::SeqCst) {
            return Err(GattError::NoOpenTransaction);
        }
        self.request(GattRequest::ExecuteReliableWrite)
            .await
            .map(|_| ())
    }

    /// Discards every prepared write
    pub async fn abort_reliable_write(&self) -> Result<()> {
        if !self.inner.reliable_open.swap(false, Ordering::SeqCst) {
            return Err(GattError::NoOpenTransaction);
        }
        self.request(GattRequest::AbortReliableWrite)
            .await
            .map(|_| ())
    }

    /// Disconnects and waits for the platform to confirm
    pub async fn disconnect(&self) -> Result<()> {
        let transition = self.inner.state.apply(LinkEvent::DisconnectRequested)?;
        if transition.to.is_terminal() || !transition.changed() {
            return Ok(());
        }
        info!("{}: disconnecting", self.inner.name);
        if let Err(e) = self.inner.transport.disconnect() {
            warn!("{}: disconnect failed: {}", self.inner.name, e);
            self.inner
                .finish(LinkEvent::Disconnected(ConnectionStatus::TerminateLocalHost));
            return Ok(());
        }
        if self.wait_for_state(|s| s.is_terminal()).await.is_none() {
            warn!("{}: no disconnect callback, closing", self.inner.name);
            self.inner
                .finish(LinkEvent::Disconnected(ConnectionStatus::TerminateLocalHost));
        }
        Ok(())
    }

    /// Releases the session for good
    pub fn close(&self) {
        self.inner.finish(LinkEvent::Close);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.snapshot())
            .finish()
    }
}

fn unexpected(kind: OperationKind, response: Response) -> GattError {
    error!("{} resolved with unexpected payload {:?}", kind, response);
    GattError::Transport(format!("unexpected response to {}", kind))
}

impl ClientInner {
    /// Applies a lifecycle event and tears the connection down on entering
    /// a terminal state
    fn finish(&self, event: LinkEvent) {
        let transition = match self.state.apply(event) {
            Ok(transition) => transition,
            Err(e) => {
                warn!("{}: {}", self.name, e);
                return;
            }
        };
        if transition.ends_connection() {
            self.gate.close();
            self.notifications.close();
            self.reliable_open.store(false, Ordering::SeqCst);
            self.subscribed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.transport.close();
        }
    }

    /// Caches what a completed operation learned before its caller resumes
    fn on_resolved(&self, kind: OperationKind, target: Target, response: &Response) {
        match (kind, target, response) {
            (
                OperationKind::ReadCharacteristic,
                Target::Characteristic(handle),
                Response::Value(value),
            )
            | (OperationKind::ReadDescriptor, Target::Descriptor(handle), Response::Value(value)) => {
                self.store_value(handle, value.clone());
            }
            (OperationKind::RequestMtu, _, Response::Mtu(mtu)) => {
                self.params.write().unwrap_or_else(|e| e.into_inner()).mtu = *mtu;
                debug!("{}: MTU is {}", self.name, mtu);
            }
            (OperationKind::SetPhy | OperationKind::ReadPhy, _, Response::Phy(phy)) => {
                self.params.write().unwrap_or_else(|e| e.into_inner()).phy = *phy;
            }
            _ => {}
        }
    }

    fn store_value(&self, handle: u16, value: Vec<u8>) {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(tree) = tree {
            if let Err(e) = tree.set_value(handle, value) {
                debug!("{}: value for unknown attribute: {}", self.name, e);
            }
        }
    }

    fn on_unsolicited(&self, event: ClientEvent) {
        match event {
            ClientEvent::CharacteristicChanged { handle, value } => {
                self.store_value(handle, value.clone());
                self.notifications.publish(handle, &value);
            }
            ClientEvent::ConnectionStateChanged {
                connected: true, ..
            } => self.finish(LinkEvent::Connected),
            ClientEvent::ConnectionStateChanged {
                connected: false,
                status,
            } => self.finish(LinkEvent::Disconnected(status)),
            ClientEvent::BondStateChanged { state } => {
                info!("{}: bond state {:?}", self.name, state);
                self.device
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .bond_state = state;
            }
            ClientEvent::ServiceChanged => {
                info!("{}: services changed, discovery required", self.name);
                *self.tree.write().unwrap_or_else(|e| e.into_inner()) = None;
                self.subscribed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
            }
            ClientEvent::PhyUpdate { tx, rx, .. } => {
                self.params.write().unwrap_or_else(|e| e.into_inner()).phy = PhyPair { tx, rx };
            }
            other => debug!("{}: ignoring {:?}", self.name, other),
        }
    }
}

/// Drains the connection's event channel
async fn run(inner: Arc<ClientInner>, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        let routed = inner.correlator.correlate(event, |kind, target, response| {
            inner.on_resolved(kind, target, response)
        });
        if let Routed::Unsolicited(event) = routed {
            inner.on_unsolicited(event);
        }
        if inner.state.state().is_terminal() {
            break;
        }
    }
    // Channel gone without a disconnect callback: treat as link loss
    inner.finish(LinkEvent::Disconnected(ConnectionStatus::LinkLoss));
    debug!("{}: event loop finished", inner.name);
}

/// Client sessions keyed by peripheral address.
///
/// Connecting to a device that is already connecting or connected returns
/// the existing session.
pub struct Central {
    connector: Arc<dyn Connector>,
    config: GattConfig,
    sessions: tokio::sync::Mutex<HashMap<DeviceAddress, ClientSession>>,
}

impl Central {
    pub fn new(connector: Arc<dyn Connector>, config: GattConfig) -> Self {
        Self {
            connector,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    pub async fn connect(&self, device: &Device) -> Result<ClientSession> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&device.address) {
                Some(existing) if existing.snapshot().state.is_active() => {
                    debug!("{}: reusing session", device.display_name());
                    existing.clone()
                }
                _ => {
                    let session = ClientSession::open(
                        device.clone(),
                        self.connector.as_ref(),
                        self.config.clone(),
                    )
                    .await?;
                    sessions.insert(device.address, session.clone());
                    session
                }
            }
        };
        session.wait_until_connected().await?;
        Ok(session)
    }

    /// The live session for an address, if any
    pub async fn session(&self, address: &DeviceAddress) -> Option<ClientSession> {
        self.sessions
            .lock()
            .await
            .get(address)
            .filter(|s| !s.snapshot().state.is_terminal())
            .cloned()
    }

    pub async fn disconnect_all(&self) {
        let sessions: Vec<ClientSession> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                warn!("{}: {}", session.device().display_name(), e);
            }
            session.close();
        }
    }
}
