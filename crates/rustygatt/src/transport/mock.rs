//! In-memory backend
//!
//! A [`MockPeripheral`] is a real [`ServerSession`] behind a mock radio.
//! Client transports opened through [`MockNetwork`] turn client requests into
//! server events, and server responses back into client callbacks, so both
//! roles run end to end without hardware. RSSI, MTU and PHY are answered by
//! the radio itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::GattConfig;
use crate::device::{BondState, Device, DeviceAddress};
use crate::error::{GattError, Result};
use crate::gatt::constants::{DEFAULT_MTU, MAX_MTU};
use crate::gatt::event::{ClientEvent, ServerEvent};
use crate::gatt::operation::GattRequest;
use crate::gatt::server::ServerSession;
use crate::gatt::status::{ConnectionStatus, GattStatus};
use crate::gatt::tree::{GattTree, Service, ServiceConfig};
use crate::gatt::types::{Handle, Permission, PhyPair, WriteType};
use crate::transport::{ClientLink, ClientTransport, Connector, ServerLink, ServerTransport};

/// Baseline RSSI reported by the mock radio, in dBm
const MOCK_RSSI: i16 = -55;

/// How a pending server request maps back to a client callback
#[derive(Debug, Clone)]
enum Awaiting {
    CharacteristicRead(Handle),
    DescriptorRead(Handle),
    CharacteristicWrite(Handle, Vec<u8>),
    DescriptorWrite(Handle, Vec<u8>),
    Execute,
}

/// One central's link to the peripheral
struct MockLink {
    central: Device,
    client_events: mpsc::UnboundedSender<ClientEvent>,
    awaiting: HashMap<u32, Awaiting>,
    reliable: bool,
    phy: PhyPair,
}

/// The peripheral's side of the air
struct MockRadio {
    name: String,
    server_events: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
    links: Mutex<HashMap<DeviceAddress, MockLink>>,
    services: RwLock<Vec<Service>>,
    next_request_id: AtomicU32,
    drop_next_callback: AtomicBool,
}

impl MockRadio {
    fn to_server(&self, event: ServerEvent) {
        let server_events = self.server_events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = server_events.as_ref() {
            let _ = tx.send(event);
        }
    }

    fn links(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceAddress, MockLink>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consumes the lost-callback flag
    fn callback_lost(&self) -> bool {
        self.drop_next_callback.swap(false, Ordering::SeqCst)
    }

    fn to_client(&self, address: &DeviceAddress, event: ClientEvent) {
        if let Some(link) = self.links().get(address) {
            trace!("{}: -> {} {:?}", self.name, address, event);
            let _ = link.client_events.send(event);
        }
    }

    fn attach(&self, central: Device) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (client_events, events) = mpsc::unbounded_channel();
        let _ = client_events.send(ClientEvent::ConnectionStateChanged {
            connected: true,
            status: ConnectionStatus::Success,
        });
        let previous = self.links().insert(
            central.address,
            MockLink {
                central: central.clone(),
                client_events,
                awaiting: HashMap::new(),
                reliable: false,
                phy: PhyPair::default(),
            },
        );
        if let Some(previous) = previous {
            self.to_server(ServerEvent::ConnectionStateChanged {
                device: previous.central,
                connected: false,
                status: ConnectionStatus::Unknown,
            });
        }
        debug!("{}: {} attached", self.name, central.address);
        self.to_server(ServerEvent::ConnectionStateChanged {
            device: central,
            connected: true,
            status: ConnectionStatus::Success,
        });
        events
    }

    /// Drops a link, telling both ends
    fn detach(&self, address: &DeviceAddress, client_status: ConnectionStatus, server_status: ConnectionStatus) {
        let Some(link) = self.links().remove(address) else {
            return;
        };
        debug!("{}: {} detached ({:?})", self.name, address, client_status);
        let _ = link.client_events.send(ClientEvent::ConnectionStateChanged {
            connected: false,
            status: client_status,
        });
        self.to_server(ServerEvent::ConnectionStateChanged {
            device: link.central,
            connected: false,
            status: server_status,
        });
    }

    /// Registers a request awaiting a server response and returns its id
    fn expect(&self, address: &DeviceAddress, awaiting: Awaiting) -> Result<u32> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let mut links = self.links();
        let link = links
            .get_mut(address)
            .ok_or_else(|| GattError::Transport("not connected".to_string()))?;
        link.awaiting.insert(request_id, awaiting);
        Ok(request_id)
    }

    fn client_request(&self, central: &Device, request: GattRequest) -> Result<()> {
        let address = central.address;
        let reliable = match self.links().get(&address) {
            Some(link) => link.reliable,
            None => return Err(GattError::Transport("not connected".to_string())),
        };
        if self.callback_lost() {
            debug!("{}: dropping callback for {:?}", self.name, request.kind());
            return Ok(());
        }

        match request {
            GattRequest::DiscoverServices => {
                let services = self
                    .services
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                self.to_client(
                    &address,
                    ClientEvent::ServicesDiscovered {
                        services,
                        status: GattStatus::Success,
                    },
                );
            }
            GattRequest::ReadCharacteristic { handle } => {
                let request_id = self.expect(&address, Awaiting::CharacteristicRead(handle))?;
                self.to_server(ServerEvent::ReadRequest {
                    device: central.clone(),
                    request_id,
                    handle,
                    offset: 0,
                });
            }
            GattRequest::ReadDescriptor { handle } => {
                let request_id = self.expect(&address, Awaiting::DescriptorRead(handle))?;
                self.to_server(ServerEvent::ReadRequest {
                    device: central.clone(),
                    request_id,
                    handle,
                    offset: 0,
                });
            }
            GattRequest::WriteCharacteristic {
                handle,
                value,
                write_type,
            } => {
                if write_type == WriteType::WithResponse {
                    let request_id = self.expect(
                        &address,
                        Awaiting::CharacteristicWrite(handle, value.clone()),
                    )?;
                    self.to_server(ServerEvent::WriteRequest {
                        device: central.clone(),
                        request_id,
                        handle,
                        prepared: reliable,
                        response_needed: true,
                        offset: 0,
                        value,
                    });
                } else {
                    // Write commands complete locally once sent
                    let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
                    self.to_server(ServerEvent::WriteRequest {
                        device: central.clone(),
                        request_id,
                        handle,
                        prepared: false,
                        response_needed: false,
                        offset: 0,
                        value: value.clone(),
                    });
                    self.to_client(
                        &address,
                        ClientEvent::CharacteristicWrite {
                            handle,
                            value,
                            status: GattStatus::Success,
                        },
                    );
                }
            }
            GattRequest::WriteDescriptor { handle, value } => {
                let request_id =
                    self.expect(&address, Awaiting::DescriptorWrite(handle, value.clone()))?;
                self.to_server(ServerEvent::WriteRequest {
                    device: central.clone(),
                    request_id,
                    handle,
                    prepared: false,
                    response_needed: true,
                    offset: 0,
                    value,
                });
            }
            GattRequest::ReadRssi => {
                let jitter: i16 = rand::thread_rng().gen_range(-5..=5);
                self.to_client(
                    &address,
                    ClientEvent::ReadRemoteRssi {
                        rssi: MOCK_RSSI + jitter,
                        status: GattStatus::Success,
                    },
                );
            }
            GattRequest::RequestMtu { mtu } => {
                let mtu = mtu.clamp(DEFAULT_MTU, MAX_MTU);
                self.to_server(ServerEvent::MtuChanged {
                    device: central.clone(),
                    mtu,
                });
                self.to_client(
                    &address,
                    ClientEvent::MtuChanged {
                        mtu,
                        status: GattStatus::Success,
                    },
                );
            }
            GattRequest::SetPreferredPhy { tx, rx, .. } => {
                if let Some(link) = self.links().get_mut(&address) {
                    link.phy = PhyPair { tx, rx };
                }
                self.to_server(ServerEvent::PhyUpdate {
                    device: central.clone(),
                    tx,
                    rx,
                    status: GattStatus::Success,
                });
                self.to_client(
                    &address,
                    ClientEvent::PhyUpdate {
                        tx,
                        rx,
                        status: GattStatus::Success,
                    },
                );
            }
            GattRequest::ReadPhy => {
                let phy = self
                    .links()
                    .get(&address)
                    .map(|link| link.phy)
                    .unwrap_or_default();
                self.to_client(
                    &address,
                    ClientEvent::PhyRead {
                        tx: phy.tx,
                        rx: phy.rx,
                        status: GattStatus::Success,
                    },
                );
            }
            GattRequest::BeginReliableWrite => {
                self.set_reliable(&address, true);
            }
            GattRequest::ExecuteReliableWrite => {
                self.set_reliable(&address, false);
                let request_id = self.expect(&address, Awaiting::Execute)?;
                self.to_server(ServerEvent::ExecuteWrite {
                    device: central.clone(),
                    request_id,
                    execute: true,
                });
            }
            GattRequest::AbortReliableWrite => {
                self.set_reliable(&address, false);
                let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
                self.to_server(ServerEvent::ExecuteWrite {
                    device: central.clone(),
                    request_id,
                    execute: false,
                });
            }
        }
        Ok(())
    }

    fn set_reliable(&self, address: &DeviceAddress, reliable: bool) {
        if let Some(link) = self.links().get_mut(address) {
            link.reliable = reliable;
        }
    }
}

impl ServerTransport for MockRadio {
    fn send_response(
        &self,
        device: &Device,
        request_id: u32,
        status: GattStatus,
        _offset: u16,
        value: Vec<u8>,
    ) -> Result<()> {
        let awaiting = {
            let mut links = self.links();
            let link = links
                .get_mut(&device.address)
                .ok_or_else(|| GattError::Transport("not connected".to_string()))?;
            link.awaiting.remove(&request_id)
        };
        // Responses to write commands and aborts have no callback
        let Some(awaiting) = awaiting else {
            return Ok(());
        };
        if self.callback_lost() {
            debug!("{}: dropping response {}", self.name, request_id);
            return Ok(());
        }

        let event = match awaiting {
            Awaiting::CharacteristicRead(handle) => ClientEvent::CharacteristicRead {
                handle,
                value,
                status,
            },
            Awaiting::DescriptorRead(handle) => ClientEvent::DescriptorRead {
                handle,
                value,
                status,
            },
            Awaiting::CharacteristicWrite(handle, written) => ClientEvent::CharacteristicWrite {
                handle,
                value: written,
                status,
            },
            Awaiting::DescriptorWrite(handle, written) => ClientEvent::DescriptorWrite {
                handle,
                value: written,
                status,
            },
            Awaiting::Execute => ClientEvent::ReliableWriteCompleted { status },
        };
        self.to_client(&device.address, event);
        Ok(())
    }

    fn notify_characteristic_changed(
        &self,
        device: &Device,
        handle: Handle,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<()> {
        if !self.links().contains_key(&device.address) {
            return Err(GattError::Transport("not connected".to_string()));
        }
        self.to_client(
            &device.address,
            ClientEvent::CharacteristicChanged { handle, value },
        );
        if confirm {
            // The central's stack confirms indications on its own
            self.to_server(ServerEvent::NotificationSent {
                device: device.clone(),
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    fn cancel_connection(&self, device: &Device) -> Result<()> {
        self.detach(
            &device.address,
            ConnectionStatus::TerminatePeerUser,
            ConnectionStatus::TerminateLocalHost,
        );
        Ok(())
    }

    fn close(&self) {
        let addresses: Vec<DeviceAddress> = self.links().keys().copied().collect();
        for address in addresses {
            self.detach(
                &address,
                ConnectionStatus::TerminatePeerUser,
                ConnectionStatus::TerminateLocalHost,
            );
        }
        self.server_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Client transport of one central connected to a mock peripheral
struct MockClientTransport {
    radio: Arc<MockRadio>,
    central: Device,
}

impl ClientTransport for MockClientTransport {
    fn issue(&self, request: GattRequest) -> Result<()> {
        self.radio.client_request(&self.central, request)
    }

    fn disconnect(&self) -> Result<()> {
        self.radio.detach(
            &self.central.address,
            ConnectionStatus::TerminateLocalHost,
            ConnectionStatus::TerminatePeerUser,
        );
        Ok(())
    }

    fn close(&self) {
        self.disconnect().ok();
    }
}

/// A simulated peripheral running a GATT server
pub struct MockPeripheral {
    device: Device,
    radio: Arc<MockRadio>,
    server: ServerSession,
}

impl MockPeripheral {
    /// Starts a peripheral serving the given services. Must be called from
    /// within a tokio runtime.
    pub fn new(device: Device, services: &[ServiceConfig], config: GattConfig) -> Result<Self> {
        let tree = Arc::new(GattTree::build(services)?);
        let (server_events, events) = mpsc::unbounded_channel();
        let radio = Arc::new(MockRadio {
            name: device.display_name(),
            server_events: Mutex::new(Some(server_events)),
            links: Mutex::new(HashMap::new()),
            services: RwLock::new(remote_view(tree.services())),
            next_request_id: AtomicU32::new(1),
            drop_next_callback: AtomicBool::new(false),
        });
        let server = ServerSession::with_tree(
            device.display_name(),
            tree,
            ServerLink {
                transport: radio.clone(),
                events,
            },
            config,
        );
        Ok(Self {
            device,
            radio,
            server,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn server(&self) -> &ServerSession {
        &self.server
    }

    /// The next platform callback is lost, as if the radio dropped it
    pub fn drop_next_callback(&self) {
        self.radio.drop_next_callback.store(true, Ordering::SeqCst);
    }

    /// Simulates a supervision timeout on the link to one central
    pub fn drop_link(&self, central: &DeviceAddress) {
        self.radio
            .detach(central, ConnectionStatus::LinkLoss, ConnectionStatus::LinkLoss);
    }

    /// Tells every central its discovered services are stale
    pub fn signal_service_changed(&self) {
        let addresses: Vec<DeviceAddress> = self.radio.links().keys().copied().collect();
        for address in addresses {
            self.radio.to_client(&address, ClientEvent::ServiceChanged);
        }
    }

    /// Reports a bond state change to one central
    pub fn set_bond_state(&self, central: &DeviceAddress, state: BondState) {
        self.radio
            .to_client(central, ClientEvent::BondStateChanged { state });
    }

    pub fn is_connected(&self, central: &DeviceAddress) -> bool {
        self.radio.links().contains_key(central)
    }

    /// Shuts the peripheral down, dropping every link
    pub fn shutdown(&self) {
        self.server.close();
    }
}

/// Services as a central discovers them: structure and properties only
fn remote_view(services: &[Service]) -> Vec<Service> {
    let mut services = services.to_vec();
    for service in &mut services {
        for characteristic in &mut service.characteristics {
            characteristic.permissions = Permission::empty();
            for descriptor in &mut characteristic.descriptors {
                descriptor.permissions = Permission::empty();
            }
        }
    }
    services
}

/// The mock air, as seen from one central
#[derive(Clone)]
pub struct MockNetwork {
    local: Device,
    peripherals: Arc<RwLock<HashMap<DeviceAddress, Arc<MockPeripheral>>>>,
}

impl MockNetwork {
    pub fn new(local: Device) -> Self {
        Self {
            local,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The same network seen from another central
    pub fn as_central(&self, local: Device) -> Self {
        Self {
            local,
            peripherals: self.peripherals.clone(),
        }
    }

    pub fn local(&self) -> &Device {
        &self.local
    }

    /// Makes a peripheral reachable
    pub fn add_peripheral(&self, peripheral: Arc<MockPeripheral>) {
        self.peripherals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peripheral.device.address, peripheral);
    }

    pub fn peripheral(&self, address: &DeviceAddress) -> Option<Arc<MockPeripheral>> {
        self.peripherals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn open(&self, device: &Device) -> Result<ClientLink> {
        let peripheral = self
            .peripheral(&device.address)
            .ok_or_else(|| GattError::Transport(format!("{} is not in range", device.address)))?;
        let events = peripheral.radio.attach(self.local.clone());
        Ok(ClientLink {
            transport: Arc::new(MockClientTransport {
                radio: peripheral.radio.clone(),
                central: self.local.clone(),
            }),
            events,
        })
    }
}
