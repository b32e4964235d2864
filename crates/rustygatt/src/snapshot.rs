//! Read-only status snapshots for a presentation layer
//!
//! Each monitor spawns a task that folds session events into a status value
//! and publishes it on a `watch` channel. The task ends when every receiver
//! is dropped or the session goes away.

use std::collections::HashMap;

use futures::stream::{select_all, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::advertiser::{AdvertisingEvent, AdvertisingStream};
use crate::device::Device;
use crate::error::{GattError, Result};
use crate::gatt::client::ClientSession;
use crate::gatt::server::{ServerConnectionEvent, ServerSession};
use crate::gatt::state::ConnectionSnapshot;
use crate::gatt::status::ConnectionStatus;
use crate::gatt::types::Handle;
use crate::uuid::Uuid;

/// What a peripheral-side screen shows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub advertising: bool,
    pub connected: Vec<Device>,
    /// Last value a central wrote to the watched characteristic
    pub last_value: Option<Vec<u8>>,
}

/// What a central-side screen shows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatus {
    pub connection: ConnectionSnapshot,
    /// Latest value per characteristic value handle
    pub values: HashMap<Handle, Vec<u8>>,
    /// A required service was absent after discovery
    pub missing_services: bool,
    /// Set once the connection is gone
    pub disconnect_status: Option<ConnectionStatus>,
}

/// Follows a server's connections, the writes to `watched` and an
/// advertising run
pub fn watch_server(
    server: &ServerSession,
    watched: Handle,
    mut advertising: AdvertisingStream,
) -> watch::Receiver<ServerStatus> {
    let (tx, rx) = watch::channel(ServerStatus::default());
    let mut connections = server.connection_events();
    let mut values = server.value_events();

    tokio::spawn(async move {
        let mut advertising_done = false;
        loop {
            tokio::select! {
                event = connections.recv() => match event {
                    Ok(ServerConnectionEvent::DeviceConnected(device)) => {
                        tx.send_modify(|status| {
                            status.connected.retain(|d| d.address != device.address);
                            status.connected.push(device);
                        });
                    }
                    Ok(ServerConnectionEvent::DeviceDisconnected { device, .. }) => {
                        tx.send_modify(|status| {
                            status.connected.retain(|d| d.address != device.address)
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("server status missed {} connection event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = values.recv() => match changed {
                    Ok(changed) if changed.handle == watched => {
                        tx.send_modify(|status| status.last_value = Some(changed.value));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("server status missed {} value(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = advertising.next(), if !advertising_done => match event {
                    Some(AdvertisingEvent::Started) => {
                        tx.send_modify(|status| status.advertising = true);
                    }
                    Some(AdvertisingEvent::Stopped) | None => {
                        advertising_done = true;
                        tx.send_modify(|status| status.advertising = false);
                    }
                    Some(AdvertisingEvent::Failed { code }) => {
                        warn!("advertising failed: {}", code);
                        advertising_done = true;
                        tx.send_modify(|status| status.advertising = false);
                    }
                },
                _ = tx.closed() => break,
            }
        }
        debug!("server status monitor finished");
    });
    rx
}

/// Discovers the client's services and follows its connection and the
/// notifications of every required service.
///
/// When a required service is missing the session is disconnected and the
/// status reports `missing_services` with a `NotSupported` disconnect status.
pub async fn watch_client(
    session: &ClientSession,
    required: &[Uuid],
) -> Result<watch::Receiver<ClientStatus>> {
    let (tx, rx) = watch::channel(ClientStatus {
        connection: session.snapshot(),
        ..ClientStatus::default()
    });

    let tree = session.discover_services().await?;
    let mut services = Vec::with_capacity(required.len());
    for uuid in required {
        match tree.service(*uuid) {
            Ok(service) => services.push(service),
            Err(GattError::NotFound { .. }) => {
                info!("{}: required service {} missing", session.device().display_name(), uuid);
                session.disconnect().await?;
                tx.send_modify(|status| {
                    status.connection = session.snapshot();
                    status.missing_services = true;
                    status.disconnect_status = Some(ConnectionStatus::NotSupported);
                });
                return Ok(rx);
            }
            Err(e) => return Err(e),
        }
    }

    let mut streams = Vec::new();
    for service in services {
        for characteristic in &service.characteristics {
            if characteristic.properties.can_subscribe() {
                let stream = session.subscribe(characteristic).await?;
                let handle = stream.handle();
                streams.push(stream.map(move |value| (handle, value)).boxed());
            }
        }
    }

    let mut values = select_all(streams);
    let mut connection = session.connection_state();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some((handle, value)) = values.next() => {
                    tx.send_modify(|status| {
                        status.values.insert(handle, value);
                    });
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = *connection.borrow_and_update();
                    let ended = snapshot.state.is_terminal();
                    tx.send_modify(|status| {
                        status.connection = snapshot;
                        if ended {
                            status.disconnect_status = Some(snapshot.status);
                        }
                    });
                    if ended {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!("client status monitor finished");
    });
    Ok(rx)
}
