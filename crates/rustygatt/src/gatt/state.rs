//! Connection lifecycle state machine
//!
//! One per physical link. Every transition is driven by exactly one
//! [`LinkEvent`]; the current [`ConnectionSnapshot`] is published on a
//! `watch` channel so sessions and observers can follow it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{GattError, Result};
use crate::gatt::status::ConnectionStatus;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Closed,
}

impl LinkState {
    /// A connect request in this state returns the existing connection
    pub fn is_active(&self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Connected)
    }

    /// The connection is gone and its resources released
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Closed)
    }
}

/// State plus the status of the last lifecycle callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: LinkState,
    pub status: ConnectionStatus,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            status: ConnectionStatus::Unknown,
        }
    }
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// User asked to connect
    ConnectRequested,
    /// Platform reported the link up
    Connected,
    /// User asked to disconnect
    DisconnectRequested,
    /// Platform reported the link down, requested or not
    Disconnected(ConnectionStatus),
    /// Session closed for good
    Close,
}

impl LinkEvent {
    fn name(&self) -> &'static str {
        match self {
            LinkEvent::ConnectRequested => "connect",
            LinkEvent::Connected => "connected",
            LinkEvent::DisconnectRequested => "disconnect",
            LinkEvent::Disconnected(_) => "disconnected",
            LinkEvent::Close => "close",
        }
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// True exactly once per connection: when it first enters a terminal state
    pub fn ends_connection(&self) -> bool {
        !self.from.is_terminal() && self.to.is_terminal()
    }
}

/// Per-link lifecycle tracker
#[derive(Debug)]
pub struct ConnectionStateMachine {
    name: String,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionStateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            name: name.into(),
            snapshot,
        }
    }

    pub fn state(&self) -> LinkState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.snapshot.borrow()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Applies one event. Events that do not move the state (re-entrant
    /// connect, duplicate callbacks) succeed without a change.
    pub fn apply(&self, event: LinkEvent) -> Result<Transition> {
        let current = self.snapshot();
        let from = current.state;

        let next = match (from, event) {
            (LinkState::Closed, LinkEvent::ConnectRequested) => return Err(GattError::Closed),
            (LinkState::Closed, _) => current,

            (_, LinkEvent::Close) => ConnectionSnapshot {
                state: LinkState::Closed,
                ..current
            },

            (LinkState::Idle | LinkState::Disconnected, LinkEvent::ConnectRequested) => {
                ConnectionSnapshot {
                    state: LinkState::Connecting,
                    status: ConnectionStatus::Unknown,
                }
            }
            (LinkState::Connecting | LinkState::Connected, LinkEvent::ConnectRequested) => current,

            (LinkState::Idle | LinkState::Connecting, LinkEvent::Connected) => ConnectionSnapshot {
                state: LinkState::Connected,
                status: ConnectionStatus::Success,
            },
            (LinkState::Connected, LinkEvent::Connected) => current,

            (LinkState::Connecting | LinkState::Connected, LinkEvent::DisconnectRequested) => {
                ConnectionSnapshot {
                    state: LinkState::Disconnecting,
                    ..current
                }
            }
            (
                LinkState::Idle | LinkState::Disconnecting | LinkState::Disconnected,
                LinkEvent::DisconnectRequested,
            ) => current,

            (LinkState::Disconnected, LinkEvent::Disconnected(_)) => current,
            (_, LinkEvent::Disconnected(status)) => ConnectionSnapshot {
                state: LinkState::Disconnected,
                status,
            },

            (from, event) => {
                return Err(GattError::InvalidState {
                    from,
                    event: event.name(),
                })
            }
        };

        let transition = Transition {
            from,
            to: next.state,
        };
        if next != current {
            self.snapshot.send_replace(next);
        }
        if transition.changed() {
            info!(
                "{}: {:?} -> {:?} ({:?})",
                self.name, from, next.state, next.status
            );
        } else {
            debug!("{}: {} ignored in {:?}", self.name, event.name(), from);
        }
        Ok(transition)
    }
}
