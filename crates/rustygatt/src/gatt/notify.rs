//! Notification stream
//!
//! Unsolicited value changes bypass the operation gate and are fanned out
//! per characteristic to every open [`NotificationStream`]. Values for one
//! characteristic arrive in the order they were published.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::gatt::types::Handle;

/// Fan-out of value changes, keyed by characteristic value handle
#[derive(Debug)]
pub struct NotificationHub {
    name: String,
    subscribers: Mutex<Option<HashMap<Handle, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>,
}

impl NotificationHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Opens a stream of values for one characteristic. Once the hub is
    /// closed the returned stream ends immediately.
    pub fn subscribe(&self, handle: Handle) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(map) = subscribers.as_mut() {
            map.entry(handle).or_default().push(tx);
        }
        NotificationStream { handle, rx }
    }

    /// Delivers a value to every open stream of the characteristic and
    /// returns how many received it
    pub fn publish(&self, handle: Handle, value: &[u8]) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(streams) = subscribers.as_mut().and_then(|map| map.get_mut(&handle)) else {
            return 0;
        };
        streams.retain(|tx| tx.send(value.to_vec()).is_ok());
        trace!(
            "{}: 0x{:04X} <- {} to {} stream(s)",
            self.name,
            handle,
            hex::encode(value),
            streams.len()
        );
        streams.len()
    }

    /// Open streams for a characteristic
    pub fn subscriber_count(&self, handle: Handle) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .as_ref()
            .and_then(|map| map.get(&handle))
            .map(|streams| streams.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Ends every stream; nothing is delivered afterwards
    pub fn close(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.take().is_some() {
            trace!("{}: notification streams closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

/// Values of one characteristic, in receipt order. Ends when the connection
/// goes away.
#[derive(Debug)]
pub struct NotificationStream {
    handle: Handle,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationStream {
    /// Characteristic value handle this stream follows
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Next value, or `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
