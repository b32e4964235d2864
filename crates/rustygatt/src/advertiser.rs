//! Advertiser contract
//!
//! Advertising is opaque to the GATT core: it takes a name and a service UUID
//! and reports its lifecycle as a stream of [`AdvertisingEvent`]s.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::uuid::Uuid;

/// Platform code for an advertiser that is already running
pub const ADVERTISE_FAILED_ALREADY_STARTED: u8 = 3;

/// What to advertise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingConfig {
    pub name: String,
    pub service_uuid: Uuid,
}

impl AdvertisingConfig {
    pub fn new(name: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            service_uuid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingEvent {
    Started,
    Stopped,
    Failed { code: u8 },
}

/// Lifecycle events of one advertising run. Ends after `Stopped` or `Failed`.
pub type AdvertisingStream = mpsc::UnboundedReceiver<AdvertisingEvent>;

#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn advertise(&self, config: AdvertisingConfig) -> Result<AdvertisingStream>;

    /// Stops the current run, if any
    async fn stop(&self) -> Result<()>;
}

/// Advertiser that only reports lifecycle events
#[derive(Debug, Default)]
pub struct MockAdvertiser {
    running: Mutex<Option<mpsc::UnboundedSender<AdvertisingEvent>>>,
    fail_next: Mutex<Option<u8>>,
}

impl MockAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `advertise` call fails with `code`
    pub fn fail_next(&self, code: u8) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }

    pub fn is_advertising(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[async_trait]
impl Advertiser for MockAdvertiser {
    async fn advertise(&self, config: AdvertisingConfig) -> Result<AdvertisingStream> {
        let (tx, rx) = mpsc::unbounded();
        let failure = self.fail_next.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());

        let failure = failure.or_else(|| running.as_ref().map(|_| ADVERTISE_FAILED_ALREADY_STARTED));
        if let Some(code) = failure {
            debug!("advertising {} failed: {}", config.name, code);
            let _ = tx.unbounded_send(AdvertisingEvent::Failed { code });
            return Ok(rx);
        }

        info!("advertising {} ({})", config.name, config.service_uuid);
        let _ = tx.unbounded_send(AdvertisingEvent::Started);
        *running = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = running {
            info!("advertising stopped");
            let _ = tx.unbounded_send(AdvertisingEvent::Stopped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn config() -> AdvertisingConfig {
        AdvertisingConfig::new("relay", Uuid::from_u16(0x180D))
    }

    #[tokio::test]
    async fn test_start_then_stop_ends_stream() {
        let advertiser = MockAdvertiser::new();
        let mut events = advertiser.advertise(config()).await.unwrap();
        assert_eq!(events.next().await, Some(AdvertisingEvent::Started));
        assert!(advertiser.is_advertising());

        advertiser.stop().await.unwrap();
        assert_eq!(events.next().await, Some(AdvertisingEvent::Stopped));
        assert_eq!(events.next().await, None);
        assert!(!advertiser.is_advertising());
    }

    #[tokio::test]
    async fn test_second_advertise_fails_already_started() {
        let advertiser = MockAdvertiser::new();
        let _first = advertiser.advertise(config()).await.unwrap();
        let mut second = advertiser.advertise(config()).await.unwrap();
        assert_eq!(
            second.next().await,
            Some(AdvertisingEvent::Failed {
                code: ADVERTISE_FAILED_ALREADY_STARTED
            })
        );
        assert_eq!(second.next().await, None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let advertiser = MockAdvertiser::new();
        advertiser.fail_next(1);
        let mut events = advertiser.advertise(config()).await.unwrap();
        assert_eq!(events.next().await, Some(AdvertisingEvent::Failed { code: 1 }));
        assert!(!advertiser.is_advertising());
    }
}
