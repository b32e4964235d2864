//! Session configuration

use std::time::Duration;

use crate::gatt::constants::{DEFAULT_MTU, MAX_MTU, PREPARE_WRITE_QUEUE_SIZE};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by client and server sessions
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Maximum time an admitted operation waits for its callback before the
    /// gate gives up on it and admits the next one
    pub operation_timeout: Duration,
    /// Maximum time to wait for a connect or disconnect to settle
    pub connect_timeout: Duration,
    /// MTU to request after connecting
    pub preferred_mtu: u16,
    /// Prepared writes held per reliable write transaction
    pub prepare_queue_limit: usize,
    /// Capacity of the application-facing broadcast channels
    pub event_buffer: usize,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30), // ATT transaction timeout
            connect_timeout: Duration::from_secs(10),
            preferred_mtu: MAX_MTU,
            prepare_queue_limit: PREPARE_WRITE_QUEUE_SIZE,
            event_buffer: 64,
        }
    }
}

impl GattConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set preferred MTU, clamped to the range the stack accepts
    pub fn with_preferred_mtu(mut self, mtu: u16) -> Self {
        self.preferred_mtu = mtu.clamp(DEFAULT_MTU, MAX_MTU);
        self
    }

    /// Set the prepared write queue limit
    pub fn with_prepare_queue_limit(mut self, limit: usize) -> Self {
        self.prepare_queue_limit = limit;
        self
    }

    /// Set broadcast channel capacity
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// MTU actually requested, after clamping
    pub fn effective_mtu(&self) -> u16 {
        self.preferred_mtu.clamp(DEFAULT_MTU, MAX_MTU)
    }
}
