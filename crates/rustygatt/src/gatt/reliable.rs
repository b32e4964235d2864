//! Reliable write transactions
//!
//! Prepared writes are queued per connection without touching the tree.
//! Execute validates the whole queue first and hands back the combined
//! values so the caller can land them in one batch; cancel drops the queue.

use std::collections::BTreeMap;

use crate::error::{GattError, Result};
use crate::gatt::status::GattStatus;
use crate::gatt::types::Handle;

/// One queued part of an attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWrite {
    pub handle: Handle,
    pub offset: u16,
    pub value: Vec<u8>,
}

/// Queue of prepared writes of one connection
#[derive(Debug, Clone)]
pub struct ReliableWriteTransaction {
    limit: usize,
    writes: Vec<PreparedWrite>,
}

impl ReliableWriteTransaction {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            writes: Vec::new(),
        }
    }

    /// Queues a part. Fails with `PrepareQueueFull` once the limit is reached.
    pub fn prepare(
        &mut self,
        handle: Handle,
        offset: u16,
        value: Vec<u8>,
    ) -> std::result::Result<(), GattStatus> {
        if self.writes.len() >= self.limit {
            return Err(GattStatus::PrepareQueueFull);
        }
        self.writes.push(PreparedWrite {
            handle,
            offset,
            value,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[PreparedWrite] {
        &self.writes
    }

    /// Combines the parts of each attribute into its new value.
    ///
    /// Parts are applied in queue order: each one replaces the value from its
    /// offset on, so a part at offset 0 starts the value over. An offset past
    /// the end of the value built so far returns nothing and `InvalidOffset`.
    pub fn combine(&self) -> std::result::Result<Vec<(Handle, Vec<u8>)>, (Handle, GattStatus)> {
        let mut combined: BTreeMap<Handle, Vec<u8>> = BTreeMap::new();
        for write in &self.writes {
            let value = combined.entry(write.handle).or_default();
            let offset = write.offset as usize;
            if offset > value.len() {
                return Err((write.handle, GattStatus::InvalidOffset));
            }
            value.truncate(offset);
            value.extend_from_slice(&write.value);
        }
        Ok(combined.into_iter().collect())
    }
}

/// Open/closed slot of a connection's transaction
#[derive(Debug, Default)]
pub struct ReliableWrite {
    open: Option<ReliableWriteTransaction>,
}

impl ReliableWrite {
    /// Opens a transaction. A second begin while one is open is rejected.
    pub fn begin(&mut self, limit: usize) -> Result<()> {
        if self.open.is_some() {
            return Err(GattError::TransactionAlreadyOpen);
        }
        self.open = Some(ReliableWriteTransaction::new(limit));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut ReliableWriteTransaction> {
        self.open.as_mut()
    }

    /// Closes the transaction and hands it over for execution
    pub fn take(&mut self) -> Result<ReliableWriteTransaction> {
        self.open.take().ok_or(GattError::NoOpenTransaction)
    }

    /// Discards the queue, returning how many parts were dropped
    pub fn cancel(&mut self) -> Result<usize> {
        self.take().map(|transaction| transaction.len())
    }
}
