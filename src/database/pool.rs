//! Bounded pool of store connection slots.
//!
//! A slot is checked out for the duration of one repository operation and
//! returned when the guard drops, on every exit path.

use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;
use tracing::error;

/// Pool of connection slots backed by a bounded channel of slot tokens.
pub struct ConnectionPool {
    release: Sender<usize>,
    acquire: Receiver<usize>,
    size: usize,
    timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool with `size` slots (at least one).
    pub fn new(size: usize, timeout: Duration) -> Self {
        let size = size.max(1);
        let (release, acquire) = bounded(size);
        for slot in 0..size {
            // Capacity equals the slot count, so this never blocks.
            let _ = release.try_send(slot);
        }

        Self {
            release,
            acquire,
            size,
            timeout,
        }
    }

    /// Wait up to the configured timeout for a free slot.
    pub fn checkout(&self) -> Result<PoolSlot> {
        match self.acquire.recv_timeout(self.timeout) {
            Ok(slot) => Ok(PoolSlot {
                slot,
                release: self.release.clone(),
            }),
            Err(_) => {
                error!(timeout = ?self.timeout, size = self.size, "store connection pool exhausted");
                Err(StoreError::PoolTimeout(self.timeout))
            }
        }
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.acquire.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A checked-out slot. Returns itself to the pool on drop.
pub struct PoolSlot {
    slot: usize,
    release: Sender<usize>,
}

impl PoolSlot {
    pub fn index(&self) -> usize {
        self.slot
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let _ = self.release.try_send(self.slot);
    }
}
