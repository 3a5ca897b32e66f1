//! Subscription types for live per-animal updates.

use crate::types::{AnimalId, EntityKind};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Configuration for the subscription registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Max buffered notifications per connection before new ones are skipped.
    /// Default: 256
    pub buffer_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// The single outbound event: something about this animal changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotification {
    pub animal_id: AnimalId,
    pub kind: EntityKind,
}

impl UpdateNotification {
    /// Wire form for the serving layer.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Identity of one live client session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A group member as seen by the dispatcher.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: ConnectionId,
    pub(crate) sender: Sender<UpdateNotification>,
}

/// Receiving end of a connection, held by the serving layer.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Channel to receive notifications.
    pub receiver: Receiver<UpdateNotification>,
}

impl ConnectionHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<UpdateNotification, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<UpdateNotification, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<UpdateNotification, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<UpdateNotification> {
        self.receiver.try_iter().collect()
    }
}
