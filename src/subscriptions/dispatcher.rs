//! Best-effort fan-out of update notifications to a group.

use crate::types::{AnimalId, EntityKind};
use crossbeam_channel::TrySendError;
use std::sync::Arc;
use tracing::debug;

use super::registry::SubscriptionRegistry;
use super::types::{ConnectionId, UpdateNotification};

/// What happened to one dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Members that received the notification.
    pub delivered: usize,
    /// Members whose buffer was full; they miss this notification.
    pub lagged: Vec<ConnectionId>,
    /// Members whose receiver was gone; pruned from the registry.
    pub disconnected: Vec<ConnectionId>,
}

impl DispatchReport {
    /// Number of members in the snapshot the dispatch was sent to.
    pub fn targeted(&self) -> usize {
        self.delivered + self.lagged.len() + self.disconnected.len()
    }
}

/// Pushes [`UpdateNotification`]s to the members of an animal's group.
///
/// Sends never block and are never retried. A slow or vanished member
/// only affects its own delivery.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Notify every current member of `animal_id`'s group.
    pub fn dispatch(&self, animal_id: AnimalId, kind: EntityKind) -> DispatchReport {
        let notification = UpdateNotification { animal_id, kind };
        let mut report = DispatchReport::default();

        for member in self.registry.members(animal_id) {
            match member.sender.try_send(notification) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.lagged.push(member.id),
                Err(TrySendError::Disconnected(_)) => report.disconnected.push(member.id),
            }
        }

        // Receiver dropped without the close hook having run yet
        for id in &report.disconnected {
            self.registry.on_connection_closed(*id);
        }

        debug!(
            %animal_id,
            %kind,
            delivered = report.delivered,
            lagged = report.lagged.len(),
            disconnected = report.disconnected.len(),
            "dispatched update"
        );
        report
    }
}
