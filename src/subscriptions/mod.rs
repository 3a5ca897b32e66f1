//! Live per-animal update subscriptions.
//!
//! Clients open a connection, join the group of each animal whose detail
//! page they are viewing, and receive an [`UpdateNotification`] whenever a
//! feeding, elimination or weight record of that animal changes.
//!
//! - The [`SubscriptionRegistry`] owns group membership
//! - The [`Dispatcher`] fans one notification out to a group snapshot
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new());
//! let dispatcher = Dispatcher::new(Arc::clone(&registry));
//!
//! let handle = registry.connect();
//! registry.join(handle.id, AnimalId(1));
//!
//! dispatcher.dispatch(AnimalId(1), EntityKind::Weight);
//! let update = handle.recv()?;
//!
//! // When the client goes away, for whatever reason:
//! registry.on_connection_closed(handle.id);
//! ```

mod dispatcher;
mod registry;
mod types;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use registry::SubscriptionRegistry;
pub use types::{ConnectionHandle, ConnectionId, Member, RegistryConfig, UpdateNotification};
