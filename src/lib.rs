//! # Kennel
//!
//! Care records for household animals with live per-animal change
//! notifications.
//!
//! ## Core Concepts
//!
//! - **Records**: animal profiles plus feeding, elimination and weight
//!   events, each owned by exactly one animal
//! - **Database**: an embedded table store with enforced foreign keys, a
//!   write-ahead log and pooled connections
//! - **Repositories**: validated create/read/update/delete with a three-way
//!   outcome (success, not found, failure)
//! - **Subscriptions**: clients join an animal's group and are told when one
//!   of its records changes
//!
//! ## Example
//!
//! ```ignore
//! use kennel::{Animal, Tracker, TrackerConfig, WeightSample};
//!
//! let tracker = Tracker::open(TrackerConfig::default())?;
//! let rex = tracker.animals().create(Animal::new("Rex"))?.into();
//!
//! let handle = tracker.registry().connect();
//! tracker.registry().join(handle.id, rex);
//!
//! tracker.create(WeightSample::new(rex, 12.5, "kg"))?;
//! let update = handle.recv()?; // {"animal_id":1,"kind":"weight"}
//! ```

pub mod database;
pub mod error;
pub mod repository;
pub mod subscriptions;
pub mod tracker;
pub mod types;
pub mod wal;

// Re-exports
pub use database::{Connection, Database, OnDelete, StoreConfig};
pub use error::{
    IntegrityViolation, MutationError, MutationResult, Result, StoreError, ValidationError,
};
pub use repository::{
    AnimalRepository, ChildEntity, EliminationRepository, Entity, FeedingRepository, RecordView,
    Repository, WeightRepository, MAX_LABEL_CHARS, MAX_NOTES_CHARS, MIN_NAME_CHARS,
};
pub use subscriptions::{
    ConnectionHandle, ConnectionId, DispatchReport, Dispatcher, RegistryConfig,
    SubscriptionRegistry, UpdateNotification,
};
pub use tracker::{Committed, Tracker, TrackerConfig};
pub use types::{
    Animal, AnimalId, EliminationEvent, EntityKind, FeedingEvent, RowId, StoreStats, Stored,
    TableName, Timestamp, WeightSample,
};
