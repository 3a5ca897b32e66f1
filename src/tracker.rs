//! Binds repository outcomes to update notifications.
//!
//! A child-record mutation dispatches to its owner's group if and only if
//! the repository reported success, and only after the store acknowledged
//! the write. Animal profile edits go through [`Tracker::animals`] and never
//! notify.

use crate::database::{Database, StoreConfig};
use crate::error::{MutationError, MutationResult, Result};
use crate::repository::{AnimalRepository, ChildEntity, Entity, RecordView, Repository};
use crate::subscriptions::{DispatchReport, Dispatcher, RegistryConfig, SubscriptionRegistry};
use crate::types::{AnimalId, EntityKind, RowId, StoreStats};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::debug;

/// Tracker configuration.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    /// Number of per-animal ordering locks. Animals sharing a stripe
    /// serialize their writes against each other.
    pub ordering_stripes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            ordering_stripes: 64,
        }
    }
}

impl TrackerConfig {
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig::in_memory(),
            ..Default::default()
        }
    }
}

/// A committed child mutation and the dispatch it triggered.
#[derive(Clone, Debug)]
pub struct Committed<T> {
    pub value: T,
    pub animal_id: AnimalId,
    pub dispatch: DispatchReport,
}

/// Entry point for the serving layer: repositories plus live notifications.
pub struct Tracker {
    db: Arc<Database>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    stripes: Box<[Mutex<()>]>,
}

impl Tracker {
    /// Open (or create) the store and start with an empty registry.
    pub fn open(config: TrackerConfig) -> Result<Self> {
        let db = Database::open_or_create(config.store)?;
        Ok(Self::with_database(
            Arc::new(db),
            config.registry,
            config.ordering_stripes,
        ))
    }

    pub fn with_database(
        db: Arc<Database>,
        registry: RegistryConfig,
        ordering_stripes: usize,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::with_config(registry));
        let stripes = (0..ordering_stripes.max(1))
            .map(|_| Mutex::new(()))
            .collect();

        Self {
            db,
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
            stripes,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Animal profiles. Mutations here do not notify.
    pub fn animals(&self) -> AnimalRepository {
        Repository::new(Arc::clone(&self.db))
    }

    /// Read access to any table. Child writes go through [`Tracker::create`],
    /// [`Tracker::update`] and [`Tracker::delete`].
    pub fn repository<E: Entity>(&self) -> RecordView<E> {
        RecordView::new(Arc::clone(&self.db))
    }

    pub fn stats(&self) -> StoreStats {
        self.db.stats()
    }

    /// Create a child record and notify its owner's group.
    pub fn create<E: ChildEntity>(&self, record: E) -> MutationResult<Committed<RowId>> {
        let animal_id = record.animal_id();
        let _order = self.stripe(animal_id);

        let id = self.writer::<E>().create(record)?;
        Ok(self.notify(id, animal_id, E::KIND))
    }

    /// Replace a child record and notify its (new) owner's group.
    pub fn update<E: ChildEntity>(&self, id: RowId, record: E) -> MutationResult<Committed<()>> {
        let animal_id = record.animal_id();
        let _order = self.stripe(animal_id);

        self.writer::<E>().update(id, record)?;
        Ok(self.notify((), animal_id, E::KIND))
    }

    /// Delete a child record and notify the group of the animal that owned it.
    pub fn delete<E: ChildEntity>(&self, id: RowId) -> MutationResult<Committed<E>> {
        let repo = self.writer::<E>();

        // The owner is needed to pick the stripe before the write. A missing
        // row falls through to the delete, which reports NotFound.
        let owner = repo
            .read(id)
            .map_err(MutationError::from)?
            .map(|stored| stored.record.animal_id());
        let _order = owner.map(|animal_id| self.stripe(animal_id));

        let removed = repo.delete(id)?;
        let animal_id = removed.animal_id();
        Ok(self.notify(removed, animal_id, E::KIND))
    }

    /// Snapshot the store and clear its WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.db.checkpoint()
    }

    fn notify<T>(&self, value: T, animal_id: AnimalId, kind: EntityKind) -> Committed<T> {
        let dispatch = self.dispatcher.dispatch(animal_id, kind);
        debug!(%animal_id, %kind, delivered = dispatch.delivered, "mutation committed");
        Committed {
            value,
            animal_id,
            dispatch,
        }
    }

    fn writer<E: ChildEntity>(&self) -> Repository<E> {
        Repository::new(Arc::clone(&self.db))
    }

    fn stripe(&self, animal_id: AnimalId) -> MutexGuard<'_, ()> {
        let index = animal_id.0.unsigned_abs() as usize % self.stripes.len();
        self.stripes[index].lock()
    }
}
