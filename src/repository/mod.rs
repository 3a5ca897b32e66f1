//! Per-entity repositories with a strict affected-row contract.
//!
//! Mutations return [`MutationResult`]: success means exactly one row was
//! written. Zero rows is [`MutationError::NotFound`], a dangling or stranded
//! animal reference is [`MutationError::Integrity`], and anything else the
//! store reports is [`MutationError::Transient`].

mod entity;

pub use entity::{ChildEntity, Entity, MAX_LABEL_CHARS, MAX_NOTES_CHARS, MIN_NAME_CHARS};

use crate::database::Database;
use crate::error::{MutationError, MutationResult, Result, StoreError, ValidationError};
use crate::types::{
    Animal, AnimalId, EliminationEvent, FeedingEvent, RowId, Stored, WeightSample,
};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub type AnimalRepository = Repository<Animal>;
pub type FeedingRepository = Repository<FeedingEvent>;
pub type EliminationRepository = Repository<EliminationEvent>;
pub type WeightRepository = Repository<WeightSample>;

/// CRUD access to one table.
///
/// Each call checks out its own pooled connection and releases it before
/// returning.
pub struct Repository<E> {
    db: Arc<Database>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            _entity: PhantomData,
        }
    }

    /// Validate and insert. Returns the new id.
    pub fn create(&self, record: E) -> MutationResult<RowId> {
        if let Err(e) = record.validate() {
            warn!(entity = E::NAME, field = e.field(), error = %e, "rejected create");
            return Err(e.into());
        }

        let conn = self.db.connect().map_err(|e| self.failed("create", None, e))?;
        let id = conn
            .insert(record)
            .map_err(|e| self.failed("create", None, e))?;

        debug!(entity = E::NAME, %id, "created");
        Ok(id)
    }

    /// Fetch one record. Absence is `Ok(None)`, never an error.
    pub fn read(&self, id: RowId) -> Result<Option<Stored<E>>> {
        if !id.is_valid() {
            return Ok(None);
        }

        let conn = self.db.connect()?;
        let record = conn.get::<E>(id)?;
        Ok(record.map(|record| Stored { id, record }))
    }

    /// Replace every mutable field of record `id`.
    pub fn update(&self, id: RowId, record: E) -> MutationResult<()> {
        check_id(id)?;
        if let Err(e) = record.validate() {
            warn!(entity = E::NAME, %id, field = e.field(), error = %e, "rejected update");
            return Err(e.into());
        }

        let conn = self
            .db
            .connect()
            .map_err(|e| self.failed("update", Some(id), e))?;
        let affected = conn
            .update(id, record)
            .map_err(|e| self.failed("update", Some(id), e))?;

        match affected {
            1 => {
                debug!(entity = E::NAME, %id, "updated");
                Ok(())
            }
            0 => {
                debug!(entity = E::NAME, %id, "update matched no row");
                Err(self.not_found(id))
            }
            n => Err(self.failed(
                "update",
                Some(id),
                StoreError::Corruption(format!("update of {} {id} touched {n} rows", E::NAME)),
            )),
        }
    }

    /// Delete record `id`, returning what was removed.
    pub fn delete(&self, id: RowId) -> MutationResult<E> {
        check_id(id)?;

        let conn = self
            .db
            .connect()
            .map_err(|e| self.failed("delete", Some(id), e))?;
        match conn.delete::<E>(id) {
            Ok(Some(removed)) => {
                debug!(entity = E::NAME, %id, "deleted");
                Ok(removed)
            }
            Ok(None) => Err(self.not_found(id)),
            Err(e) => Err(self.failed("delete", Some(id), e)),
        }
    }

    /// Every record of this type. Administrative use only.
    pub fn list(&self) -> Result<Vec<Stored<E>>> {
        let conn = self.db.connect()?;
        conn.select::<E>(None)
    }

    pub fn exists(&self, id: RowId) -> Result<bool> {
        Ok(self.read(id)?.is_some())
    }

    fn not_found(&self, id: RowId) -> MutationError {
        MutationError::NotFound {
            table: E::TABLE,
            id,
        }
    }

    /// Classify a store error and log it at the matching level.
    fn failed(&self, op: &'static str, id: Option<RowId>, e: StoreError) -> MutationError {
        let err = MutationError::from(e);
        match &err {
            MutationError::Integrity(violation) => {
                warn!(entity = E::NAME, op, ?id, %violation, "integrity violation");
            }
            MutationError::Transient(cause) => {
                error!(entity = E::NAME, op, ?id, error = %cause, "store failure");
            }
            _ => {}
        }
        err
    }
}

impl<E: ChildEntity> Repository<E> {
    /// Records owned by one animal, newest first.
    pub fn list_for_animal(&self, animal_id: AnimalId) -> Result<Vec<Stored<E>>> {
        if !animal_id.is_valid() {
            return Ok(Vec::new());
        }

        let conn = self.db.connect()?;
        conn.select::<E>(Some(animal_id))
    }
}

/// Read-only access to one table.
///
/// Handed out where writes must go through another path, such as
/// [`Tracker`](crate::Tracker), whose child mutations always notify:
///
/// ```compile_fail
/// use kennel::{Animal, AnimalId, Tracker, TrackerConfig, WeightSample};
///
/// let tracker = Tracker::open(TrackerConfig::in_memory()).unwrap();
/// let rex: AnimalId = tracker.animals().create(Animal::new("Rex")).unwrap().into();
/// tracker
///     .repository::<WeightSample>()
///     .create(WeightSample::new(rex, 12.5, "kg"));
/// ```
pub struct RecordView<E> {
    inner: Repository<E>,
}

impl<E> Clone for RecordView<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Entity> RecordView<E> {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Repository::new(db),
        }
    }

    pub fn read(&self, id: RowId) -> Result<Option<Stored<E>>> {
        self.inner.read(id)
    }

    pub fn list(&self) -> Result<Vec<Stored<E>>> {
        self.inner.list()
    }

    pub fn exists(&self, id: RowId) -> Result<bool> {
        self.inner.exists(id)
    }
}

impl<E: ChildEntity> RecordView<E> {
    pub fn list_for_animal(&self, animal_id: AnimalId) -> Result<Vec<Stored<E>>> {
        self.inner.list_for_animal(animal_id)
    }
}

fn check_id(id: RowId) -> std::result::Result<(), ValidationError> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvalidId {
            field: "id",
            value: id.0,
        })
    }
}
