//! Embedded table store with foreign keys, a WAL and snapshot checkpoints.
//!
//! The store is reached through pooled [`Connection`]s. Each statement is a
//! single-row unit checked, logged and applied under one write lock:
//!
//! - `insert` returns the new id, or a foreign-key error for a dangling owner
//! - `update` returns the affected-row count (0 or 1)
//! - `delete` returns the removed row, or a foreign-key error when an animal
//!   still has children and deletes are restricted

mod pool;
mod tables;

pub use pool::{ConnectionPool, PoolSlot};
pub use tables::{Row, Statement, Table, TableRow, Tables};

use crate::error::{IntegrityViolation, Result, StoreError};
use crate::types::{AnimalId, RowId, StoreStats, Stored, TableName};
use crate::wal::WriteAheadLog;
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"KNL\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const SNAPSHOT_FILE: &str = "tables.bin";
const WAL_FILE: &str = "statements.wal";

/// What deleting an animal does to its child rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnDelete {
    /// Refuse while children exist.
    #[default]
    Restrict,
    /// Remove children together with the animal.
    Cascade,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base directory for the store. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Number of concurrent connections.
    pub pool_size: usize,

    /// How long a checkout waits for a free connection.
    pub checkout_timeout: Duration,

    /// fsync the WAL on every statement.
    pub sync_writes: bool,

    pub on_delete: OnDelete,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./kennel-data")),
            create_if_missing: true,
            pool_size: 8,
            checkout_timeout: Duration::from_secs(5),
            sync_writes: true,
            on_delete: OnDelete::Restrict,
        }
    }
}

impl StoreConfig {
    /// Store rooted at `path`, other settings default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Volatile store, nothing written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Default::default()
        }
    }
}

/// On-disk parts of a store.
struct Durable {
    dir: PathBuf,
    /// Lock file for exclusive access.
    _lock_file: File,
    wal: WriteAheadLog,
}

/// The table store.
pub struct Database {
    config: StoreConfig,
    durable: Option<Durable>,
    tables: RwLock<Tables>,
    pool: ConnectionPool,
}

impl Database {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        match &config.path {
            None => Ok(Self::in_memory(config)),
            Some(path) if path.join("MANIFEST").exists() => Self::open(config),
            Some(_) if config.create_if_missing => Self::create(config),
            Some(_) => Err(StoreError::NotInitialized),
        }
    }

    /// Create a volatile store.
    pub fn in_memory(config: StoreConfig) -> Self {
        let pool = ConnectionPool::new(config.pool_size, config.checkout_timeout);
        Self {
            config,
            durable: None,
            tables: RwLock::new(Tables::default()),
            pool,
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        let Some(dir) = config.path.clone() else {
            return Ok(Self::in_memory(config));
        };

        fs::create_dir_all(&dir)?;
        Self::write_manifest(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;
        let wal = WriteAheadLog::open(dir.join(WAL_FILE), config.sync_writes)?;

        info!(path = %dir.display(), "created store");

        let pool = ConnectionPool::new(config.pool_size, config.checkout_timeout);
        Ok(Self {
            config,
            durable: Some(Durable {
                dir,
                _lock_file: lock_file,
                wal,
            }),
            tables: RwLock::new(Tables::default()),
            pool,
        })
    }

    /// Open an existing store, replaying the WAL over the last checkpoint.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let Some(dir) = config.path.clone() else {
            return Err(StoreError::NotInitialized);
        };

        Self::verify_manifest(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let mut tables = if snapshot_path.exists() {
            Tables::load(&snapshot_path)?
        } else {
            Tables::default()
        };

        let wal = WriteAheadLog::open(dir.join(WAL_FILE), config.sync_writes)?;
        let entries = wal.entries()?;
        let replayed = entries.len();
        for entry in entries {
            tables.apply(entry.statement);
        }

        let stats = tables.stats();
        info!(
            path = %dir.display(),
            replayed,
            animals = stats.animals,
            feeding_events = stats.feeding_events,
            elimination_events = stats.elimination_events,
            weight_samples = stats.weight_samples,
            "opened store"
        );

        let pool = ConnectionPool::new(config.pool_size, config.checkout_timeout);
        Ok(Self {
            config,
            durable: Some(Durable {
                dir,
                _lock_file: lock_file,
                wal,
            }),
            tables: RwLock::new(tables),
            pool,
        })
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub fn connect(&self) -> Result<Connection<'_>> {
        let slot = self.pool.checkout()?;
        Ok(Connection { db: self, slot })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Whether writes survive a restart.
    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Row counts and WAL size.
    pub fn stats(&self) -> StoreStats {
        let mut stats = self.tables.read().stats();
        if let Some(durable) = &self.durable {
            stats.wal_entries = durable.wal.len();
        }
        stats
    }

    /// Snapshot all tables and clear the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };

        let tables = self.tables.write();
        tables.save(&durable.dir.join(SNAPSHOT_FILE))?;
        let folded = durable.wal.len();
        durable.wal.clear()?;

        info!(path = %durable.dir.display(), folded, "checkpoint complete");
        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.durable {
            Some(durable) => durable.wal.sync(),
            None => Ok(()),
        }
    }

    /// Log then apply. The write lock is held by the caller.
    fn commit(&self, tables: &mut Tables, statement: Statement) -> Result<Option<Row>> {
        if let Some(durable) = &self.durable {
            durable.wal.append(&statement)?;
        }
        Ok(tables.apply(statement))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// A checked-out store connection. Its pool slot is released on drop.
pub struct Connection<'a> {
    db: &'a Database,
    slot: PoolSlot,
}

impl Connection<'_> {
    /// Pool slot held by this connection.
    pub fn slot(&self) -> usize {
        self.slot.index()
    }

    /// Fetch one row by id.
    pub fn get<R: TableRow>(&self, id: RowId) -> Result<Option<R>> {
        let tables = self.db.tables.read();
        Ok(R::table(&tables).get(id).cloned())
    }

    /// Rows newest first, optionally restricted to one owning animal.
    pub fn select<R: TableRow>(&self, parent: Option<AnimalId>) -> Result<Vec<Stored<R>>> {
        let tables = self.db.tables.read();
        Ok(R::table(&tables).select(parent))
    }

    /// Insert a row and return its store-assigned id.
    pub fn insert<R: TableRow>(&self, row: R) -> Result<RowId> {
        let mut tables = self.db.tables.write();
        Self::check_parent(&tables, &row)?;

        let id = R::table(&tables).next_id();
        self.db.commit(
            &mut tables,
            Statement::Insert {
                id,
                row: row.into_row(),
            },
        )?;

        debug!(table = %R::TABLE, %id, "insert");
        Ok(id)
    }

    /// Replace a row. Returns the number of rows affected.
    pub fn update<R: TableRow>(&self, id: RowId, row: R) -> Result<u64> {
        let mut tables = self.db.tables.write();
        if !R::table(&tables).contains(id) {
            return Ok(0);
        }
        Self::check_parent(&tables, &row)?;

        self.db.commit(
            &mut tables,
            Statement::Update {
                id,
                row: row.into_row(),
            },
        )?;

        debug!(table = %R::TABLE, %id, "update");
        Ok(1)
    }

    /// Delete a row, returning it. `None` when no row had this id.
    pub fn delete<R: TableRow>(&self, id: RowId) -> Result<Option<R>> {
        let mut tables = self.db.tables.write();
        if !R::table(&tables).contains(id) {
            return Ok(None);
        }

        let cascade = self.db.config.on_delete == OnDelete::Cascade;
        if R::TABLE == TableName::Animals && !cascade {
            let animal = AnimalId::from(id);
            if let Some((table, dependents)) = tables.dependents(animal) {
                let violation = IntegrityViolation::DependentRows {
                    animal_id: animal,
                    table,
                    dependents,
                };
                warn!(table = %R::TABLE, %id, %violation, "delete restricted");
                return Err(StoreError::ForeignKey(violation));
            }
        }

        let removed = self.db.commit(
            &mut tables,
            Statement::Delete {
                table: R::TABLE,
                id,
                cascade: cascade && R::TABLE == TableName::Animals,
            },
        )?;

        debug!(table = %R::TABLE, %id, cascade, "delete");
        Ok(removed.and_then(R::from_row))
    }

    fn check_parent<R: TableRow>(tables: &Tables, row: &R) -> Result<()> {
        match row.parent() {
            Some(animal_id) if !tables.animal_exists(animal_id) => {
                Err(StoreError::ForeignKey(IntegrityViolation::MissingParent {
                    table: R::TABLE,
                    animal_id,
                }))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Animal, FeedingEvent, WeightSample};
    use tempfile::TempDir;

    fn disk_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            checkout_timeout: Duration::from_millis(50),
            ..StoreConfig::at(dir.path().join("store"))
        }
    }

    #[test]
    fn test_insert_requires_parent() {
        let db = Database::in_memory(StoreConfig::in_memory());
        let conn = db.connect().unwrap();

        let result = conn.insert(WeightSample::new(AnimalId(999), 12.5, "kg"));
        assert!(matches!(
            result,
            Err(StoreError::ForeignKey(IntegrityViolation::MissingParent { .. }))
        ));
        assert_eq!(db.stats().weight_samples, 0);
    }

    #[test]
    fn test_update_reports_affected_rows() {
        let db = Database::in_memory(StoreConfig::in_memory());
        let conn = db.connect().unwrap();

        let rex = conn.insert(Animal::new("Rex")).unwrap();
        let id = conn
            .insert(FeedingEvent::new(rex.into(), "Kibble"))
            .unwrap();

        assert_eq!(
            conn.update(id, FeedingEvent::new(rex.into(), "Chicken"))
                .unwrap(),
            1
        );
        assert_eq!(
            conn.update(RowId(42), FeedingEvent::new(rex.into(), "Chicken"))
                .unwrap(),
            0
        );
        assert_eq!(
            conn.get::<FeedingEvent>(id).unwrap().unwrap().food_type,
            "Chicken"
        );
    }

    #[test]
    fn test_update_to_missing_parent_rejected() {
        let db = Database::in_memory(StoreConfig::in_memory());
        let conn = db.connect().unwrap();

        let rex = conn.insert(Animal::new("Rex")).unwrap();
        let id = conn
            .insert(WeightSample::new(rex.into(), 10.0, "kg"))
            .unwrap();

        let result = conn.update(id, WeightSample::new(AnimalId(77), 10.0, "kg"));
        assert!(matches!(result, Err(StoreError::ForeignKey(_))));
        assert_eq!(
            conn.get::<WeightSample>(id).unwrap().unwrap().animal_id,
            AnimalId::from(rex)
        );
    }

    #[test]
    fn test_delete_animal_restricted() {
        let db = Database::in_memory(StoreConfig::in_memory());
        let conn = db.connect().unwrap();

        let rex = conn.insert(Animal::new("Rex")).unwrap();
        conn.insert(WeightSample::new(rex.into(), 10.0, "kg"))
            .unwrap();

        let result = conn.delete::<Animal>(rex);
        assert!(matches!(
            result,
            Err(StoreError::ForeignKey(IntegrityViolation::DependentRows {
                table: TableName::WeightSamples,
                dependents: 1,
                ..
            }))
        ));
        assert!(conn.get::<Animal>(rex).unwrap().is_some());
    }

    #[test]
    fn test_delete_animal_cascade() {
        let db = Database::in_memory(StoreConfig {
            on_delete: OnDelete::Cascade,
            ..StoreConfig::in_memory()
        });
        let conn = db.connect().unwrap();

        let rex = conn.insert(Animal::new("Rex")).unwrap();
        conn.insert(WeightSample::new(rex.into(), 10.0, "kg"))
            .unwrap();

        let removed = conn.delete::<Animal>(rex).unwrap();
        assert_eq!(removed.map(|a| a.name), Some("Rex".to_string()));
        assert_eq!(db.stats(), StoreStats::default());
    }

    #[test]
    fn test_delete_missing_returns_none() {
        let db = Database::in_memory(StoreConfig::in_memory());
        let conn = db.connect().unwrap();
        assert!(conn.delete::<WeightSample>(RowId(3)).unwrap().is_none());
    }

    #[test]
    fn test_reopen_replays_wal() {
        let dir = TempDir::new().unwrap();

        let (rex, sample) = {
            let db = Database::create(disk_config(&dir)).unwrap();
            let conn = db.connect().unwrap();
            let rex = conn.insert(Animal::new("Rex")).unwrap();
            let sample = conn
                .insert(WeightSample::new(rex.into(), 12.5, "kg"))
                .unwrap();
            conn.delete::<WeightSample>(sample).unwrap();
            (rex, sample)
        };

        let db = Database::open(disk_config(&dir)).unwrap();
        let stats = db.stats();
        assert_eq!(stats.animals, 1);
        assert_eq!(stats.weight_samples, 0);
        assert_eq!(stats.wal_entries, 3);

        // Deleted ids stay retired across restarts
        let conn = db.connect().unwrap();
        let next = conn
            .insert(WeightSample::new(rex.into(), 13.0, "kg"))
            .unwrap();
        assert!(next > sample);
    }

    #[test]
    fn test_checkpoint_then_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let db = Database::create(disk_config(&dir)).unwrap();
            let conn = db.connect().unwrap();
            let rex = conn.insert(Animal::new("Rex")).unwrap();
            conn.insert(WeightSample::new(rex.into(), 12.5, "kg"))
                .unwrap();
            drop(conn);

            db.checkpoint().unwrap();
            assert_eq!(db.stats().wal_entries, 0);

            let conn = db.connect().unwrap();
            conn.insert(Animal::new("Bella")).unwrap();
        }

        let db = Database::open(disk_config(&dir)).unwrap();
        let stats = db.stats();
        assert_eq!(stats.animals, 2);
        assert_eq!(stats.weight_samples, 1);
        assert_eq!(stats.wal_entries, 1);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _db = Database::create(disk_config(&dir)).unwrap();

        let result = Database::open(disk_config(&dir));
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..disk_config(&dir)
        };
        assert!(matches!(
            Database::open_or_create(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_connection_released_after_use() {
        let db = Database::in_memory(StoreConfig {
            pool_size: 1,
            checkout_timeout: Duration::from_millis(20),
            ..StoreConfig::in_memory()
        });

        let held = db.connect().unwrap();
        assert!(matches!(db.connect(), Err(StoreError::PoolTimeout(_))));
        drop(held);
        assert!(db.connect().is_ok());
    }
}
