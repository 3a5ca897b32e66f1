//! In-memory table state and the statements that mutate it.

use crate::error::{Result, StoreError};
use crate::types::{
    Animal, AnimalId, EliminationEvent, FeedingEvent, RowId, StoreStats, Stored, TableName,
    WeightSample,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for the table snapshot.
const SNAPSHOT_MAGIC: &[u8; 4] = b"TBL\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Magic + version + body length.
const SNAPSHOT_HEADER_LEN: u64 = 13;

/// A row type stored in one of the four tables.
pub trait TableRow: Clone + fmt::Debug + Send + Sync + 'static {
    const TABLE: TableName;

    /// Owning animal, for rows that carry a foreign key.
    fn parent(&self) -> Option<AnimalId>;

    /// Ordering key for listings; `None` orders by id ascending instead.
    fn sort_key(&self) -> Option<DateTime<Utc>>;

    fn table(tables: &Tables) -> &Table<Self>;

    fn into_row(self) -> Row;

    fn from_row(row: Row) -> Option<Self>;
}

/// A row of any table, as carried by statements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Row {
    Animal(Animal),
    Feeding(FeedingEvent),
    Elimination(EliminationEvent),
    Weight(WeightSample),
}

/// A single-row write, as logged to the WAL.
///
/// Applying a statement is an idempotent redo: replaying a log over a state
/// that already contains its effects yields the same tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Insert { id: RowId, row: Row },
    Update { id: RowId, row: Row },
    Delete { table: TableName, id: RowId, cascade: bool },
}

/// One table: rows by id plus a secondary index by owning animal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Table<R> {
    rows: BTreeMap<i64, R>,
    next_id: i64,
    #[serde(skip)]
    by_parent: HashMap<AnimalId, BTreeSet<i64>>,
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
            by_parent: HashMap::new(),
        }
    }
}

impl<R: TableRow> Table<R> {
    pub fn get(&self, id: RowId) -> Option<&R> {
        self.rows.get(&id.0)
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.rows.contains_key(&id.0)
    }

    /// Identifier the next insert will receive.
    pub fn next_id(&self) -> RowId {
        RowId(self.next_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows owned by `animal`.
    pub fn count_children(&self, animal: AnimalId) -> usize {
        self.by_parent.get(&animal).map_or(0, BTreeSet::len)
    }

    /// Rows ordered for listing, optionally restricted to one owner.
    pub fn select(&self, parent: Option<AnimalId>) -> Vec<Stored<R>> {
        let mut rows: Vec<Stored<R>> = match parent {
            Some(animal) => self
                .by_parent
                .get(&animal)
                .into_iter()
                .flatten()
                .filter_map(|id| self.stored(*id))
                .collect(),
            None => self.rows.keys().filter_map(|id| self.stored(*id)).collect(),
        };

        // Newest first; ties broken by id so the order is total.
        rows.sort_by_key(|s| (Reverse(s.record.sort_key()), Reverse(s.id)));
        if rows.iter().all(|s| s.record.sort_key().is_none()) {
            rows.sort_by_key(|s| s.id);
        }
        rows
    }

    fn stored(&self, id: i64) -> Option<Stored<R>> {
        self.rows.get(&id).map(|record| Stored {
            id: RowId(id),
            record: record.clone(),
        })
    }

    /// Upsert a row, keeping the id counter ahead of every id ever seen.
    fn put(&mut self, id: RowId, row: R) -> Option<R> {
        self.next_id = self.next_id.max(id.0 + 1);
        if let Some(parent) = row.parent() {
            self.by_parent.entry(parent).or_default().insert(id.0);
        }
        let previous = self.rows.insert(id.0, row);
        if let Some(old_parent) = previous.as_ref().and_then(R::parent) {
            let moved = self.rows.get(&id.0).and_then(R::parent) != Some(old_parent);
            if moved {
                self.unindex(old_parent, id.0);
            }
        }
        previous
    }

    fn remove(&mut self, id: RowId) -> Option<R> {
        let removed = self.rows.remove(&id.0)?;
        if let Some(parent) = removed.parent() {
            self.unindex(parent, id.0);
        }
        Some(removed)
    }

    fn remove_children(&mut self, animal: AnimalId) -> usize {
        let ids = self.by_parent.remove(&animal).unwrap_or_default();
        for id in &ids {
            self.rows.remove(id);
        }
        ids.len()
    }

    fn unindex(&mut self, parent: AnimalId, id: i64) {
        if let Some(ids) = self.by_parent.get_mut(&parent) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.by_parent.clear();
        for (id, row) in &self.rows {
            if let Some(parent) = row.parent() {
                self.by_parent.entry(parent).or_default().insert(*id);
            }
        }
    }
}

/// All four tables.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    animals: Table<Animal>,
    feeding_events: Table<FeedingEvent>,
    elimination_events: Table<EliminationEvent>,
    weight_samples: Table<WeightSample>,
}

impl Tables {
    /// Apply a statement. Returns the row it replaced or removed, if any.
    ///
    /// Constraint checks happen before a statement is logged; applying never
    /// fails so that live writes and WAL replay share one code path.
    pub fn apply(&mut self, statement: Statement) -> Option<Row> {
        match statement {
            Statement::Insert { id, row } | Statement::Update { id, row } => self.put_row(id, row),
            Statement::Delete { table, id, cascade } => self.remove_row(table, id, cascade),
        }
    }

    /// Whether `animal` resolves to an existing Animal row.
    pub fn animal_exists(&self, animal: AnimalId) -> bool {
        animal.is_valid() && self.animals.contains(animal.into())
    }

    /// First child table still holding rows for `animal`, with its count.
    pub fn dependents(&self, animal: AnimalId) -> Option<(TableName, usize)> {
        [
            (
                TableName::FeedingEvents,
                self.feeding_events.count_children(animal),
            ),
            (
                TableName::EliminationEvents,
                self.elimination_events.count_children(animal),
            ),
            (
                TableName::WeightSamples,
                self.weight_samples.count_children(animal),
            ),
        ]
        .into_iter()
        .find(|(_, count)| *count > 0)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            animals: self.animals.len(),
            feeding_events: self.feeding_events.len(),
            elimination_events: self.elimination_events.len(),
            weight_samples: self.weight_samples.len(),
            wal_entries: 0,
        }
    }

    fn put_row(&mut self, id: RowId, row: Row) -> Option<Row> {
        match row {
            Row::Animal(r) => self.animals.put(id, r).map(Row::Animal),
            Row::Feeding(r) => self.feeding_events.put(id, r).map(Row::Feeding),
            Row::Elimination(r) => self.elimination_events.put(id, r).map(Row::Elimination),
            Row::Weight(r) => self.weight_samples.put(id, r).map(Row::Weight),
        }
    }

    fn remove_row(&mut self, table: TableName, id: RowId, cascade: bool) -> Option<Row> {
        match table {
            TableName::Animals => {
                // Children go even when the animal row is already gone, so a
                // replayed child insert can't outlive its parent's delete.
                if cascade {
                    let animal = AnimalId::from(id);
                    self.feeding_events.remove_children(animal);
                    self.elimination_events.remove_children(animal);
                    self.weight_samples.remove_children(animal);
                }
                self.animals.remove(id).map(Row::Animal)
            }
            TableName::FeedingEvents => self.feeding_events.remove(id).map(Row::Feeding),
            TableName::EliminationEvents => {
                self.elimination_events.remove(id).map(Row::Elimination)
            }
            TableName::WeightSamples => self.weight_samples.remove(id).map(Row::Weight),
        }
    }

    fn rebuild_indexes(&mut self) {
        self.animals.rebuild_index();
        self.feeding_events.rebuild_index();
        self.elimination_events.rebuild_index();
        self.weight_samples.rebuild_index();
    }

    // --- Snapshot ---

    /// Write a snapshot atomically: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = rmp_serde::to_vec(self)?;
        let tmp_path = path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&[SNAPSHOT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a snapshot written by [`Tables::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        // Body and checksum must fit in what's left of the file.
        let available = file.metadata()?.len().saturating_sub(SNAPSHOT_HEADER_LEN + 4);
        if len > available {
            return Err(StoreError::Corruption(format!(
                "snapshot body length {len} exceeds file ({available} bytes available)"
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        let mut tables: Tables = rmp_serde::from_slice(&encoded)?;
        tables.rebuild_indexes();
        Ok(tables)
    }
}

macro_rules! table_row {
    ($ty:ty, $table:expr, $field:ident, $variant:ident, parent: $parent:expr, sort: $sort:expr) => {
        impl TableRow for $ty {
            const TABLE: TableName = $table;

            fn parent(&self) -> Option<AnimalId> {
                let f: fn(&Self) -> Option<AnimalId> = $parent;
                f(self)
            }

            fn sort_key(&self) -> Option<DateTime<Utc>> {
                let f: fn(&Self) -> Option<DateTime<Utc>> = $sort;
                f(self)
            }

            fn table(tables: &Tables) -> &Table<Self> {
                &tables.$field
            }

            fn into_row(self) -> Row {
                Row::$variant(self)
            }

            fn from_row(row: Row) -> Option<Self> {
                match row {
                    Row::$variant(r) => Some(r),
                    _ => None,
                }
            }
        }
    };
}

table_row!(Animal, TableName::Animals, animals, Animal,
    parent: |_| None, sort: |_| None);
table_row!(FeedingEvent, TableName::FeedingEvents, feeding_events, Feeding,
    parent: |r| Some(r.animal_id), sort: |r| Some(r.timestamp));
table_row!(EliminationEvent, TableName::EliminationEvents, elimination_events, Elimination,
    parent: |r| Some(r.animal_id), sort: |r| Some(r.timestamp));
table_row!(WeightSample, TableName::WeightSamples, weight_samples, Weight,
    parent: |r| Some(r.animal_id), sort: |r| Some(r.timestamp));

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn weight(animal: i64, kg: f64, minute: u32) -> WeightSample {
        WeightSample::new(AnimalId(animal), kg, "kg")
            .at(Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap())
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let mut tables = Tables::default();
        let id = tables.animals.next_id();
        tables.apply(Statement::Insert {
            id,
            row: Row::Animal(Animal::new("Rex")),
        });

        assert_eq!(id, RowId(1));
        assert_eq!(tables.animals.next_id(), RowId(2));
        assert!(tables.animal_exists(AnimalId(1)));
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Animal(Animal::new("Rex")),
        });
        tables.apply(Statement::Delete {
            table: TableName::Animals,
            id: RowId(1),
            cascade: false,
        });

        assert!(!tables.animal_exists(AnimalId(1)));
        assert_eq!(tables.animals.next_id(), RowId(2));
    }

    #[test]
    fn test_select_orders_newest_first() {
        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Weight(weight(1, 10.0, 5)),
        });
        tables.apply(Statement::Insert {
            id: RowId(2),
            row: Row::Weight(weight(1, 11.0, 30)),
        });
        tables.apply(Statement::Insert {
            id: RowId(3),
            row: Row::Weight(weight(2, 4.0, 45)),
        });

        let rows = tables.weight_samples.select(Some(AnimalId(1)));
        let ids: Vec<_> = rows.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![RowId(2), RowId(1)]);

        let all = tables.weight_samples.select(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, RowId(3));
    }

    #[test]
    fn test_update_moves_parent_index() {
        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Weight(weight(1, 10.0, 5)),
        });
        tables.apply(Statement::Update {
            id: RowId(1),
            row: Row::Weight(weight(2, 10.0, 5)),
        });

        assert_eq!(tables.weight_samples.count_children(AnimalId(1)), 0);
        assert_eq!(tables.weight_samples.count_children(AnimalId(2)), 1);
        assert_eq!(tables.dependents(AnimalId(1)), None);
        assert_eq!(
            tables.dependents(AnimalId(2)),
            Some((TableName::WeightSamples, 1))
        );
    }

    #[test]
    fn test_cascade_removes_children() {
        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Animal(Animal::new("Rex")),
        });
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Weight(weight(1, 10.0, 5)),
        });
        tables.apply(Statement::Delete {
            table: TableName::Animals,
            id: RowId(1),
            cascade: true,
        });

        assert_eq!(tables.stats(), StoreStats::default());
    }

    #[test]
    fn test_cascade_replay_without_animal_row() {
        // Snapshot already lacks the animal; the log still holds a child
        // insert followed by the cascade delete.
        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(4),
            row: Row::Weight(weight(1, 10.0, 5)),
        });
        let removed = tables.apply(Statement::Delete {
            table: TableName::Animals,
            id: RowId(1),
            cascade: true,
        });

        assert!(removed.is_none());
        assert_eq!(tables.weight_samples.count_children(AnimalId(1)), 0);
        assert!(tables.weight_samples.is_empty());
        assert_eq!(tables.weight_samples.next_id(), RowId(5));
    }

    #[test]
    fn test_snapshot_roundtrip_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.bin");

        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Animal(Animal::new("Rex").with_breed("Beagle")),
        });
        tables.apply(Statement::Insert {
            id: RowId(7),
            row: Row::Weight(weight(1, 12.5, 0)),
        });
        tables.save(&path).unwrap();

        let loaded = Tables::load(&path).unwrap();
        assert_eq!(loaded.weight_samples.count_children(AnimalId(1)), 1);
        assert_eq!(loaded.weight_samples.next_id(), RowId(8));
        assert_eq!(
            loaded.animals.get(RowId(1)).unwrap().breed.as_deref(),
            Some("Beagle")
        );
    }

    #[test]
    fn test_snapshot_checksum_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.bin");

        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Animal(Animal::new("Rex")),
        });
        tables.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Tables::load(&path),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_snapshot_length_beyond_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.bin");

        let mut tables = Tables::default();
        tables.apply(Statement::Insert {
            id: RowId(1),
            row: Row::Animal(Animal::new("Rex")),
        });
        tables.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[5..13].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Tables::load(&path),
            Err(StoreError::Corruption(_))
        ));
    }
}
