//! Core types for the care-record store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Store-assigned row identifier. Valid identifiers are strictly positive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub i64);

impl RowId {
    /// Whether this id could have been issued by the store.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an Animal row, used as a foreign key and as a group key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnimalId(pub i64);

impl AnimalId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl From<RowId> for AnimalId {
    fn from(id: RowId) -> Self {
        AnimalId(id.0)
    }
}

impl From<AnimalId> for RowId {
    fn from(id: AnimalId) -> Self {
        RowId(id.0)
    }
}

impl fmt::Debug for AnimalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnimalId({})", self.0)
    }
}

impl fmt::Display for AnimalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The four tables of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Animals,
    FeedingEvents,
    EliminationEvents,
    WeightSamples,
}

impl TableName {
    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Animals => "animals",
            TableName::FeedingEvents => "feeding_events",
            TableName::EliminationEvents => "elimination_events",
            TableName::WeightSamples => "weight_samples",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of child record changed, carried by update notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Feeding,
    Elimination,
    Weight,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Feeding => "feeding",
            EntityKind::Elimination => "elimination",
            EntityKind::Weight => "weight",
        };
        f.write_str(name)
    }
}

/// An animal's profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Animal {
    /// Display name, 2 to 100 characters.
    pub name: String,
    pub breed: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

impl Animal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breed: None,
            date_of_birth: None,
        }
    }

    pub fn with_breed(mut self, breed: impl Into<String>) -> Self {
        self.breed = Some(breed.into());
        self
    }

    pub fn with_date_of_birth(mut self, date: NaiveDate) -> Self {
        self.date_of_birth = Some(date);
        self
    }
}

/// One meal or snack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedingEvent {
    pub animal_id: AnimalId,
    pub timestamp: DateTime<Utc>,
    pub food_type: String,
    pub amount: Option<f64>,
    /// e.g. "grams", "cups".
    pub unit: Option<String>,
    pub notes: Option<String>,
}

impl FeedingEvent {
    pub fn new(animal_id: AnimalId, food_type: impl Into<String>) -> Self {
        Self {
            animal_id,
            timestamp: Utc::now(),
            food_type: food_type.into(),
            amount: None,
            unit: None,
            notes: None,
        }
    }

    pub fn with_amount(mut self, amount: f64, unit: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.unit = Some(unit.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A toilet event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EliminationEvent {
    pub animal_id: AnimalId,
    pub timestamp: DateTime<Utc>,
    /// e.g. "Pee", "Poop", "Both".
    pub category: String,
    /// e.g. "Indoors", "Garden", "Walk".
    pub location: Option<String>,
    pub notes: Option<String>,
}

impl EliminationEvent {
    pub fn new(animal_id: AnimalId, category: impl Into<String>) -> Self {
        Self {
            animal_id,
            timestamp: Utc::now(),
            category: category.into(),
            location: None,
            notes: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A weight measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSample {
    pub animal_id: AnimalId,
    pub timestamp: DateTime<Utc>,
    pub weight: f64,
    /// e.g. "kg", "lbs".
    pub unit: String,
}

impl WeightSample {
    pub fn new(animal_id: AnimalId, weight: f64, unit: impl Into<String>) -> Self {
        Self {
            animal_id,
            timestamp: Utc::now(),
            weight,
            unit: unit.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A persisted record together with its store-assigned id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: RowId,
    pub record: T,
}

/// Row counts and log size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub animals: usize,
    pub feeding_events: usize,
    pub elimination_events: usize,
    pub weight_samples: usize,
    /// Statements logged since the last checkpoint.
    pub wal_entries: u64,
}
