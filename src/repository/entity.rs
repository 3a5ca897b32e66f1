//! Domain validation for the four record types.

use crate::database::TableRow;
use crate::error::ValidationError;
use crate::types::{
    Animal, AnimalId, EliminationEvent, EntityKind, FeedingEvent, WeightSample,
};
use serde::Serialize;

/// Longest accepted label (names, units, categories, locations).
pub const MAX_LABEL_CHARS: usize = 100;

/// Longest accepted free-form note.
pub const MAX_NOTES_CHARS: usize = 1000;

/// Shortest accepted animal name.
pub const MIN_NAME_CHARS: usize = 2;

/// A record type the repositories manage.
pub trait Entity: TableRow + Serialize {
    /// Name used in log lines.
    const NAME: &'static str;

    /// Check domain invariants. Runs before any store access.
    fn validate(&self) -> Result<(), ValidationError>;
}

/// A record owned by an animal. Mutations of these notify the owner's group.
pub trait ChildEntity: Entity {
    const KIND: EntityKind;

    fn animal_id(&self) -> AnimalId;
}

impl Entity for Animal {
    const NAME: &'static str = "animal";

    fn validate(&self) -> Result<(), ValidationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ValidationError::Required { field: "name" });
        }
        let len = name.chars().count();
        if !(MIN_NAME_CHARS..=MAX_LABEL_CHARS).contains(&len) {
            return Err(ValidationError::Length {
                field: "name",
                min: MIN_NAME_CHARS,
                max: MAX_LABEL_CHARS,
            });
        }
        optional("breed", self.breed.as_deref(), MAX_LABEL_CHARS)
    }
}

impl Entity for FeedingEvent {
    const NAME: &'static str = "feeding event";

    fn validate(&self) -> Result<(), ValidationError> {
        owner(self.animal_id)?;
        required("food_type", &self.food_type, MAX_LABEL_CHARS)?;
        if let Some(amount) = self.amount {
            positive("amount", amount)?;
        }
        optional("unit", self.unit.as_deref(), MAX_LABEL_CHARS)?;
        optional("notes", self.notes.as_deref(), MAX_NOTES_CHARS)
    }
}

impl ChildEntity for FeedingEvent {
    const KIND: EntityKind = EntityKind::Feeding;

    fn animal_id(&self) -> AnimalId {
        self.animal_id
    }
}

impl Entity for EliminationEvent {
    const NAME: &'static str = "elimination event";

    fn validate(&self) -> Result<(), ValidationError> {
        owner(self.animal_id)?;
        required("category", &self.category, MAX_LABEL_CHARS)?;
        optional("location", self.location.as_deref(), MAX_LABEL_CHARS)?;
        optional("notes", self.notes.as_deref(), MAX_NOTES_CHARS)
    }
}

impl ChildEntity for EliminationEvent {
    const KIND: EntityKind = EntityKind::Elimination;

    fn animal_id(&self) -> AnimalId {
        self.animal_id
    }
}

impl Entity for WeightSample {
    const NAME: &'static str = "weight sample";

    fn validate(&self) -> Result<(), ValidationError> {
        owner(self.animal_id)?;
        positive("weight", self.weight)?;
        required("unit", &self.unit, MAX_LABEL_CHARS)
    }
}

impl ChildEntity for WeightSample {
    const KIND: EntityKind = EntityKind::Weight;

    fn animal_id(&self) -> AnimalId {
        self.animal_id
    }
}

fn owner(animal_id: AnimalId) -> Result<(), ValidationError> {
    if animal_id.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvalidId {
            field: "animal_id",
            value: animal_id.0,
        })
    }
}

fn required(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required { field });
    }
    optional(field, Some(value), max)
}

fn optional(field: &'static str, value: Option<&str>, max: usize) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::Length { field, min: 0, max }),
        _ => Ok(()),
    }
}

// NaN and infinities fail too.
fn positive(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::NotPositive { field })
    }
}
