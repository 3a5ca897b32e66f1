//! Error types for the store, the repositories and the coordinator.

use crate::types::{AnimalId, RowId, TableName};
use std::time::Duration;
use thiserror::Error;

/// A write that would create or strand a dangling animal reference.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("animal {animal_id} not found (referenced from {table})")]
    MissingParent {
        table: TableName,
        animal_id: AnimalId,
    },

    #[error("animal {animal_id} still has {dependents} dependent row(s) in {table}")]
    DependentRows {
        animal_id: AnimalId,
        table: TableName,
        dependents: usize,
    },
}

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Foreign key violation: {0}")]
    ForeignKey(IntegrityViolation),

    #[error("No store connection available after {0:?}")]
    PoolTimeout(Duration),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A record field that is missing or out of range.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} must be between {min} and {max} characters")]
    Length {
        field: &'static str,
        min: usize,
        max: usize,
    },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} {value} is not a store-assigned identifier")]
    InvalidId { field: &'static str, value: i64 },
}

impl ValidationError {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Required { field }
            | ValidationError::Length { field, .. }
            | ValidationError::NotPositive { field }
            | ValidationError::InvalidId { field, .. } => field,
        }
    }
}

/// Outcome of a mutating repository call that did not succeed.
///
/// Every variant suppresses the post-mutation dispatch. `Transient` is the
/// only one a caller might reasonably retry.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{table} row {id} not found")]
    NotFound { table: TableName, id: RowId },

    #[error("referential integrity: {0}")]
    Integrity(IntegrityViolation),

    #[error("store failure: {0}")]
    Transient(#[source] StoreError),
}

impl MutationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MutationError::NotFound { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, MutationError::Integrity(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, MutationError::Validation(_))
    }
}

impl From<StoreError> for MutationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ForeignKey(violation) => MutationError::Integrity(violation),
            other => MutationError::Transient(other),
        }
    }
}

/// Result type for mutating repository operations.
pub type MutationResult<T> = std::result::Result<T, MutationError>;
