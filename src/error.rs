//! Error types for the dose reminder core.
//!
//! `DoseError` is what callers of the scheduler see. Store and notifier
//! failures have their own enums so adapters can be swapped without touching
//! the state machine.

use thiserror::Error;

use crate::db::models::{DoseOutcome, DoseStatus};
use crate::reminder::state::Trigger;

#[derive(Error, Debug)]
pub enum DoseError {
    /// The trigger does not apply to the record's current status (or a timeout
    /// trigger fired before it was due). Nothing was mutated.
    #[error("{trigger} is not valid for dose {dose_id} in status {}", status.as_str())]
    InvalidTransition {
        dose_id: String,
        status: DoseStatus,
        trigger: Trigger,
    },

    #[error("dose {0} not found")]
    NotFound(String),

    #[error("dose store error: {0}")]
    Store(#[from] StoreError),

    /// The medication plan could not be expanded into dose records.
    #[error("invalid medication plan: {0}")]
    InvalidPlan(#[source] anyhow::Error),
}

impl DoseError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, DoseError::InvalidTransition { .. })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("dose {0} not found")]
    NotFound(String),

    #[error("dose {0} already exists")]
    Duplicate(String),

    /// Compare-and-set failed: another writer committed first.
    #[error("stale write for dose {dose_id}: expected revision {expected}, found {found}")]
    Conflict {
        dose_id: String,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    /// Delivery was attempted and failed. The (dose, outcome) claim is kept,
    /// so the message is never retried.
    #[error("caregiver notification {} for dose {dose_id} failed: {source}", outcome.as_str())]
    DeliveryFailed {
        dose_id: String,
        outcome: DoseOutcome,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
