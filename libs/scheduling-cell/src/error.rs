use thiserror::Error;
use uuid::Uuid;

use crate::models::{Occurrence, OccurrenceStatus};
use crate::services::recurrence::RecurrenceError;
use crate::services::store::StoreError;

#[derive(Error, Debug)]
pub enum SchedulingError {
    /// Booking form is incomplete or inconsistent; nothing was submitted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The therapist is already booked. `conflicting` is absent when the
    /// storage layer rejected the write without telling us which row won.
    #[error("Conflicts with an existing booking: {reason}")]
    HardConflict {
        conflicting: Option<Box<Occurrence>>,
        reason: String,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),

    #[error("Occurrence not found: {0}")]
    NotFound(Uuid),

    #[error("Series not found: {0}")]
    SeriesNotFound(Uuid),

    #[error("Cannot change status from {from} to {to}")]
    InvalidStatusTransition {
        from: OccurrenceStatus,
        to: OccurrenceStatus,
    },

    #[error("A save is already in flight for {0}")]
    SaveInFlight(String),

    #[error("Invalid recurrence: {0}")]
    Recurrence(#[from] RecurrenceError),
}

impl SchedulingError {
    pub fn hard_conflict(with: &Occurrence) -> Self {
        SchedulingError::HardConflict {
            reason: format!(
                "therapist {} is booked from {} to {}",
                with.therapist_id, with.start_time, with.end_time
            ),
            conflicting: Some(Box::new(with.clone())),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulingError::HardConflict { .. })
    }
}

impl From<StoreError> for SchedulingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(reason) => SchedulingError::HardConflict {
                conflicting: None,
                reason,
            },
            StoreError::NotFound(id) => SchedulingError::NotFound(id),
            StoreError::Backend(msg) => SchedulingError::StoreFailure(msg),
        }
    }
}
