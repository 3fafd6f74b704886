// libs/scheduling-cell/src/services/lifecycle.rs
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::SchedulingError;
use crate::models::OccurrenceStatus;

pub struct OccurrenceLifecycleService;

impl OccurrenceLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed
    pub fn validate_status_transition(
        &self,
        current_status: OccurrenceStatus,
        new_status: OccurrenceStatus,
    ) -> Result<(), SchedulingError> {
        if current_status == new_status {
            return Ok(());
        }
        debug!("Validating status transition from {} to {}", current_status, new_status);

        if !self.get_valid_transitions(current_status).contains(&new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(SchedulingError::InvalidStatusTransition {
                from: current_status,
                to: new_status,
            });
        }

        Ok(())
    }

    /// Get all valid next statuses for a given current status
    pub fn get_valid_transitions(&self, current_status: OccurrenceStatus) -> Vec<OccurrenceStatus> {
        match current_status {
            OccurrenceStatus::Scheduled => vec![
                OccurrenceStatus::Completed,
                OccurrenceStatus::Canceled,
                OccurrenceStatus::NoShow,
            ],
            // Terminal states - no transitions allowed
            OccurrenceStatus::Completed
            | OccurrenceStatus::Canceled
            | OccurrenceStatus::NoShow => vec![],
        }
    }

    /// Validate appointment timing constraints
    pub fn validate_timing(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), SchedulingError> {
        if end_time <= start_time {
            return Err(SchedulingError::Validation(format!(
                "end time {} must be after start time {}", end_time, start_time
            )));
        }
        if end_time - start_time > Duration::hours(24) {
            return Err(SchedulingError::Validation(
                "an occurrence cannot last longer than a day".to_string()
            ));
        }
        Ok(())
    }
}

impl Default for OccurrenceLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn scheduled_can_reach_every_terminal_state() {
        let lifecycle = OccurrenceLifecycleService::new();
        for next in [OccurrenceStatus::Completed, OccurrenceStatus::Canceled, OccurrenceStatus::NoShow] {
            assert!(lifecycle.validate_status_transition(OccurrenceStatus::Scheduled, next).is_ok());
        }
    }

    #[test]
    fn terminal_states_are_final() {
        let lifecycle = OccurrenceLifecycleService::new();
        assert_matches!(
            lifecycle.validate_status_transition(OccurrenceStatus::Canceled, OccurrenceStatus::Scheduled),
            Err(SchedulingError::InvalidStatusTransition { from: OccurrenceStatus::Canceled, .. })
        );
        assert!(lifecycle.validate_status_transition(OccurrenceStatus::Completed, OccurrenceStatus::NoShow).is_err());
    }

    #[test]
    fn unchanged_status_is_not_a_transition() {
        let lifecycle = OccurrenceLifecycleService::new();
        assert!(lifecycle.validate_status_transition(OccurrenceStatus::NoShow, OccurrenceStatus::NoShow).is_ok());
    }

    #[test]
    fn end_must_follow_start() {
        let lifecycle = OccurrenceLifecycleService::new();
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        assert_matches!(lifecycle.validate_timing(start, start), Err(SchedulingError::Validation(_)));
        assert!(lifecycle.validate_timing(start, start + Duration::minutes(50)).is_ok());
    }
}
