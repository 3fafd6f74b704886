use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Occurrence, OccurrenceData};

/// The booking being checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Set when the candidate is an edit of an existing occurrence.
    pub occurrence_id: Option<Uuid>,
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Candidate {
    pub fn from_data(occurrence_id: Option<Uuid>, data: &OccurrenceData) -> Self {
        Self {
            occurrence_id,
            therapist_id: data.therapist_id,
            patient_id: data.patient_id,
            start_time: data.start_time,
            end_time: data.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same therapist, overlapping time. Blocks the save.
    Hard,
    /// Same patient with another therapist, overlapping time. Warn only.
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub occurrence: Occurrence,
}

/// Conflicts ranked hard first, then by earliest start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConflictResult {
    pub conflicts: Vec<Conflict>,
}

impl ConflictResult {
    pub fn is_clear(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn is_blocking(&self) -> bool {
        self.first_hard().is_some()
    }

    pub fn first(&self) -> Option<&Conflict> {
        self.conflicts.first()
    }

    pub fn first_hard(&self) -> Option<&Occurrence> {
        self.conflicts.iter()
            .find(|c| c.kind == ConflictKind::Hard)
            .map(|c| &c.occurrence)
    }

    pub fn soft(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.kind == ConflictKind::Soft)
    }
}

/// Slot-holding occurrences sorted by start, for range lookups.
///
/// A lookup for `[start, end)` only has to look at entries starting in
/// `(start - longest_duration, end)`, found by binary search.
#[derive(Debug, Clone)]
pub struct OccurrenceIndex {
    by_start: Vec<Occurrence>,
    longest: Duration,
}

impl OccurrenceIndex {
    pub fn new<'a>(occurrences: impl IntoIterator<Item = &'a Occurrence>) -> Self {
        let mut by_start: Vec<Occurrence> = occurrences.into_iter()
            .filter(|o| o.occupies_slot())
            .cloned()
            .collect();
        by_start.sort_by_key(|o| (o.start_time, o.id));

        let longest = by_start.iter()
            .map(Occurrence::duration)
            .max()
            .unwrap_or_else(Duration::zero);

        Self { by_start, longest }
    }

    pub fn empty() -> Self {
        Self { by_start: Vec::new(), longest: Duration::zero() }
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Entries whose `[start, end)` overlaps the given interval, in start order.
    pub fn overlapping(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = &Occurrence> {
        let earliest = start - self.longest;
        let lo = self.by_start.partition_point(|o| o.start_time <= earliest);
        let hi = self.by_start.partition_point(|o| o.start_time < end);

        self.by_start[lo..hi.max(lo)].iter()
            .filter(move |o| o.overlaps(start, end))
    }
}

pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Checks `candidate` against `existing`. Convenience over [`find_in_index`](Self::find_in_index).
    pub fn find_conflicts(&self, candidate: &Candidate, existing: &[Occurrence]) -> ConflictResult {
        self.find_in_index(candidate, &OccurrenceIndex::new(existing))
    }

    pub fn find_in_index(&self, candidate: &Candidate, index: &OccurrenceIndex) -> ConflictResult {
        self.find_excluding(candidate, index, &HashSet::new())
    }

    /// Like [`find_in_index`](Self::find_in_index), ignoring the listed ids
    /// (used when a group of occurrences moves together).
    pub fn find_excluding(&self, candidate: &Candidate, index: &OccurrenceIndex, ignore: &HashSet<Uuid>) -> ConflictResult {
        debug!("Checking conflicts for therapist {} from {} to {}",
               candidate.therapist_id, candidate.start_time, candidate.end_time);

        let mut conflicts: Vec<Conflict> = index
            .overlapping(candidate.start_time, candidate.end_time)
            .filter(|o| Some(o.id) != candidate.occurrence_id && !ignore.contains(&o.id))
            .filter_map(|o| {
                let kind = if o.therapist_id == candidate.therapist_id {
                    ConflictKind::Hard
                } else if o.patient_id == candidate.patient_id {
                    ConflictKind::Soft
                } else {
                    return None;
                };
                Some(Conflict { kind, occurrence: o.clone() })
            })
            .collect();

        conflicts.sort_by_key(|c| (c.kind, c.occurrence.start_time));

        if let Some(hard) = conflicts.first().filter(|c| c.kind == ConflictKind::Hard) {
            warn!("Hard conflict for therapist {} with occurrence {}",
                  candidate.therapist_id, hard.occurrence.id);
        }

        ConflictResult { conflicts }
    }

    /// Every pair of slot-holding occurrences that double-books a therapist.
    /// Sweeps each therapist's occurrences in start order.
    pub fn audit(&self, occurrences: &[Occurrence]) -> Vec<(Occurrence, Occurrence)> {
        let mut active: Vec<&Occurrence> = occurrences.iter()
            .filter(|o| o.occupies_slot())
            .collect();
        active.sort_by_key(|o| (o.therapist_id, o.start_time, o.id));

        let mut pairs = Vec::new();
        let mut open: Vec<&Occurrence> = Vec::new();

        for occurrence in active {
            open.retain(|o| o.therapist_id == occurrence.therapist_id && o.end_time > occurrence.start_time);
            for earlier in &open {
                pairs.push(((*earlier).clone(), occurrence.clone()));
            }
            open.push(occurrence);
        }

        if !pairs.is_empty() {
            warn!("Consistency audit found {} double bookings", pairs.len());
        }
        pairs
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::models::{OccurrenceStatus, OccurrenceType, PaymentStatus};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    fn booking(therapist: Uuid, patient: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Occurrence {
        Occurrence {
            id: Uuid::new_v4(),
            therapist_id: therapist,
            patient_id: patient,
            start_time: start,
            end_time: end,
            occurrence_type: OccurrenceType::Session,
            status: OccurrenceStatus::Scheduled,
            series_id: None,
            is_series_exception: false,
            notes: None,
            value: None,
            payment_status: PaymentStatus::Pending,
            created_at: start,
            updated_at: start,
        }
    }

    fn candidate(therapist: Uuid, patient: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Candidate {
        Candidate { occurrence_id: None, therapist_id: therapist, patient_id: patient, start_time: start, end_time: end }
    }

    #[test]
    fn overlapping_booking_for_same_therapist_is_hard() {
        let therapist = Uuid::new_v4();
        let existing = booking(therapist, Uuid::new_v4(), at(10, 30), at(11, 30));

        let result = ConflictDetector::new()
            .find_conflicts(&candidate(therapist, Uuid::new_v4(), at(10, 0), at(11, 0)), &[existing.clone()]);

        assert!(result.is_blocking());
        assert_eq!(result.first_hard(), Some(&existing));
    }

    #[test]
    fn touching_intervals_do_not_conflict() {
        let therapist = Uuid::new_v4();
        let existing = booking(therapist, Uuid::new_v4(), at(11, 0), at(12, 0));

        let result = ConflictDetector::new()
            .find_conflicts(&candidate(therapist, Uuid::new_v4(), at(10, 0), at(11, 0)), &[existing]);
        assert!(result.is_clear());
    }

    #[test]
    fn freed_slots_are_bookable() {
        let therapist = Uuid::new_v4();
        let mut canceled = booking(therapist, Uuid::new_v4(), at(10, 0), at(11, 0));
        canceled.status = OccurrenceStatus::Canceled;
        let mut no_show = booking(therapist, Uuid::new_v4(), at(10, 0), at(11, 0));
        no_show.status = OccurrenceStatus::NoShow;

        let result = ConflictDetector::new()
            .find_conflicts(&candidate(therapist, Uuid::new_v4(), at(10, 0), at(11, 0)), &[canceled, no_show]);
        assert!(result.is_clear());
    }

    #[test]
    fn same_patient_elsewhere_is_soft() {
        let patient = Uuid::new_v4();
        let elsewhere = booking(Uuid::new_v4(), patient, at(10, 15), at(10, 45));

        let result = ConflictDetector::new()
            .find_conflicts(&candidate(Uuid::new_v4(), patient, at(10, 0), at(11, 0)), &[elsewhere]);
        assert!(!result.is_blocking());
        assert_eq!(result.soft().count(), 1);
    }

    #[test]
    fn editing_does_not_conflict_with_itself() {
        let therapist = Uuid::new_v4();
        let existing = booking(therapist, Uuid::new_v4(), at(10, 0), at(11, 0));
        let mut moved = candidate(therapist, existing.patient_id, at(10, 30), at(11, 30));
        moved.occurrence_id = Some(existing.id);

        assert!(ConflictDetector::new().find_conflicts(&moved, &[existing]).is_clear());
    }

    #[test]
    fn ranking_puts_hard_first_then_earliest() {
        let therapist = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let soft_early = booking(Uuid::new_v4(), patient, at(9, 0), at(12, 0));
        let hard_late = booking(therapist, Uuid::new_v4(), at(10, 45), at(11, 15));
        let hard_early = booking(therapist, Uuid::new_v4(), at(9, 30), at(10, 15));

        let result = ConflictDetector::new().find_conflicts(
            &candidate(therapist, patient, at(10, 0), at(11, 0)),
            &[soft_early.clone(), hard_late.clone(), hard_early.clone()],
        );

        let order: Vec<Uuid> = result.conflicts.iter().map(|c| c.occurrence.id).collect();
        assert_eq!(order, vec![hard_early.id, hard_late.id, soft_early.id]);
    }

    #[test]
    fn index_finds_long_occurrences_that_started_earlier() {
        let therapist = Uuid::new_v4();
        let all_day = booking(therapist, Uuid::new_v4(), at(7, 0), at(19, 0));
        let short = booking(therapist, Uuid::new_v4(), at(8, 0), at(8, 30));
        let index = OccurrenceIndex::new([&all_day, &short]);

        let hits: Vec<_> = index.overlapping(at(15, 0), at(16, 0)).collect();
        assert_eq!(hits, vec![&all_day]);
    }

    #[test]
    fn audit_reports_every_double_booking() {
        let therapist = Uuid::new_v4();
        let a = booking(therapist, Uuid::new_v4(), at(9, 0), at(10, 0));
        let b = booking(therapist, Uuid::new_v4(), at(9, 30), at(10, 30));
        let c = booking(therapist, Uuid::new_v4(), at(10, 0), at(11, 0));
        let other = booking(Uuid::new_v4(), Uuid::new_v4(), at(9, 0), at(10, 0));

        let pairs = ConflictDetector::new().audit(&[a.clone(), b.clone(), c.clone(), other]);
        let ids: Vec<(Uuid, Uuid)> = pairs.iter().map(|(x, y)| (x.id, y.id)).collect();
        assert_eq!(ids, vec![(a.id, b.id), (b.id, c.id)]);
    }
}
