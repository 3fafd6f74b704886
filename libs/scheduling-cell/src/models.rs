// libs/scheduling-cell/src/models.rs
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use patient_cell::PatientSummary;
use therapist_cell::Therapist;

use crate::services::recurrence::RecurrenceRule;

// ==============================================================================
// OCCURRENCE MODELS
// ==============================================================================

/// One concrete, time-bound appointment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Occurrence {
    pub id: Uuid,
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub occurrence_type: OccurrenceType,
    pub status: OccurrenceStatus,
    pub series_id: Option<Uuid>,
    /// Set once a series member has been edited or cancelled on its own.
    #[serde(default)]
    pub is_series_exception: bool,
    pub notes: Option<String>,
    pub value: Option<f64>,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Occurrence {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration().num_minutes()
    }

    /// Half-open interval overlap.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && start < self.end_time
    }

    /// Whether this occurrence still holds its slot.
    pub fn occupies_slot(&self) -> bool {
        self.status.occupies_slot()
    }

    pub fn series_state(&self) -> SeriesState {
        match (self.series_id, self.is_series_exception) {
            (None, _) => SeriesState::Standalone,
            (Some(_), false) => SeriesState::SeriesMember,
            (Some(_), true) => SeriesState::SeriesException,
        }
    }

    /// Calendar date of the start on the clinic's wall clock.
    pub fn local_date(&self, offset: FixedOffset) -> NaiveDate {
        self.start_time.with_timezone(&offset).date_naive()
    }

    pub fn data(&self) -> OccurrenceData {
        OccurrenceData {
            therapist_id: self.therapist_id,
            patient_id: self.patient_id,
            start_time: self.start_time,
            end_time: self.end_time,
            occurrence_type: self.occurrence_type.clone(),
            status: self.status,
            series_id: self.series_id,
            is_series_exception: self.is_series_exception,
            notes: self.notes.clone(),
            value: self.value,
            payment_status: self.payment_status.clone(),
        }
    }
}

/// The writable fields of an occurrence, as sent to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccurrenceData {
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub occurrence_type: OccurrenceType,
    pub status: OccurrenceStatus,
    pub series_id: Option<Uuid>,
    pub is_series_exception: bool,
    pub notes: Option<String>,
    pub value: Option<f64>,
    pub payment_status: PaymentStatus,
}

impl OccurrenceData {
    pub fn into_occurrence(self, id: Uuid, now: DateTime<Utc>) -> Occurrence {
        Occurrence {
            id,
            therapist_id: self.therapist_id,
            patient_id: self.patient_id,
            start_time: self.start_time,
            end_time: self.end_time,
            occurrence_type: self.occurrence_type,
            status: self.status,
            series_id: self.series_id,
            is_series_exception: self.is_series_exception,
            notes: self.notes,
            value: self.value,
            payment_status: self.payment_status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Scheduled,
    Completed,
    Canceled,
    NoShow,
}

impl OccurrenceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OccurrenceStatus::Scheduled)
    }

    /// Canceled and no-show occurrences free their slot for new bookings.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, OccurrenceStatus::Scheduled | OccurrenceStatus::Completed)
    }
}

impl fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OccurrenceStatus::Scheduled => write!(f, "scheduled"),
            OccurrenceStatus::Completed => write!(f, "completed"),
            OccurrenceStatus::Canceled => write!(f, "canceled"),
            OccurrenceStatus::NoShow => write!(f, "no_show"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceType {
    #[serde(alias = "therapy", alias = "sessao")]
    Session,
    #[serde(alias = "assessment")]
    Evaluation,
    #[serde(alias = "telehealth", alias = "online")]
    Teleconsultation,
    #[serde(alias = "follow_up")]
    Return,
    GroupSession,
}

impl Default for OccurrenceType {
    fn default() -> Self {
        OccurrenceType::Session
    }
}

impl fmt::Display for OccurrenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OccurrenceType::Session => write!(f, "session"),
            OccurrenceType::Evaluation => write!(f, "evaluation"),
            OccurrenceType::Teleconsultation => write!(f, "teleconsultation"),
            OccurrenceType::Return => write!(f, "return"),
            OccurrenceType::GroupSession => write!(f, "group_session"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Exempt,
}

/// Relationship of an occurrence to a recurring series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeriesState {
    Standalone,
    SeriesMember,
    SeriesException,
}

// ==============================================================================
// SERIES MODELS
// ==============================================================================

/// Generation parameters of a recurring series. Occurrences are materialized
/// from it and linked back through `series_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Series {
    pub id: Uuid,
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub occurrence_type: OccurrenceType,
    pub notes: Option<String>,
    pub value: Option<f64>,
    pub rule: RecurrenceRule,
    pub anchor_date: NaiveDate,
    /// Original dates of members detached by an individual edit, cancel or delete.
    #[serde(default)]
    pub exceptions: BTreeSet<NaiveDate>,
    /// Last date for which occurrences have been written to the store.
    pub materialized_through: Option<NaiveDate>,
    /// Nothing starting at or after this instant is generated.
    pub cutoff: Option<DateTime<Utc>>,
    pub utc_offset_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn needs_materialization(&self, through: NaiveDate) -> bool {
        self.materialized_through.map_or(true, |done| done < through)
    }
}

/// Fields of a stored series to overwrite. Anything left `None` keeps its
/// stored value, so concurrent writers only touch what they changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SeriesUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub therapist_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RecurrenceRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<BTreeSet<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materialized_through: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<DateTime<Utc>>,
}

impl SeriesUpdate {
    pub fn apply_to(&self, series: &mut Series) {
        if let Some(therapist_id) = self.therapist_id {
            series.therapist_id = therapist_id;
        }
        if let Some(rule) = &self.rule {
            series.rule = rule.clone();
        }
        if let Some(notes) = &self.notes {
            series.notes = notes.clone();
        }
        if let Some(exceptions) = &self.exceptions {
            series.exceptions = exceptions.clone();
        }
        if self.materialized_through.is_some() {
            series.materialized_through = self.materialized_through;
        }
        if self.cutoff.is_some() {
            series.cutoff = self.cutoff;
        }
    }
}

// ==============================================================================
// COMMAND MODELS
// ==============================================================================

/// Booking form as submitted by the calendar. Dates and times are on the
/// clinic's wall clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OccurrenceForm {
    /// Present when editing an existing occurrence.
    pub occurrence_id: Option<Uuid>,
    pub therapist_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub occurrence_type: OccurrenceType,
    pub status: Option<OccurrenceStatus>,
    pub notes: Option<String>,
    pub value: Option<f64>,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    /// Turns a new booking into a recurring series.
    pub recurrence: Option<RecurrenceRule>,
}

/// Parameters rewritten by a "this and all following" series edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SeriesPatch {
    pub start_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    /// `Some(None)` clears the notes.
    pub notes: Option<Option<String>>,
    pub therapist_id: Option<Uuid>,
}

impl SeriesPatch {
    pub fn is_empty(&self) -> bool {
        self.start_time.is_none()
            && self.duration_minutes.is_none()
            && self.notes.is_none()
            && self.therapist_id.is_none()
    }
}

// ==============================================================================
// VIEW MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeekView {
    pub week_start: NaiveDate,
    pub days: Vec<NaiveDate>,
    pub hour_labels: Vec<String>,
    pub grid_height_px: f32,
    pub columns: Vec<ResourceColumn>,
    pub selected_occurrence_id: Option<Uuid>,
    /// True while a save for some occurrence is still in flight.
    pub saving: bool,
}

impl WeekView {
    pub fn cards(&self) -> impl Iterator<Item = &OccurrenceCard> {
        self.columns.iter()
            .flat_map(|column| column.days.iter())
            .flat_map(|day| day.cards.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceColumn {
    pub therapist: Therapist,
    pub days: Vec<DayColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayColumn {
    pub date: NaiveDate,
    pub cards: Vec<OccurrenceCard>,
}

/// A positioned occurrence inside one resource/day cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccurrenceCard {
    pub occurrence_id: Uuid,
    pub patient_id: Uuid,
    pub patient: Option<PatientSummary>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub top_px: f32,
    pub height_px: f32,
    pub clipped_top: bool,
    pub clipped_bottom: bool,
    /// Horizontal lane among overlapping cards in the same cell.
    pub lane: usize,
    pub lane_count: usize,
    pub color: String,
    pub status: OccurrenceStatus,
    pub occurrence_type: OccurrenceType,
    pub series_state: SeriesState,
    /// Shown optimistically; not yet confirmed by the store.
    pub pending: bool,
}
