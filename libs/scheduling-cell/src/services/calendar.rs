// libs/scheduling-cell/src/services/calendar.rs
//
// Owns the visible week: what is loaded, what is being saved, and how the
// week is drawn. Store calls never run while the state lock is held, so a
// pending fetch or save does not stop navigation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use patient_cell::{PatientDirectory, PatientSummary};
use shared_config::CalendarSettings;
use therapist_cell::{Therapist, TherapistDirectory};

use crate::error::SchedulingError;
use crate::models::{
    DayColumn, Occurrence, OccurrenceCard, OccurrenceData, OccurrenceForm, OccurrenceStatus,
    ResourceColumn, Series, SeriesPatch, WeekView,
};
use crate::services::conflict::{Candidate, Conflict, ConflictDetector, OccurrenceIndex};
use crate::services::lifecycle::OccurrenceLifecycleService;
use crate::services::notification::{NotificationDispatcher, OccurrenceEvent, OccurrenceEventKind};
use crate::services::series::{to_utc, SeriesMutationPolicy, SeriesTemplate};
use crate::services::store::{OccurrenceStore, SeriesStore};
use crate::services::time_grid::TimeGrid;

/// Collaborators handed to the orchestrator by the process bootstrap.
#[derive(Clone)]
pub struct CalendarDependencies {
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub series: Arc<dyn SeriesStore>,
    pub therapists: Arc<dyn TherapistDirectory>,
    pub patients: Arc<dyn PatientDirectory>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    /// The window changed while the fetch was pending; the response was dropped.
    Discarded,
}

/// Result of a successful create or update.
#[derive(Debug, Clone, Default)]
pub struct SaveOutcome {
    pub occurrences: Vec<Occurrence>,
    /// Soft conflicts. The save went through.
    pub warnings: Vec<Conflict>,
    pub series: Option<Series>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SaveKey {
    Occurrence(Uuid),
    NewBooking { therapist_id: Uuid, start: DateTime<Utc> },
}

impl fmt::Display for SaveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveKey::Occurrence(id) => write!(f, "occurrence {}", id),
            SaveKey::NewBooking { therapist_id, start } => {
                write!(f, "new booking for {} at {}", therapist_id, start)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Upsert(Occurrence),
    Remove,
}

/// Identifies what a fetch was for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WindowTag {
    week_start: NaiveDate,
    therapist_filter: Option<Vec<Uuid>>,
}

#[derive(Debug)]
struct CalendarState {
    week_start: NaiveDate,
    therapist_filter: Option<Vec<Uuid>>,
    /// Last known-good occurrences of the loaded window.
    confirmed: Vec<Occurrence>,
    loaded: Option<WindowTag>,
    pending: HashMap<Uuid, Pending>,
    in_flight: HashSet<SaveKey>,
    selected: Option<Uuid>,
    therapists: Vec<Therapist>,
    patients: HashMap<Uuid, PatientSummary>,
}

impl CalendarState {
    fn tag(&self) -> WindowTag {
        WindowTag {
            week_start: self.week_start,
            therapist_filter: self.therapist_filter.clone(),
        }
    }

    /// Confirmed occurrences with optimistic changes laid over them.
    fn displayed(&self) -> Vec<Occurrence> {
        let mut shown: Vec<Occurrence> = self.confirmed.iter()
            .filter(|o| !self.pending.contains_key(&o.id))
            .cloned()
            .collect();
        shown.extend(self.pending.values().filter_map(|p| match p {
            Pending::Upsert(o) => Some(o.clone()),
            Pending::Remove => None,
        }));
        shown.sort_by_key(|o| (o.start_time, o.id));
        shown
    }

    fn confirm(&mut self, written: &[Occurrence], removed: &[Uuid], bounds: (DateTime<Utc>, DateTime<Utc>)) {
        self.confirmed.retain(|o| !removed.contains(&o.id) && !written.iter().any(|w| w.id == o.id));
        self.confirmed.extend(
            written.iter()
                .filter(|o| o.overlaps(bounds.0, bounds.1))
                .filter(|o| self.therapist_filter.as_ref().map_or(true, |ids| ids.contains(&o.therapist_id)))
                .cloned(),
        );
        self.confirmed.sort_by_key(|o| (o.start_time, o.id));
    }
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Days::new(date.weekday().num_days_from_monday() as u64)
}

struct ValidForm {
    therapist_id: Uuid,
    patient_id: Uuid,
    date: NaiveDate,
    start_time: NaiveTime,
    duration_minutes: u32,
}

fn validate_form(form: &OccurrenceForm) -> Result<ValidForm, SchedulingError> {
    let mut missing = Vec::new();
    if form.patient_id.is_none() {
        missing.push("patient");
    }
    if form.therapist_id.is_none() {
        missing.push("therapist");
    }
    if form.date.is_none() {
        missing.push("date");
    }
    if form.start_time.is_none() {
        missing.push("start time");
    }
    if form.duration_minutes.is_none() {
        missing.push("duration");
    }

    match (form.therapist_id, form.patient_id, form.date, form.start_time, form.duration_minutes) {
        (Some(therapist_id), Some(patient_id), Some(date), Some(start_time), Some(duration_minutes)) => {
            if duration_minutes == 0 {
                return Err(SchedulingError::Validation("duration must be at least one minute".to_string()));
            }
            Ok(ValidForm { therapist_id, patient_id, date, start_time, duration_minutes })
        }
        _ => Err(SchedulingError::Validation(format!("missing {}", missing.join(", ")))),
    }
}

/// Lane and lane count for each occurrence, which must be sorted by start.
/// Overlapping occurrences in one cell sit side by side.
fn lay_out_lanes(occurrences: &[&Occurrence]) -> Vec<(usize, usize)> {
    let mut placed = vec![(0, 1); occurrences.len()];
    let mut lane_ends: Vec<DateTime<Utc>> = Vec::new();
    let mut cluster_start = 0;
    let mut cluster_end: Option<DateTime<Utc>> = None;

    for (i, occurrence) in occurrences.iter().enumerate() {
        if cluster_end.map_or(false, |end| occurrence.start_time >= end) {
            for slot in &mut placed[cluster_start..i] {
                slot.1 = lane_ends.len();
            }
            lane_ends.clear();
            cluster_start = i;
        }

        let lane = match lane_ends.iter().position(|end| *end <= occurrence.start_time) {
            Some(free) => {
                lane_ends[free] = occurrence.end_time;
                free
            }
            None => {
                lane_ends.push(occurrence.end_time);
                lane_ends.len() - 1
            }
        };
        placed[i].0 = lane;
        cluster_end = Some(cluster_end.map_or(occurrence.end_time, |end| end.max(occurrence.end_time)));
    }

    let lanes = lane_ends.len().max(1);
    for slot in &mut placed[cluster_start..] {
        slot.1 = lanes;
    }
    placed
}

pub struct CalendarOrchestrator {
    occurrences: Arc<dyn OccurrenceStore>,
    series: Arc<dyn SeriesStore>,
    therapists: Arc<dyn TherapistDirectory>,
    patients: Arc<dyn PatientDirectory>,
    notifier: Arc<dyn NotificationDispatcher>,
    policy: SeriesMutationPolicy,
    detector: ConflictDetector,
    lifecycle: OccurrenceLifecycleService,
    grid: TimeGrid,
    lookahead_weeks: u32,
    offset: FixedOffset,
    state: Arc<Mutex<CalendarState>>,
}

impl CalendarOrchestrator {
    /// Builds an orchestrator showing the week containing `anchor`. Nothing is
    /// loaded until [`refresh`](Self::refresh) or a navigation.
    pub fn new(deps: CalendarDependencies, settings: &CalendarSettings, anchor: NaiveDate) -> Result<Self, SchedulingError> {
        settings.validate().map_err(SchedulingError::Validation)?;
        let offset = settings.utc_offset()
            .ok_or_else(|| SchedulingError::Validation("invalid UTC offset".to_string()))?;

        let policy = SeriesMutationPolicy::new(
            Arc::clone(&deps.occurrences),
            Arc::clone(&deps.series),
            Arc::clone(&deps.notifier),
            offset,
        );

        Ok(Self {
            occurrences: deps.occurrences,
            series: deps.series,
            therapists: deps.therapists,
            patients: deps.patients,
            notifier: deps.notifier,
            policy,
            detector: ConflictDetector::new(),
            lifecycle: OccurrenceLifecycleService::new(),
            grid: TimeGrid::new(settings),
            lookahead_weeks: settings.lookahead_weeks,
            offset,
            state: Arc::new(Mutex::new(CalendarState {
                week_start: monday_of(anchor),
                therapist_filter: None,
                confirmed: Vec::new(),
                loaded: None,
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                selected: None,
                therapists: Vec::new(),
                patients: HashMap::new(),
            })),
        })
    }

    pub async fn week_start(&self) -> NaiveDate {
        self.state.lock().await.week_start
    }

    /// UTC bounds of the week starting on `week_start`.
    fn window_bounds(&self, week_start: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = week_start.checked_add_days(Days::new(7)).unwrap_or(week_start);
        (
            to_utc(self.offset, week_start.and_time(NaiveTime::MIN)),
            to_utc(self.offset, end.and_time(NaiveTime::MIN)),
        )
    }

    /// Last date recurring series are generated through when `week_start` is shown.
    fn horizon(&self, week_start: NaiveDate) -> NaiveDate {
        let days = 7 * (self.lookahead_weeks as u64 + 1) - 1;
        week_start.checked_add_days(Days::new(days)).unwrap_or(week_start)
    }

    async fn loaded_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let week_start = self.state.lock().await.week_start;
        self.window_bounds(week_start)
    }

    /// Moves the visible week by `offset` weeks and loads it.
    pub async fn navigate_week(&self, offset: i32) -> Result<FetchOutcome, SchedulingError> {
        {
            let mut state = self.state.lock().await;
            let days = Days::new(offset.unsigned_abs() as u64 * 7);
            let moved = if offset >= 0 {
                state.week_start.checked_add_days(days)
            } else {
                state.week_start.checked_sub_days(days)
            };
            state.week_start = moved.ok_or_else(|| {
                SchedulingError::Validation(format!("cannot move {} weeks from {}", offset, state.week_start))
            })?;
            state.confirmed.clear();
            state.loaded = None;
            debug!("Navigated to week of {}", state.week_start);
        }
        self.refresh().await
    }

    pub async fn jump_to_today(&self, today: NaiveDate) -> Result<FetchOutcome, SchedulingError> {
        {
            let mut state = self.state.lock().await;
            let week_start = monday_of(today);
            if state.week_start != week_start {
                state.week_start = week_start;
                state.confirmed.clear();
                state.loaded = None;
            }
        }
        self.refresh().await
    }

    /// Limits the calendar to the given therapists (`None` shows everyone) and reloads.
    pub async fn set_therapist_filter(&self, therapist_ids: Option<Vec<Uuid>>) -> Result<FetchOutcome, SchedulingError> {
        {
            let mut state = self.state.lock().await;
            state.therapist_filter = therapist_ids;
            state.confirmed.clear();
            state.loaded = None;
        }
        self.refresh().await
    }

    /// Loads the current window, generating any recurring occurrences it needs first.
    ///
    /// If the window changed while this was waiting on the store, the
    /// response is dropped and `Discarded` returned.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<FetchOutcome, SchedulingError> {
        let (tag, need_therapists, known_patients) = {
            let state = self.state.lock().await;
            (state.tag(), state.therapists.is_empty(), state.patients.keys().copied().collect::<HashSet<_>>())
        };
        let filter = tag.therapist_filter.as_deref();
        let (start, end) = self.window_bounds(tag.week_start);

        let horizon = self.horizon(tag.week_start);
        for series in self.series.list_active_series(filter, horizon).await? {
            if let Err(e) = self.policy.materialize(&series, horizon).await {
                error!("Could not generate occurrences for series {}: {}", series.id, e);
            }
        }

        let occurrences = self.occurrences.list_occurrences(filter, start, end).await?;

        let therapists = if need_therapists {
            Some(self.therapists.list_resources().await
                .map_err(|e| SchedulingError::StoreFailure(e.to_string()))?)
        } else {
            None
        };

        let unknown: Vec<Uuid> = occurrences.iter()
            .map(|o| o.patient_id)
            .filter(|id| !known_patients.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let patients = if unknown.is_empty() {
            Vec::new()
        } else {
            self.patients.get_summaries(&unknown).await.unwrap_or_else(|e| {
                warn!("Patient summaries unavailable: {}", e);
                Vec::new()
            })
        };

        let mut state = self.state.lock().await;
        if let Some(therapists) = therapists {
            state.therapists = therapists;
        }
        for patient in patients {
            state.patients.insert(patient.id, patient);
        }

        if state.tag() != tag {
            warn!("Discarding stale occurrences for week of {}", tag.week_start);
            return Ok(FetchOutcome::Discarded);
        }

        info!("Loaded {} occurrences for week of {}", occurrences.len(), tag.week_start);
        state.confirmed = occurrences;
        state.loaded = Some(tag);
        Ok(FetchOutcome::Applied)
    }

    /// Occurrence by id, from the loaded week if possible.
    async fn find(&self, id: Uuid) -> Result<Occurrence, SchedulingError> {
        let loaded = {
            let state = self.state.lock().await;
            state.confirmed.iter().find(|o| o.id == id).cloned()
        };
        match loaded {
            Some(occurrence) => Ok(occurrence),
            None => self.occurrences.get_occurrence(id).await?
                .ok_or(SchedulingError::NotFound(id)),
        }
    }

    /// Occurrences a candidate must be checked against. The loaded week is
    /// used when it covers the candidate and every therapist; otherwise the
    /// store is asked.
    async fn conflict_index(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<OccurrenceIndex, SchedulingError> {
        let local = {
            let state = self.state.lock().await;
            let (window_start, window_end) = self.window_bounds(state.week_start);
            let covered = state.loaded.is_some()
                && state.therapist_filter.is_none()
                && window_start <= start
                && end <= window_end;
            covered.then(|| state.displayed())
        };

        match local {
            Some(shown) => Ok(OccurrenceIndex::new(&shown)),
            None => {
                debug!("Candidate outside loaded week; checking store for {}..{}", start, end);
                let existing = self.occurrences.list_occurrences(None, start, end).await?;
                Ok(OccurrenceIndex::new(&existing))
            }
        }
    }

    async fn claim(&self, key: SaveKey) -> Result<(), SchedulingError> {
        let mut state = self.state.lock().await;
        if !state.in_flight.insert(key) {
            warn!("Rejected duplicate save for {}", key);
            return Err(SchedulingError::SaveInFlight(key.to_string()));
        }
        Ok(())
    }

    async fn show_pending(&self, changes: Vec<(Uuid, Pending)>) {
        let mut state = self.state.lock().await;
        state.pending.extend(changes);
    }

    /// Ends a save. On success the written rows become confirmed; on failure
    /// only the optimistic changes are dropped, restoring the last good set.
    async fn settle(&self, key: SaveKey, pending: &[Uuid], written: &[Occurrence], removed: &[Uuid]) {
        let bounds = self.loaded_bounds().await;
        let mut state = self.state.lock().await;
        state.in_flight.remove(&key);
        for id in pending {
            state.pending.remove(id);
        }
        if !written.is_empty() || !removed.is_empty() {
            state.confirm(written, removed, bounds);
        }
    }

    /// Creates or edits an occurrence from the booking form.
    ///
    /// With `apply_to_series`, an edit rewrites this and every later member of
    /// its series. A new booking carrying a recurrence rule creates a series.
    #[instrument(skip(self, form), fields(occurrence_id = ?form.occurrence_id))]
    pub async fn create_or_update_occurrence(&self, form: OccurrenceForm, apply_to_series: bool) -> Result<SaveOutcome, SchedulingError> {
        let valid = validate_form(&form)?;
        let start = to_utc(self.offset, valid.date.and_time(valid.start_time));
        let end = start + chrono::Duration::minutes(valid.duration_minutes as i64);
        self.lifecycle.validate_timing(start, end)?;

        let existing = match form.occurrence_id {
            Some(id) => Some(self.find(id).await?),
            None => None,
        };

        match existing {
            Some(existing) if apply_to_series => self.edit_series(existing, &form, &valid).await,
            Some(existing) => self.edit_occurrence(existing, &form, &valid, start, end).await,
            None if form.recurrence.is_some() => self.create_series(&form, &valid).await,
            None if apply_to_series => Err(SchedulingError::InvalidOperation(
                "a new booking has no series to apply changes to".to_string()
            )),
            None => self.create_occurrence(&form, &valid, start, end).await,
        }
    }

    async fn check_conflicts(&self, candidate: &Candidate) -> Result<Vec<Conflict>, SchedulingError> {
        let index = self.conflict_index(candidate.start_time, candidate.end_time).await?;
        let result = self.detector.find_in_index(candidate, &index);
        if let Some(clash) = result.first_hard() {
            return Err(SchedulingError::hard_conflict(clash));
        }
        let warnings: Vec<Conflict> = result.soft().cloned().collect();
        if !warnings.is_empty() {
            warn!("Patient {} is booked elsewhere at {}", candidate.patient_id, candidate.start_time);
        }
        Ok(warnings)
    }

    async fn create_occurrence(
        &self,
        form: &OccurrenceForm,
        valid: &ValidForm,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SaveOutcome, SchedulingError> {
        let data = OccurrenceData {
            therapist_id: valid.therapist_id,
            patient_id: valid.patient_id,
            start_time: start,
            end_time: end,
            occurrence_type: form.occurrence_type.clone(),
            status: form.status.unwrap_or(OccurrenceStatus::Scheduled),
            series_id: None,
            is_series_exception: false,
            notes: form.notes.clone(),
            value: form.value,
            payment_status: form.payment_status.clone(),
        };

        let key = SaveKey::NewBooking { therapist_id: valid.therapist_id, start };
        self.claim(key).await?;

        let warnings = match self.check_conflicts(&Candidate::from_data(None, &data)).await {
            Ok(warnings) => warnings,
            Err(e) => {
                self.settle(key, &[], &[], &[]).await;
                return Err(e);
            }
        };

        let placeholder = data.clone().into_occurrence(Uuid::new_v4(), Utc::now());
        let placeholder_id = placeholder.id;
        self.show_pending(vec![(placeholder_id, Pending::Upsert(placeholder))]).await;

        match self.occurrences.create_occurrence(data).await {
            Ok(created) => {
                self.settle(key, &[placeholder_id], std::slice::from_ref(&created), &[]).await;
                self.notifier.dispatch(OccurrenceEvent::for_occurrence(OccurrenceEventKind::Created, &created));
                info!("Booked occurrence {} for therapist {}", created.id, created.therapist_id);
                Ok(SaveOutcome { occurrences: vec![created], warnings, series: None })
            }
            Err(e) => {
                error!("Booking failed: {}", e);
                self.settle(key, &[placeholder_id], &[], &[]).await;
                Err(e.into())
            }
        }
    }

    async fn edit_occurrence(
        &self,
        existing: Occurrence,
        form: &OccurrenceForm,
        valid: &ValidForm,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SaveOutcome, SchedulingError> {
        let status = form.status.unwrap_or(existing.status);
        self.lifecycle.validate_status_transition(existing.status, status)?;

        let data = OccurrenceData {
            therapist_id: valid.therapist_id,
            patient_id: valid.patient_id,
            start_time: start,
            end_time: end,
            occurrence_type: form.occurrence_type.clone(),
            status,
            series_id: existing.series_id,
            is_series_exception: existing.is_series_exception,
            notes: form.notes.clone(),
            value: form.value,
            payment_status: form.payment_status.clone(),
        };

        let key = SaveKey::Occurrence(existing.id);
        self.claim(key).await?;

        let warnings = if status.occupies_slot() {
            match self.check_conflicts(&Candidate::from_data(Some(existing.id), &data)).await {
                Ok(warnings) => warnings,
                Err(e) => {
                    self.settle(key, &[], &[], &[]).await;
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let preview = data.clone().into_occurrence(existing.id, Utc::now());
        self.show_pending(vec![(existing.id, Pending::Upsert(preview))]).await;

        match self.policy.edit_single(&existing, data).await {
            Ok(updated) => {
                self.settle(key, &[existing.id], std::slice::from_ref(&updated), &[]).await;
                Ok(SaveOutcome { occurrences: vec![updated], warnings, series: None })
            }
            Err(e) => {
                error!("Update of occurrence {} failed: {}", existing.id, e);
                self.settle(key, &[existing.id], &[], &[]).await;
                Err(e)
            }
        }
    }

    async fn edit_series(&self, existing: Occurrence, form: &OccurrenceForm, valid: &ValidForm) -> Result<SaveOutcome, SchedulingError> {
        if existing.series_id.is_none() {
            return Err(SchedulingError::InvalidOperation(
                format!("occurrence {} is not part of a series", existing.id)
            ));
        }

        let local_start = existing.start_time.with_timezone(&self.offset).naive_local();
        if valid.date != local_start.date() {
            return Err(SchedulingError::Validation(
                "a series edit cannot move occurrences to another date".to_string()
            ));
        }
        if form.status.is_some_and(|status| status != existing.status) {
            return Err(SchedulingError::Validation(
                "status changes apply to one occurrence at a time".to_string()
            ));
        }
        let per_occurrence = [
            ("patient", valid.patient_id != existing.patient_id),
            ("type", form.occurrence_type != existing.occurrence_type),
            ("value", form.value != existing.value),
            ("payment status", form.payment_status != existing.payment_status),
        ];
        if let Some((field, _)) = per_occurrence.iter().find(|(_, changed)| *changed) {
            return Err(SchedulingError::Validation(
                format!("{} changes apply to one occurrence at a time", field)
            ));
        }

        let patch = SeriesPatch {
            start_time: (valid.start_time != local_start.time()).then_some(valid.start_time),
            duration_minutes: (valid.duration_minutes as i64 != existing.duration_minutes()).then_some(valid.duration_minutes),
            notes: (form.notes != existing.notes).then(|| form.notes.clone()),
            therapist_id: (valid.therapist_id != existing.therapist_id).then_some(valid.therapist_id),
        };

        let key = SaveKey::Occurrence(existing.id);
        self.claim(key).await?;
        let result = self.policy.edit_series_from(&existing, patch).await;

        match result {
            Ok(edited) => {
                self.settle(key, &[], &edited.occurrences, &[]).await;
                Ok(SaveOutcome { occurrences: edited.occurrences, warnings: edited.warnings, series: None })
            }
            Err(e) => {
                self.settle(key, &[], &[], &[]).await;
                Err(e)
            }
        }
    }

    async fn create_series(&self, form: &OccurrenceForm, valid: &ValidForm) -> Result<SaveOutcome, SchedulingError> {
        let Some(mut rule) = form.recurrence.clone() else {
            return Err(SchedulingError::Validation("missing recurrence rule".to_string()));
        };
        rule.start_time = valid.start_time;
        rule.duration_minutes = valid.duration_minutes;

        let template = SeriesTemplate {
            therapist_id: valid.therapist_id,
            patient_id: valid.patient_id,
            occurrence_type: form.occurrence_type.clone(),
            notes: form.notes.clone(),
            value: form.value,
            anchor_date: valid.date,
        };

        let key = SaveKey::NewBooking {
            therapist_id: valid.therapist_id,
            start: to_utc(self.offset, valid.date.and_time(valid.start_time)),
        };
        self.claim(key).await?;

        let week_start = self.week_start().await;
        let through = self.horizon(week_start).max(self.horizon(monday_of(valid.date)));

        match self.policy.create_series(template, rule, through).await {
            Ok(created) => {
                self.settle(key, &[], &created.occurrences, &[]).await;
                Ok(SaveOutcome {
                    occurrences: created.occurrences,
                    warnings: created.warnings,
                    series: Some(created.series),
                })
            }
            Err(e) => {
                self.settle(key, &[], &[], &[]).await;
                Err(e)
            }
        }
    }

    /// Deletes an occurrence, or with `apply_to_series` it and every later
    /// member of its series. Returns how many occurrences were removed.
    #[instrument(skip(self))]
    pub async fn delete_occurrence(&self, id: Uuid, apply_to_series: bool) -> Result<usize, SchedulingError> {
        let target = self.find(id).await?;
        if apply_to_series && target.series_id.is_none() {
            return Err(SchedulingError::InvalidOperation(
                format!("occurrence {} is not part of a series", id)
            ));
        }

        let key = SaveKey::Occurrence(id);
        self.claim(key).await?;

        let hidden: Vec<Uuid> = if apply_to_series {
            let state = self.state.lock().await;
            state.confirmed.iter()
                .filter(|o| o.series_id == target.series_id && o.start_time >= target.start_time)
                .map(|o| o.id)
                .collect()
        } else {
            vec![id]
        };
        self.show_pending(hidden.iter().map(|id| (*id, Pending::Remove)).collect()).await;

        let result = if apply_to_series {
            self.policy.delete_series_from(&target).await
        } else {
            self.policy.delete_single(&target).await.map(|_| 1)
        };

        match result {
            Ok(removed) => {
                self.settle(key, &hidden, &[], &hidden).await;
                let mut state = self.state.lock().await;
                if state.selected.is_some_and(|selected| hidden.contains(&selected)) {
                    state.selected = None;
                }
                Ok(removed)
            }
            Err(e) => {
                error!("Delete of occurrence {} failed: {}", id, e);
                self.settle(key, &hidden, &[], &[]).await;
                Err(e)
            }
        }
    }

    /// Marks an occurrence as selected and returns it.
    pub async fn select_occurrence(&self, id: Uuid) -> Result<Occurrence, SchedulingError> {
        let occurrence = self.find(id).await?;
        self.state.lock().await.selected = Some(id);
        Ok(occurrence)
    }

    pub async fn clear_selection(&self) {
        self.state.lock().await.selected = None;
    }

    /// Moves an occurrence through its lifecycle. Canceling a series member
    /// detaches it from the series.
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: Uuid, status: OccurrenceStatus) -> Result<Occurrence, SchedulingError> {
        let target = self.find(id).await?;
        self.lifecycle.validate_status_transition(target.status, status)?;
        if target.status == status {
            return Ok(target);
        }

        let key = SaveKey::Occurrence(id);
        self.claim(key).await?;

        let mut data = target.data();
        data.status = status;
        let preview = data.clone().into_occurrence(id, Utc::now());
        self.show_pending(vec![(id, Pending::Upsert(preview))]).await;

        let result = if status == OccurrenceStatus::Canceled {
            self.policy.edit_single(&target, data).await
        } else {
            match self.occurrences.update_occurrence(id, data).await {
                Ok(updated) => {
                    self.notifier.dispatch(OccurrenceEvent::for_occurrence(OccurrenceEventKind::Updated, &updated));
                    Ok(updated)
                }
                Err(e) => Err(e.into()),
            }
        };

        match result {
            Ok(updated) => {
                self.settle(key, &[id], std::slice::from_ref(&updated), &[]).await;
                info!("Occurrence {} is now {}", id, status);
                Ok(updated)
            }
            Err(e) => {
                error!("Status change of occurrence {} failed: {}", id, e);
                self.settle(key, &[id], &[], &[]).await;
                Err(e)
            }
        }
    }

    /// Occurrences currently shown, optimistic changes included.
    pub async fn occurrences(&self) -> Vec<Occurrence> {
        self.state.lock().await.displayed()
    }

    /// Double bookings among the shown occurrences.
    pub async fn audit(&self) -> Vec<(Occurrence, Occurrence)> {
        let shown = self.occurrences().await;
        self.detector.audit(&shown)
    }

    /// Therapists x days x positioned cards for the visible week.
    pub async fn view(&self) -> WeekView {
        let state = self.state.lock().await;
        let shown = state.displayed();
        let days: Vec<NaiveDate> = (0..7)
            .filter_map(|d| state.week_start.checked_add_days(Days::new(d)))
            .collect();

        let columns = state.therapists.iter()
            .filter(|t| state.therapist_filter.as_ref().map_or(true, |ids| ids.contains(&t.id)))
            .map(|therapist| ResourceColumn {
                therapist: therapist.clone(),
                days: days.iter()
                    .map(|day| DayColumn {
                        date: *day,
                        cards: self.cards_for(&state, &shown, therapist, *day),
                    })
                    .collect(),
            })
            .collect();

        WeekView {
            week_start: state.week_start,
            days,
            hour_labels: self.grid.hour_labels(),
            grid_height_px: self.grid.total_height_px(),
            columns,
            selected_occurrence_id: state.selected,
            saving: !state.in_flight.is_empty(),
        }
    }

    fn cards_for(&self, state: &CalendarState, shown: &[Occurrence], therapist: &Therapist, day: NaiveDate) -> Vec<OccurrenceCard> {
        let in_cell: Vec<&Occurrence> = shown.iter()
            .filter(|o| o.therapist_id == therapist.id && o.local_date(self.offset) == day)
            .collect();

        lay_out_lanes(&in_cell).into_iter()
            .zip(in_cell)
            .map(|((lane, lane_count), occurrence)| {
                let placement = self.grid.place(
                    day,
                    occurrence.start_time.with_timezone(&self.offset).naive_local(),
                    occurrence.end_time.with_timezone(&self.offset).naive_local(),
                );
                OccurrenceCard {
                    occurrence_id: occurrence.id,
                    patient_id: occurrence.patient_id,
                    patient: state.patients.get(&occurrence.patient_id).cloned(),
                    start_time: occurrence.start_time,
                    end_time: occurrence.end_time,
                    top_px: placement.top_px,
                    height_px: placement.height_px,
                    clipped_top: placement.clipped_top,
                    clipped_bottom: placement.clipped_bottom,
                    lane,
                    lane_count,
                    color: therapist.color.clone(),
                    status: occurrence.status,
                    occurrence_type: occurrence.occurrence_type.clone(),
                    series_state: occurrence.series_state(),
                    pending: state.pending.contains_key(&occurrence.id),
                }
            })
            .collect()
    }
}
