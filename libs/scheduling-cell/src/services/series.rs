// libs/scheduling-cell/src/services/series.rs
//
// What "edit" and "delete" mean against a recurring series, and how series
// members get written to the store.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::SchedulingError;
use crate::models::{
    Occurrence, OccurrenceData, OccurrenceStatus, OccurrenceType, PaymentStatus, Series, SeriesPatch, SeriesUpdate,
};
use crate::services::conflict::{Candidate, Conflict, ConflictDetector, OccurrenceIndex};
use crate::services::notification::{NotificationDispatcher, OccurrenceEvent, OccurrenceEventKind};
use crate::services::recurrence::{GeneratedSlot, RecurrenceRule};
use crate::services::store::{OccurrenceStore, SeriesStore, StoreError};

/// Converts a wall-clock instant to UTC.
pub fn to_utc(offset: FixedOffset, local: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - chrono::Duration::seconds(offset.local_minus_utc() as i64)))
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn next_day(date: NaiveDate) -> NaiveDateTime {
    day_start(date.checked_add_days(Days::new(1)).unwrap_or(date))
}

/// What a new series is made of, besides its rule.
#[derive(Debug, Clone)]
pub struct SeriesTemplate {
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub occurrence_type: OccurrenceType,
    pub notes: Option<String>,
    pub value: Option<f64>,
    pub anchor_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct SeriesCreated {
    pub series: Series,
    pub occurrences: Vec<Occurrence>,
    pub warnings: Vec<Conflict>,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesEdited {
    pub occurrences: Vec<Occurrence>,
    pub warnings: Vec<Conflict>,
}

pub struct SeriesMutationPolicy {
    occurrences: Arc<dyn OccurrenceStore>,
    series: Arc<dyn SeriesStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    detector: ConflictDetector,
    offset: FixedOffset,
}

impl SeriesMutationPolicy {
    pub fn new(
        occurrences: Arc<dyn OccurrenceStore>,
        series: Arc<dyn SeriesStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            occurrences,
            series,
            notifier,
            detector: ConflictDetector::new(),
            offset,
        }
    }

    fn member_data(series: &Series, slot: &GeneratedSlot) -> OccurrenceData {
        let offset = series.offset();
        OccurrenceData {
            therapist_id: series.therapist_id,
            patient_id: series.patient_id,
            start_time: to_utc(offset, slot.start),
            end_time: to_utc(offset, slot.end),
            occurrence_type: series.occurrence_type.clone(),
            status: OccurrenceStatus::Scheduled,
            series_id: Some(series.id),
            is_series_exception: false,
            notes: series.notes.clone(),
            value: series.value,
            payment_status: PaymentStatus::Pending,
        }
    }

    /// Generated members of `series` on dates in `[from, through]`, minus
    /// exceptions and anything at or after the cutoff.
    fn generate(&self, series: &Series, from: NaiveDate, through: NaiveDate) -> Vec<OccurrenceData> {
        series.rule
            .expand_excluding(series.anchor_date, day_start(from), next_day(through), &series.exceptions)
            .map(|slot| Self::member_data(series, &slot))
            .filter(|data| series.cutoff.map_or(true, |cutoff| data.start_time < cutoff))
            .collect()
    }

    async fn load_index(&self, planned: &[OccurrenceData]) -> Result<OccurrenceIndex, SchedulingError> {
        let (Some(first), Some(last)) = (
            planned.iter().map(|d| d.start_time).min(),
            planned.iter().map(|d| d.end_time).max(),
        ) else {
            return Ok(OccurrenceIndex::empty());
        };
        let existing = self.occurrences.list_occurrences(None, first, last).await?;
        Ok(OccurrenceIndex::new(&existing))
    }

    async fn save_series_record(&self, series: &Series) -> Result<Series, SchedulingError> {
        self.series.save_series(series).await.map_err(|e| {
            error!("Failed to save series {}: {}", series.id, e);
            SchedulingError::from(e)
        })
    }

    async fn update_series_record(&self, series_id: Uuid, update: &SeriesUpdate) -> Result<Series, SchedulingError> {
        self.series.update_series(series_id, update).await.map_err(|e| {
            error!("Failed to update series {}: {}", series_id, e);
            SchedulingError::from(e)
        })
    }

    async fn load_series(&self, series_id: Uuid) -> Result<Series, SchedulingError> {
        self.series.get_series(series_id).await?
            .ok_or(SchedulingError::SeriesNotFound(series_id))
    }

    fn notify(&self, kind: OccurrenceEventKind, occurrence: &Occurrence) {
        self.notifier.dispatch(OccurrenceEvent::for_occurrence(kind, occurrence));
    }

    /// Creates a series and writes its members through `through`.
    ///
    /// Every generated member is checked before anything is written; one
    /// hard conflict rejects the whole series.
    #[instrument(skip(self, template, rule), fields(therapist_id = %template.therapist_id))]
    pub async fn create_series(
        &self,
        template: SeriesTemplate,
        rule: RecurrenceRule,
        through: NaiveDate,
    ) -> Result<SeriesCreated, SchedulingError> {
        rule.validate(template.anchor_date)?;

        let now = Utc::now();
        let mut series = Series {
            id: Uuid::new_v4(),
            therapist_id: template.therapist_id,
            patient_id: template.patient_id,
            occurrence_type: template.occurrence_type,
            notes: template.notes,
            value: template.value,
            rule,
            anchor_date: template.anchor_date,
            exceptions: Default::default(),
            materialized_through: None,
            cutoff: None,
            utc_offset_minutes: self.offset.local_minus_utc() / 60,
            created_at: now,
            updated_at: now,
        };

        let through = through.max(template.anchor_date);
        let planned = self.generate(&series, series.anchor_date, through);
        if planned.is_empty() {
            return Err(SchedulingError::Validation(
                "recurrence rule produces no occurrences".to_string()
            ));
        }

        let index = self.load_index(&planned).await?;
        let mut warnings = Vec::new();
        for data in &planned {
            let result = self.detector.find_in_index(&Candidate::from_data(None, data), &index);
            if let Some(clash) = result.first_hard() {
                warn!("Series for therapist {} rejected: {} clashes with {}",
                      series.therapist_id, data.start_time, clash.id);
                return Err(SchedulingError::hard_conflict(clash));
            }
            warnings.extend(result.soft().cloned());
        }

        series.materialized_through = Some(through);
        let series = self.save_series_record(&series).await?;

        let mut created = Vec::with_capacity(planned.len());
        for data in planned {
            match self.occurrences.create_occurrence(data).await {
                Ok(occurrence) => created.push(occurrence),
                Err(e) => {
                    error!("Creating member of series {} failed: {}", series.id, e);
                    self.discard_partial_series(&series, &created).await;
                    return Err(e.into());
                }
            }
        }

        for occurrence in &created {
            self.notify(OccurrenceEventKind::Created, occurrence);
        }
        info!("Created series {} with {} occurrences", series.id, created.len());

        Ok(SeriesCreated { series, occurrences: created, warnings })
    }

    async fn discard_members(&self, members: &[Occurrence]) {
        for occurrence in members {
            if let Err(e) = self.occurrences.delete_occurrence(occurrence.id).await {
                error!("Could not remove series member {}: {}", occurrence.id, e);
            }
        }
    }

    async fn discard_partial_series(&self, series: &Series, created: &[Occurrence]) {
        self.discard_members(created).await;
        if let Err(e) = self.series.delete_series(series.id).await {
            error!("Could not remove partial series {}: {}", series.id, e);
        }
    }

    /// Writes members of `series` dated after `materialized_through` up to
    /// `through`. Slots that would double-book the therapist are skipped and
    /// recorded as exceptions.
    ///
    /// `series` may be an old copy. The stored record is read again before
    /// generating and before recording progress, so a truncation made in the
    /// meantime is honoured and nothing but progress is written back.
    #[instrument(skip(self, series), fields(series_id = %series.id))]
    pub async fn materialize(&self, series: &Series, through: NaiveDate) -> Result<Vec<Occurrence>, SchedulingError> {
        if !series.needs_materialization(through) {
            return Ok(Vec::new());
        }
        let Some(current) = self.series.get_series(series.id).await? else {
            warn!("Series {} no longer exists; nothing to generate", series.id);
            return Ok(Vec::new());
        };
        if !current.needs_materialization(through) {
            return Ok(Vec::new());
        }

        let from = current.materialized_through
            .and_then(|done| done.checked_add_days(Days::new(1)))
            .unwrap_or(current.anchor_date);
        let planned = self.generate(&current, from, through);
        debug!("Materializing {} occurrences of series {} for {}..={}", planned.len(), current.id, from, through);

        let index = self.load_index(&planned).await?;
        let offset = current.offset();
        let mut skipped = BTreeSet::new();
        let mut created = Vec::new();

        for data in planned {
            let local_date = data.start_time.with_timezone(&offset).date_naive();
            let result = self.detector.find_in_index(&Candidate::from_data(None, &data), &index);
            if let Some(clash) = result.first_hard() {
                warn!("Skipping {} of series {}: therapist already booked by {}", local_date, current.id, clash.id);
                skipped.insert(local_date);
                continue;
            }

            match self.occurrences.create_occurrence(data).await {
                Ok(occurrence) => created.push(occurrence),
                Err(StoreError::Conflict(reason)) => {
                    warn!("Store rejected {} of series {}: {}", local_date, current.id, reason);
                    skipped.insert(local_date);
                }
                Err(e) => {
                    // Keep what was written; the next load resumes after it.
                    if let Some(last) = created.last() {
                        let done = last.local_date(offset);
                        self.record_progress(current.id, done, skipped, &mut created).await?;
                        self.notify_created(&created);
                    }
                    return Err(e.into());
                }
            }
        }

        self.record_progress(current.id, through, skipped, &mut created).await?;
        self.notify_created(&created);
        Ok(created)
    }

    /// Stores how far generation got. Members the stored record no longer
    /// allows (it was deleted or truncated while they were being written) are
    /// removed again and dropped from `created`.
    async fn record_progress(
        &self,
        series_id: Uuid,
        through: NaiveDate,
        skipped: BTreeSet<NaiveDate>,
        created: &mut Vec<Occurrence>,
    ) -> Result<(), SchedulingError> {
        let Some(current) = self.series.get_series(series_id).await? else {
            warn!("Series {} removed while generating; discarding {} occurrences", series_id, created.len());
            self.discard_members(created).await;
            created.clear();
            return Ok(());
        };

        let mut exceptions = current.exceptions.clone();
        match current.cutoff {
            Some(cutoff) => {
                let (kept, late): (Vec<Occurrence>, Vec<Occurrence>) =
                    created.drain(..).partition(|o| o.start_time < cutoff);
                if !late.is_empty() {
                    warn!("Series {} truncated at {} while generating; removing {} occurrences", series_id, cutoff, late.len());
                    self.discard_members(&late).await;
                }
                *created = kept;
                let cutoff_date = cutoff.with_timezone(&current.offset()).date_naive();
                exceptions.extend(skipped.into_iter().filter(|date| *date < cutoff_date));
            }
            None => exceptions.extend(skipped),
        }

        let update = SeriesUpdate {
            exceptions: (exceptions != current.exceptions).then_some(exceptions),
            materialized_through: Some(current.materialized_through.map_or(through, |done| done.max(through))),
            ..Default::default()
        };
        self.update_series_record(series_id, &update).await?;
        Ok(())
    }

    fn notify_created(&self, created: &[Occurrence]) {
        for occurrence in created {
            self.notify(OccurrenceEventKind::Created, occurrence);
        }
    }

    /// Marks a series member as individually changed so series edits and
    /// later generation skip its original date.
    pub async fn detach(&self, target: &Occurrence) -> Result<(), SchedulingError> {
        let Some(series_id) = target.series_id else {
            return Ok(());
        };
        let Some(series) = self.series.get_series(series_id).await? else {
            warn!("Series {} missing while detaching occurrence {}", series_id, target.id);
            return Ok(());
        };

        // The series' own offset, so the date matches what generation produces.
        let date = target.local_date(series.offset());
        if series.exceptions.contains(&date) {
            return Ok(());
        }
        let mut exceptions = series.exceptions;
        exceptions.insert(date);
        let update = SeriesUpdate { exceptions: Some(exceptions), ..Default::default() };
        self.update_series_record(series_id, &update).await?;
        debug!("Series {} now skips {}", series_id, date);
        Ok(())
    }

    /// Applies `data` to `target` alone. A series member becomes an exception.
    #[instrument(skip(self, target, data), fields(occurrence_id = %target.id))]
    pub async fn edit_single(&self, target: &Occurrence, mut data: OccurrenceData) -> Result<Occurrence, SchedulingError> {
        data.series_id = target.series_id;
        data.is_series_exception = target.series_id.is_some();

        let updated = self.occurrences.update_occurrence(target.id, data).await?;
        if target.series_id.is_some() && !target.is_series_exception {
            self.detach(target).await?;
        }

        self.notify(OccurrenceEventKind::Updated, &updated);
        info!("Updated occurrence {}", updated.id);
        Ok(updated)
    }

    /// Rewrites every non-exception member starting at or after `target`.
    ///
    /// All rewritten members are checked first; a hard conflict rejects the
    /// edit. If the store fails midway, already rewritten members are put back.
    #[instrument(skip(self, target, patch), fields(occurrence_id = %target.id))]
    pub async fn edit_series_from(&self, target: &Occurrence, patch: SeriesPatch) -> Result<SeriesEdited, SchedulingError> {
        let series_id = target.series_id.ok_or_else(|| {
            SchedulingError::InvalidOperation(format!("occurrence {} is not part of a series", target.id))
        })?;
        if patch.is_empty() {
            return Ok(SeriesEdited::default());
        }

        let mut series = self.load_series(series_id).await?;
        let pivot = target.start_time;

        // Members up to the pivot must exist before the rule changes under them.
        let pivot_date = target.local_date(series.offset());
        if series.needs_materialization(pivot_date) {
            self.materialize(&series, pivot_date).await?;
            series = self.load_series(series_id).await?;
        }

        let members: Vec<Occurrence> = self.occurrences.list_series_occurrences(series_id, pivot).await?
            .into_iter()
            .filter(|o| !o.is_series_exception)
            .collect();

        let offset = series.offset();
        let rewritten: Vec<(Occurrence, OccurrenceData)> = members.into_iter()
            .map(|member| {
                let data = apply_patch(&member, &patch, offset);
                (member, data)
            })
            .collect();

        let planned: Vec<OccurrenceData> = rewritten.iter().map(|(_, data)| data.clone()).collect();
        let index = self.load_index(&planned).await?;
        let moving: HashSet<Uuid> = rewritten.iter().map(|(member, _)| member.id).collect();

        let mut warnings = Vec::new();
        for (member, data) in &rewritten {
            let result = self.detector.find_excluding(&Candidate::from_data(Some(member.id), data), &index, &moving);
            if let Some(clash) = result.first_hard() {
                return Err(SchedulingError::hard_conflict(clash));
            }
            warnings.extend(result.soft().cloned());
        }

        let mut applied: Vec<(Occurrence, Occurrence)> = Vec::with_capacity(rewritten.len());
        for (member, data) in rewritten {
            match self.occurrences.update_occurrence(member.id, data).await {
                Ok(updated) => applied.push((member, updated)),
                Err(e) => {
                    error!("Series edit of {} failed at {}: {}", series_id, member.id, e);
                    self.restore(&applied).await;
                    return Err(e.into());
                }
            }
        }

        let rule = (patch.start_time.is_some() || patch.duration_minutes.is_some()).then(|| {
            let mut rule = series.rule.clone();
            if let Some(start_time) = patch.start_time {
                rule.start_time = start_time;
            }
            if let Some(duration) = patch.duration_minutes {
                rule.duration_minutes = duration;
            }
            rule
        });
        let update = SeriesUpdate {
            therapist_id: patch.therapist_id,
            rule,
            notes: patch.notes.clone(),
            ..Default::default()
        };
        self.update_series_record(series_id, &update).await?;

        let occurrences: Vec<Occurrence> = applied.into_iter().map(|(_, updated)| updated).collect();
        for occurrence in &occurrences {
            self.notify(OccurrenceEventKind::Updated, occurrence);
        }
        info!("Rewrote {} occurrences of series {} from {}", occurrences.len(), series_id, pivot);

        Ok(SeriesEdited { occurrences, warnings })
    }

    async fn restore(&self, applied: &[(Occurrence, Occurrence)]) {
        for (original, _) in applied.iter().rev() {
            if let Err(e) = self.occurrences.update_occurrence(original.id, original.data()).await {
                error!("Could not restore occurrence {}: {}", original.id, e);
            }
        }
    }

    /// Deletes `target` alone. Siblings are untouched and the date is never regenerated.
    #[instrument(skip(self, target), fields(occurrence_id = %target.id))]
    pub async fn delete_single(&self, target: &Occurrence) -> Result<(), SchedulingError> {
        self.occurrences.delete_occurrence(target.id).await?;
        if target.series_id.is_some() && !target.is_series_exception {
            self.detach(target).await?;
        }

        self.notify(OccurrenceEventKind::Deleted, target);
        info!("Deleted occurrence {}", target.id);
        Ok(())
    }

    /// Deletes every member starting at or after `target`, which is itself removed.
    #[instrument(skip(self, target), fields(occurrence_id = %target.id))]
    pub async fn delete_series_from(&self, target: &Occurrence) -> Result<usize, SchedulingError> {
        let series_id = target.series_id.ok_or_else(|| {
            SchedulingError::InvalidOperation(format!("occurrence {} is not part of a series", target.id))
        })?;
        let pivot = target.start_time;

        let removed = self.occurrences.delete_occurrences_from(series_id, pivot).await?;

        match self.series.get_series(series_id).await? {
            Some(series) => {
                let pivot_date = target.local_date(series.offset());
                let update = SeriesUpdate {
                    cutoff: Some(series.cutoff.map_or(pivot, |cutoff| cutoff.min(pivot))),
                    exceptions: Some(series.exceptions.into_iter().filter(|date| *date < pivot_date).collect()),
                    ..Default::default()
                };
                self.update_series_record(series_id, &update).await?;
            }
            None => warn!("Series {} missing while truncating from {}", series_id, pivot),
        }

        self.notifier.dispatch(OccurrenceEvent::series_truncated(
            series_id, target.therapist_id, target.patient_id, pivot,
        ));
        info!("Series {} truncated from {}: {} occurrences removed", series_id, pivot, removed);
        Ok(removed)
    }
}

/// New store data for `member` with the series-level changes applied.
fn apply_patch(member: &Occurrence, patch: &SeriesPatch, offset: FixedOffset) -> OccurrenceData {
    let mut data = member.data();
    let local_start = member.start_time.with_timezone(&offset).naive_local();

    let start = match patch.start_time {
        Some(time) => local_start.date().and_time(time),
        None => local_start,
    };
    let duration = patch.duration_minutes
        .map(|m| chrono::Duration::minutes(m as i64))
        .unwrap_or_else(|| member.duration());

    data.start_time = to_utc(offset, start);
    data.end_time = data.start_time + duration;
    if let Some(therapist_id) = patch.therapist_id {
        data.therapist_id = therapist_id;
    }
    if let Some(notes) = &patch.notes {
        data.notes = notes.clone();
    }
    data
}
