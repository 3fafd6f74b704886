//! Storage seams for occurrences and series.
//!
//! The orchestrator and the series policy only see these traits; the process
//! bootstrap decides which implementation backs them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Occurrence, OccurrenceData, Series, SeriesUpdate};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store refused the write because it would double-book a therapist.
    #[error("booking rejected by storage constraint: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(Uuid),

    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// Occurrences overlapping `[range_start, range_end)`, optionally limited to some therapists.
    async fn list_occurrences(
        &self,
        therapist_ids: Option<&[Uuid]>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError>;

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError>;

    /// Members of a series starting at or after `from`, in start order.
    async fn list_series_occurrences(&self, series_id: Uuid, from: DateTime<Utc>) -> Result<Vec<Occurrence>, StoreError>;

    async fn create_occurrence(&self, data: OccurrenceData) -> Result<Occurrence, StoreError>;

    async fn update_occurrence(&self, id: Uuid, data: OccurrenceData) -> Result<Occurrence, StoreError>;

    async fn delete_occurrence(&self, id: Uuid) -> Result<(), StoreError>;

    /// Removes every member of `series_id` starting at or after `pivot`. Returns how many went.
    async fn delete_occurrences_from(&self, series_id: Uuid, pivot: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SeriesStore: Send + Sync {
    async fn get_series(&self, id: Uuid) -> Result<Option<Series>, StoreError>;

    /// Insert or replace.
    async fn save_series(&self, series: &Series) -> Result<Series, StoreError>;

    /// Overwrites only the fields set in `update`.
    async fn update_series(&self, id: Uuid, update: &SeriesUpdate) -> Result<Series, StoreError>;

    async fn delete_series(&self, id: Uuid) -> Result<(), StoreError>;

    /// Series of the given therapists that may still generate occurrences
    /// on or before `through`.
    async fn list_active_series(&self, therapist_ids: Option<&[Uuid]>, through: NaiveDate) -> Result<Vec<Series>, StoreError>;
}

fn therapist_matches(filter: Option<&[Uuid]>, therapist_id: Uuid) -> bool {
    filter.map_or(true, |ids| ids.contains(&therapist_id))
}

/// Occurrence store held in memory, for local runs and tests.
///
/// With `with_exclusion_constraint` it rejects writes that double-book a
/// therapist, the way the database constraint does.
#[derive(Default)]
pub struct InMemoryOccurrenceStore {
    rows: RwLock<HashMap<Uuid, Occurrence>>,
    enforce_exclusion: bool,
    fail_writes: AtomicBool,
}

impl InMemoryOccurrenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exclusion_constraint() -> Self {
        Self {
            enforce_exclusion: true,
            ..Self::default()
        }
    }

    /// Makes every following write fail with a backend error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn insert(&self, occurrence: Occurrence) {
        self.rows.write().await.insert(occurrence.id, occurrence);
    }

    pub async fn all(&self) -> Vec<Occurrence> {
        let mut rows: Vec<Occurrence> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|o| (o.start_time, o.id));
        rows
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn check_exclusion(&self, rows: &HashMap<Uuid, Occurrence>, id: Option<Uuid>, data: &OccurrenceData) -> Result<(), StoreError> {
        if !self.enforce_exclusion || !data.status.occupies_slot() {
            return Ok(());
        }
        let clash = rows.values().find(|o| {
            Some(o.id) != id
                && o.therapist_id == data.therapist_id
                && o.occupies_slot()
                && o.overlaps(data.start_time, data.end_time)
        });
        match clash {
            Some(o) => Err(StoreError::Conflict(format!("overlaps occurrence {}", o.id))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OccurrenceStore for InMemoryOccurrenceStore {
    async fn list_occurrences(
        &self,
        therapist_ids: Option<&[Uuid]>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let rows = self.rows.read().await;
        let mut found: Vec<Occurrence> = rows.values()
            .filter(|o| therapist_matches(therapist_ids, o.therapist_id))
            .filter(|o| o.overlaps(range_start, range_end))
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.start_time, o.id));
        Ok(found)
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list_series_occurrences(&self, series_id: Uuid, from: DateTime<Utc>) -> Result<Vec<Occurrence>, StoreError> {
        let rows = self.rows.read().await;
        let mut found: Vec<Occurrence> = rows.values()
            .filter(|o| o.series_id == Some(series_id) && o.start_time >= from)
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.start_time, o.id));
        Ok(found)
    }

    async fn create_occurrence(&self, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        self.check_exclusion(&rows, None, &data)?;

        let occurrence = data.into_occurrence(Uuid::new_v4(), Utc::now());
        rows.insert(occurrence.id, occurrence.clone());
        Ok(occurrence)
    }

    async fn update_occurrence(&self, id: Uuid, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        self.check_exclusion(&rows, Some(id), &data)?;

        let existing = rows.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut updated = data.into_occurrence(id, Utc::now());
        updated.created_at = existing.created_at;
        rows.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_occurrence(&self, id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        self.rows.write().await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_occurrences_from(&self, series_id: Uuid, pivot: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check_writable()?;
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, o| !(o.series_id == Some(series_id) && o.start_time >= pivot));
        Ok(before - rows.len())
    }
}

#[derive(Default)]
pub struct InMemorySeriesStore {
    rows: RwLock<HashMap<Uuid, Series>>,
}

impl InMemorySeriesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SeriesStore for InMemorySeriesStore {
    async fn get_series(&self, id: Uuid) -> Result<Option<Series>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn save_series(&self, series: &Series) -> Result<Series, StoreError> {
        let mut saved = series.clone();
        saved.updated_at = Utc::now();
        self.rows.write().await.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn update_series(&self, id: Uuid, update: &SeriesUpdate) -> Result<Series, StoreError> {
        let mut rows = self.rows.write().await;
        let series = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        update.apply_to(series);
        series.updated_at = Utc::now();
        Ok(series.clone())
    }

    async fn delete_series(&self, id: Uuid) -> Result<(), StoreError> {
        self.rows.write().await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_active_series(&self, therapist_ids: Option<&[Uuid]>, through: NaiveDate) -> Result<Vec<Series>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows.values()
            .filter(|s| therapist_matches(therapist_ids, s.therapist_id))
            .filter(|s| s.anchor_date <= through && s.needs_materialization(through))
            .cloned()
            .collect())
    }
}
