// libs/scheduling-cell/src/services/supabase_store.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_database::supabase::{return_representation, SupabaseClient, SupabaseError};

use crate::models::{Occurrence, OccurrenceData, Series, SeriesUpdate};
use crate::services::store::{OccurrenceStore, SeriesStore, StoreError};

const OCCURRENCES: &str = "/rest/v1/occurrences";
const SERIES: &str = "/rest/v1/occurrence_series";

/// How removed occurrences leave the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Hard,
    /// Stamp `deleted_at` and hide the row from every read.
    SoftDelete,
}

impl From<SupabaseError> for StoreError {
    fn from(err: SupabaseError) -> Self {
        match err {
            SupabaseError::Conflict(detail) => StoreError::Conflict(detail),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    urlencoding::encode(&at.to_rfc3339_opts(SecondsFormat::Secs, true)).into_owned()
}

fn id_list(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
}

fn parse_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| StoreError::Backend(format!("Failed to parse row: {}", e))))
        .collect()
}

pub struct SupabaseOccurrenceStore {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
    delete_policy: DeletePolicy,
}

impl SupabaseOccurrenceStore {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>, delete_policy: DeletePolicy) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
            delete_policy,
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<Occurrence>, StoreError> {
        let rows: Vec<Value> = self.supabase.request(
            Method::GET,
            path,
            Some(&self.auth_token),
            None,
        ).await?;
        parse_rows(rows)
    }

    /// Removes whatever `filter` selects and reports how many rows went.
    async fn remove(&self, filter: &str) -> Result<usize, StoreError> {
        let rows: Vec<Value> = match self.delete_policy {
            DeletePolicy::Hard => {
                self.supabase.request_with_headers(
                    Method::DELETE,
                    &format!("{}?{}", OCCURRENCES, filter),
                    Some(&self.auth_token),
                    None,
                    Some(return_representation()),
                ).await?
            }
            DeletePolicy::SoftDelete => {
                self.supabase.request_with_headers(
                    Method::PATCH,
                    &format!("{}?{}&deleted_at=is.null", OCCURRENCES, filter),
                    Some(&self.auth_token),
                    Some(json!({ "deleted_at": Utc::now() })),
                    Some(return_representation()),
                ).await?
            }
        };
        Ok(rows.len())
    }
}

#[async_trait]
impl OccurrenceStore for SupabaseOccurrenceStore {
    #[instrument(skip(self))]
    async fn list_occurrences(
        &self,
        therapist_ids: Option<&[Uuid]>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let mut path = format!(
            "{}?select=*&deleted_at=is.null&start_time=lt.{}&end_time=gt.{}&order=start_time.asc",
            OCCURRENCES,
            timestamp(range_end),
            timestamp(range_start),
        );
        if let Some(ids) = therapist_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            path.push_str(&format!("&therapist_id=in.({})", id_list(ids)));
        }

        let occurrences = self.fetch(&path).await?;
        debug!("Loaded {} occurrences", occurrences.len());
        Ok(occurrences)
    }

    async fn get_occurrence(&self, id: Uuid) -> Result<Option<Occurrence>, StoreError> {
        let path = format!("{}?id=eq.{}&deleted_at=is.null", OCCURRENCES, id);
        Ok(self.fetch(&path).await?.into_iter().next())
    }

    async fn list_series_occurrences(&self, series_id: Uuid, from: DateTime<Utc>) -> Result<Vec<Occurrence>, StoreError> {
        let path = format!(
            "{}?series_id=eq.{}&start_time=gte.{}&deleted_at=is.null&order=start_time.asc",
            OCCURRENCES, series_id, timestamp(from),
        );
        self.fetch(&path).await
    }

    #[instrument(skip(self, data), fields(therapist_id = %data.therapist_id))]
    async fn create_occurrence(&self, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        let body = serde_json::to_value(&data)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<Value> = self.supabase.request_with_headers(
            Method::POST,
            OCCURRENCES,
            Some(&self.auth_token),
            Some(body),
            Some(return_representation()),
        ).await?;

        let created = parse_rows::<Occurrence>(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("insert returned no row".to_string()))?;

        info!("Created occurrence {}", created.id);
        Ok(created)
    }

    #[instrument(skip(self, data))]
    async fn update_occurrence(&self, id: Uuid, data: OccurrenceData) -> Result<Occurrence, StoreError> {
        let mut body = serde_json::to_value(&data)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("updated_at".to_string(), json!(Utc::now()));
        }

        let rows: Vec<Value> = self.supabase.request_with_headers(
            Method::PATCH,
            &format!("{}?id=eq.{}&deleted_at=is.null", OCCURRENCES, id),
            Some(&self.auth_token),
            Some(body),
            Some(return_representation()),
        ).await?;

        parse_rows::<Occurrence>(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_occurrence(&self, id: Uuid) -> Result<(), StoreError> {
        match self.remove(&format!("id=eq.{}", id)).await? {
            0 => Err(StoreError::NotFound(id)),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self))]
    async fn delete_occurrences_from(&self, series_id: Uuid, pivot: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.remove(&format!("series_id=eq.{}&start_time=gte.{}", series_id, timestamp(pivot))).await?;
        info!("Removed {} occurrences of series {} from {}", removed, series_id, pivot);
        Ok(removed)
    }
}

pub struct SupabaseSeriesStore {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseSeriesStore {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<Series>, StoreError> {
        let rows: Vec<Value> = self.supabase.request(
            Method::GET,
            path,
            Some(&self.auth_token),
            None,
        ).await?;
        parse_rows(rows)
    }
}

#[async_trait]
impl SeriesStore for SupabaseSeriesStore {
    async fn get_series(&self, id: Uuid) -> Result<Option<Series>, StoreError> {
        Ok(self.fetch(&format!("{}?id=eq.{}", SERIES, id)).await?.into_iter().next())
    }

    async fn save_series(&self, series: &Series) -> Result<Series, StoreError> {
        let mut saved = series.clone();
        saved.updated_at = Utc::now();
        let body = serde_json::to_value(&saved)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("resolution=merge-duplicates,return=representation"));

        let rows: Vec<Value> = self.supabase.request_with_headers(
            Method::POST,
            SERIES,
            Some(&self.auth_token),
            Some(body),
            Some(headers),
        ).await?;

        match parse_rows::<Series>(rows)?.into_iter().next() {
            Some(row) => Ok(row),
            None => {
                warn!("Upsert of series {} returned no row", series.id);
                Ok(saved)
            }
        }
    }

    #[instrument(skip(self, update))]
    async fn update_series(&self, id: Uuid, update: &SeriesUpdate) -> Result<Series, StoreError> {
        let mut body = serde_json::to_value(update)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("updated_at".to_string(), json!(Utc::now()));
        }

        let rows: Vec<Value> = self.supabase.request_with_headers(
            Method::PATCH,
            &format!("{}?id=eq.{}", SERIES, id),
            Some(&self.auth_token),
            Some(body),
            Some(return_representation()),
        ).await?;

        parse_rows::<Series>(rows)?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_series(&self, id: Uuid) -> Result<(), StoreError> {
        self.supabase.execute(
            Method::DELETE,
            &format!("{}?id=eq.{}", SERIES, id),
            Some(&self.auth_token),
            None,
        ).await?;
        Ok(())
    }

    async fn list_active_series(&self, therapist_ids: Option<&[Uuid]>, through: NaiveDate) -> Result<Vec<Series>, StoreError> {
        let mut path = format!(
            "{}?anchor_date=lte.{}&or=(materialized_through.is.null,materialized_through.lt.{})",
            SERIES, through, through,
        );
        if let Some(ids) = therapist_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            path.push_str(&format!("&therapist_id=in.({})", id_list(ids)));
        }
        self.fetch(&path).await
    }
}
