// libs/scheduling-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use chrono::{NaiveDate, Utc};
use headers::{Authorization, authorization::Bearer};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use patient_cell::SupabasePatientDirectory;
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::error::AppError;
use therapist_cell::SupabaseTherapistDirectory;

use crate::error::SchedulingError;
use crate::models::{OccurrenceForm, OccurrenceStatus};
use crate::services::calendar::{CalendarDependencies, CalendarOrchestrator};
use crate::services::notification::NotificationDispatcher;
use crate::services::supabase_store::{DeletePolicy, SupabaseOccurrenceStore, SupabaseSeriesStore};

/// Shared by every calendar request. Stores are built per request so each
/// one talks to the database with the caller's token.
pub struct SchedulingState {
    pub config: AppConfig,
    pub supabase: Arc<SupabaseClient>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

impl SchedulingState {
    pub fn new(config: AppConfig, supabase: Arc<SupabaseClient>, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self { config, supabase, notifier }
    }

    fn delete_policy(&self) -> DeletePolicy {
        if self.config.soft_delete_occurrences {
            DeletePolicy::SoftDelete
        } else {
            DeletePolicy::Hard
        }
    }

    fn today(&self) -> NaiveDate {
        match self.config.calendar.utc_offset() {
            Some(offset) => Utc::now().with_timezone(&offset).date_naive(),
            None => Utc::now().date_naive(),
        }
    }

    fn orchestrator(&self, token: &str, anchor: NaiveDate) -> Result<CalendarOrchestrator, SchedulingError> {
        let deps = CalendarDependencies {
            occurrences: Arc::new(SupabaseOccurrenceStore::new(Arc::clone(&self.supabase), token, self.delete_policy())),
            series: Arc::new(SupabaseSeriesStore::new(Arc::clone(&self.supabase), token)),
            therapists: Arc::new(SupabaseTherapistDirectory::new(Arc::clone(&self.supabase), token)),
            patients: Arc::new(SupabasePatientDirectory::new(Arc::clone(&self.supabase), token)),
            notifier: Arc::clone(&self.notifier),
        };
        CalendarOrchestrator::new(deps, &self.config.calendar, anchor)
    }
}

impl From<SchedulingError> for AppError {
    fn from(err: SchedulingError) -> Self {
        match err {
            SchedulingError::Validation(msg) => AppError::ValidationError(msg),
            SchedulingError::Recurrence(e) => AppError::ValidationError(e.to_string()),
            SchedulingError::InvalidStatusTransition { .. } => AppError::ValidationError(err.to_string()),
            SchedulingError::InvalidOperation(msg) => AppError::BadRequest(msg),
            SchedulingError::HardConflict { conflicting, reason } => AppError::Conflict {
                message: reason,
                details: conflicting.and_then(|o| serde_json::to_value(*o).ok()),
            },
            SchedulingError::SaveInFlight(_) => AppError::conflict(err.to_string()),
            SchedulingError::NotFound(_) | SchedulingError::SeriesNotFound(_) => AppError::NotFound(err.to_string()),
            SchedulingError::StoreFailure(msg) => AppError::ExternalService(msg),
        }
    }
}

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    pub anchor: Option<NaiveDate>,
    pub offset: Option<i32>,
    /// Comma separated therapist ids.
    pub therapist_ids: Option<String>,
}

impl WeekQuery {
    fn therapist_filter(&self) -> Result<Option<Vec<Uuid>>, AppError> {
        let Some(raw) = self.therapist_ids.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        raw.split(',')
            .map(|id| Uuid::parse_str(id.trim())
                .map_err(|_| AppError::BadRequest(format!("invalid therapist id: {}", id))))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveOccurrenceRequest {
    #[serde(flatten)]
    pub form: OccurrenceForm,
    #[serde(default)]
    pub apply_to_series: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub apply_to_series: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: OccurrenceStatus,
}

// ==============================================================================
// CALENDAR HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_week(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<WeekQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = query.therapist_filter()?;
    let anchor = query.anchor.unwrap_or_else(|| state.today());
    let calendar = state.orchestrator(auth.token(), anchor)?;

    let filtered = filter.is_some();
    if filtered {
        calendar.set_therapist_filter(filter).await?;
    }
    match query.offset.unwrap_or(0) {
        0 if filtered => {}
        0 => {
            calendar.refresh().await?;
        }
        offset => {
            calendar.navigate_week(offset).await?;
        }
    }

    Ok(Json(json!({ "week": calendar.view().await })))
}

/// Creates a booking, edits one, or with `apply_to_series` edits a series from this occurrence on.
#[axum::debug_handler]
pub async fn save_occurrence(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<SaveOccurrenceRequest>,
) -> Result<Json<Value>, AppError> {
    let anchor = request.form.date.unwrap_or_else(|| state.today());
    let calendar = state.orchestrator(auth.token(), anchor)?;

    let outcome = calendar.create_or_update_occurrence(request.form, request.apply_to_series).await?;

    Ok(Json(json!({
        "success": true,
        "occurrences": outcome.occurrences,
        "warnings": outcome.warnings,
        "series": outcome.series,
    })))
}

#[axum::debug_handler]
pub async fn create_series(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(form): Json<OccurrenceForm>,
) -> Result<Json<Value>, AppError> {
    if form.recurrence.is_none() {
        return Err(AppError::ValidationError("recurrence rule is required".to_string()));
    }
    if form.occurrence_id.is_some() {
        return Err(AppError::BadRequest("a series is created from a new booking".to_string()));
    }

    let anchor = form.date.unwrap_or_else(|| state.today());
    let calendar = state.orchestrator(auth.token(), anchor)?;
    let outcome = calendar.create_or_update_occurrence(form, false).await?;

    Ok(Json(json!({
        "success": true,
        "series": outcome.series,
        "occurrences": outcome.occurrences,
        "warnings": outcome.warnings,
    })))
}

#[axum::debug_handler]
pub async fn get_occurrence(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(occurrence_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let calendar = state.orchestrator(auth.token(), state.today())?;
    let occurrence = calendar.select_occurrence(occurrence_id).await?;

    Ok(Json(json!({ "occurrence": occurrence })))
}

#[axum::debug_handler]
pub async fn delete_occurrence(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(occurrence_id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, AppError> {
    let calendar = state.orchestrator(auth.token(), state.today())?;
    let removed = calendar.delete_occurrence(occurrence_id, query.apply_to_series.unwrap_or(false)).await?;

    Ok(Json(json!({
        "success": true,
        "removed": removed,
    })))
}

#[axum::debug_handler]
pub async fn update_occurrence_status(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(occurrence_id): Path<Uuid>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<Value>, AppError> {
    let calendar = state.orchestrator(auth.token(), state.today())?;
    let occurrence = calendar.update_status(occurrence_id, request.status).await?;

    Ok(Json(json!({
        "success": true,
        "occurrence": occurrence,
    })))
}
