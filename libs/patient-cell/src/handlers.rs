use std::sync::Arc;
use axum::{
    extract::{Query, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use serde_json::{json, Value};

use shared_database::supabase::SupabaseClient;
use shared_models::error::AppError;

use crate::models::{PatientError, PatientSearchQuery};
use crate::services::{PatientDirectory, SupabasePatientDirectory};

#[axum::debug_handler]
pub async fn search_patients(
    State(supabase): State<Arc<SupabaseClient>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<PatientSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let directory = SupabasePatientDirectory::new(supabase, auth.token());

    let mut patients = directory.search_subjects(&query.term)
        .await
        .map_err(|e| match e {
            PatientError::ValidationError(msg) => AppError::ValidationError(msg),
            PatientError::DatabaseError(msg) => AppError::ExternalService(msg),
        })?;

    if let Some(limit) = query.limit.filter(|l| *l > 0) {
        patients.truncate(limit as usize);
    }

    Ok(Json(json!({
        "patients": patients,
        "total": patients.len()
    })))
}
