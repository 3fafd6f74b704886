use std::sync::Arc;

use axum::{extract::State, Json};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use serde_json::{json, Value};

use shared_database::supabase::SupabaseClient;
use shared_models::error::AppError;

use crate::services::{SupabaseTherapistDirectory, TherapistDirectory};

#[axum::debug_handler]
pub async fn list_therapists(
    State(supabase): State<Arc<SupabaseClient>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<Value>, AppError> {
    let directory = SupabaseTherapistDirectory::new(supabase, auth.token());

    let therapists = directory.list_resources().await
        .map_err(|e| AppError::ExternalService(e.to_string()))?;

    Ok(Json(json!({
        "therapists": therapists,
        "total": therapists.len()
    })))
}
