use std::sync::Arc;
use axum::{routing::get, Router};

use shared_database::supabase::SupabaseClient;

use crate::handlers::*;

pub fn create_patient_router(supabase: Arc<SupabaseClient>) -> Router {
    Router::new()
        .route("/search", get(search_patients))
        .with_state(supabase)
}
