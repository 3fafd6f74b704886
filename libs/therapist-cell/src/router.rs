use std::sync::Arc;

use axum::{Router, routing::get};

use shared_database::supabase::SupabaseClient;

use crate::handlers;

pub fn therapist_routes(supabase: Arc<SupabaseClient>) -> Router {
    Router::new()
        .route("/", get(handlers::list_therapists))
        .with_state(supabase)
}
