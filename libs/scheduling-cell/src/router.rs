// libs/scheduling-cell/src/router.rs
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::handlers::{self, SchedulingState};

pub fn scheduling_routes(state: Arc<SchedulingState>) -> Router {
    Router::new()
        .route("/week", get(handlers::get_week))
        .route("/occurrences", post(handlers::save_occurrence))
        .route(
            "/occurrences/{occurrence_id}",
            get(handlers::get_occurrence).delete(handlers::delete_occurrence),
        )
        .route("/occurrences/{occurrence_id}/status", patch(handlers::update_occurrence_status))
        .route("/series", post(handlers::create_series))
        .with_state(state)
}
