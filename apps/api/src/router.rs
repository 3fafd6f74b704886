use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use patient_cell::router::create_patient_router;
use scheduling_cell::handlers::SchedulingState;
use scheduling_cell::router::scheduling_routes;
use therapist_cell::router::therapist_routes;

pub fn create_router(state: Arc<SchedulingState>) -> Router {
    let supabase = Arc::clone(&state.supabase);

    Router::new()
        .route("/", get(|| async { "Clinic calendar API is running!" }))
        .nest("/calendar", scheduling_routes(state))
        .nest("/therapists", therapist_routes(Arc::clone(&supabase)))
        .nest("/patients", create_patient_router(supabase))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use scheduling_cell::BroadcastNotificationDispatcher;
    use shared_config::{AppConfig, CalendarSettings};
    use shared_database::SupabaseClient;

    fn app(base_url: &str) -> Router {
        let config = AppConfig {
            supabase_url: base_url.to_string(),
            supabase_anon_key: "anon".to_string(),
            notification_webhook_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            soft_delete_occurrences: true,
            calendar: CalendarSettings::default(),
        };
        let supabase = Arc::new(SupabaseClient::new(&config));
        let notifier = Arc::new(BroadcastNotificationDispatcher::default());
        create_router(Arc::new(SchedulingState::new(config, supabase, notifier)))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn root_reports_running() {
        let response = app("http://localhost:1")
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn calendar_requires_a_bearer_token() {
        let response = app("http://localhost:1")
            .oneshot(Request::builder().uri("/calendar/week").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn double_booking_is_rejected_with_conflict() {
        let server = MockServer::start().await;
        let therapist = "6f1c2a4e-0d1b-4a57-9c3e-5d8f7e2b1a90";

        Mock::given(method("GET"))
            .and(path("/rest/v1/occurrences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "0b5e6f0a-9d43-4a1e-8c52-2f3b7c1d9e84",
                "therapist_id": therapist,
                "patient_id": "c3d2b1a0-1111-4222-8333-944455556666",
                "start_time": "2025-03-10T10:30:00Z",
                "end_time": "2025-03-10T11:30:00Z",
                "occurrence_type": "session",
                "status": "scheduled",
                "series_id": null,
                "is_series_exception": false,
                "notes": null,
                "value": null,
                "payment_status": "pending",
                "created_at": "2025-03-01T09:00:00Z",
                "updated_at": "2025-03-01T09:00:00Z"
            }])))
            .mount(&server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri("/calendar/occurrences")
            .header("authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(json!({
                "therapist_id": therapist,
                "patient_id": "a1a1a1a1-2222-4333-8444-555566667777",
                "date": "2025-03-10",
                "start_time": "10:00:00",
                "duration_minutes": 60
            }).to_string()))
            .unwrap();

        let response = app(&server.uri()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body["details"]["id"], "0b5e6f0a-9d43-4a1e-8c52-2f3b7c1d9e84");
    }

    #[tokio::test]
    async fn incomplete_booking_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/calendar/occurrences")
            .header("authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "date": "2025-03-10" }).to_string()))
            .unwrap();

        let response = app("http://localhost:1").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
