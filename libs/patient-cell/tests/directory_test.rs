use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;
use uuid::Uuid;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers::{method, path}};

use patient_cell::{PatientDirectory, PatientError, PatientSummary, StaticPatientDirectory, SupabasePatientDirectory};
use shared_database::supabase::SupabaseClient;

fn summary(first: &str, last: &str) -> PatientSummary {
    PatientSummary {
        id: Uuid::new_v4(),
        first_name: first.to_string(),
        last_name: last.to_string(),
        avatar_url: None,
        phone_number: None,
    }
}

#[tokio::test]
async fn search_returns_parsed_summaries() {
    let mock_server = MockServer::start().await;
    let id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": id,
                "first_name": "Maria",
                "last_name": "Oliveira",
                "avatar_url": "https://cdn.example.com/m.png",
                "phone_number": null
            }
        ])))
        .mount(&mock_server)
        .await;

    let client = Arc::new(SupabaseClient::with_base_url(&mock_server.uri(), "anon"));
    let directory = SupabasePatientDirectory::new(client, "token");

    let found = directory.search_subjects("mar").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);
    assert_eq!(found[0].full_name(), "Maria Oliveira");
}

#[tokio::test]
async fn blank_search_does_not_hit_the_backend() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = Arc::new(SupabaseClient::with_base_url(&mock_server.uri(), "anon"));
    let directory = SupabasePatientDirectory::new(client, "token");

    assert!(directory.search_subjects("  ").await.unwrap().is_empty());
    assert!(directory.get_summaries(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn backend_errors_are_database_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/patients"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let client = Arc::new(SupabaseClient::with_base_url(&mock_server.uri(), "anon"));
    let directory = SupabasePatientDirectory::new(client, "token");

    assert_matches!(
        directory.get_summaries(&[Uuid::new_v4()]).await,
        Err(PatientError::DatabaseError(_))
    );
}

#[tokio::test]
async fn static_directory_matches_case_insensitively() {
    let maria = summary("Maria", "Oliveira");
    let joao = summary("João", "Pereira");
    let directory = StaticPatientDirectory::new(vec![maria.clone(), joao.clone()]);

    assert_eq!(directory.search_subjects("OLIV").await.unwrap(), vec![maria.clone()]);
    assert_eq!(directory.get_summaries(&[joao.id]).await.unwrap(), vec![joao]);
}
