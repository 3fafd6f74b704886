use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::models::{PatientError, PatientSummary};

const SUMMARY_COLUMNS: &str = "id,first_name,last_name,avatar_url,phone_number";
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Patient lookup used by the booking form and the calendar cards.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn search_subjects(&self, term: &str) -> Result<Vec<PatientSummary>, PatientError>;

    async fn get_summaries(&self, ids: &[Uuid]) -> Result<Vec<PatientSummary>, PatientError>;
}

pub struct SupabasePatientDirectory {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabasePatientDirectory {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<PatientSummary>, PatientError> {
        let result: Vec<Value> = self.supabase.request(
            Method::GET,
            path,
            Some(&self.auth_token),
            None,
        ).await.map_err(|e| PatientError::DatabaseError(e.to_string()))?;

        result.into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<PatientSummary>, _>>()
            .map_err(|e| PatientError::DatabaseError(format!("Failed to parse patients: {}", e)))
    }
}

/// PostgREST filter syntax reserves these characters inside `or=(...)`.
fn sanitize_term(term: &str) -> String {
    term.chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '"' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[async_trait]
impl PatientDirectory for SupabasePatientDirectory {
    async fn search_subjects(&self, term: &str) -> Result<Vec<PatientSummary>, PatientError> {
        let term = sanitize_term(term);
        if term.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Searching patients matching {:?}", term);

        let pattern = urlencoding::encode(&format!("*{}*", term)).into_owned();
        let path = format!(
            "/rest/v1/patients?select={}&or=(first_name.ilike.{},last_name.ilike.{})&deleted_at=is.null&order=first_name.asc&limit={}",
            SUMMARY_COLUMNS, pattern, pattern, DEFAULT_SEARCH_LIMIT
        );

        self.fetch(&path).await
    }

    async fn get_summaries(&self, ids: &[Uuid]) -> Result<Vec<PatientSummary>, PatientError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
        let path = format!("/rest/v1/patients?select={}&id=in.({})", SUMMARY_COLUMNS, id_list);

        self.fetch(&path).await
    }
}

/// Fixed patient list, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPatientDirectory {
    patients: Vec<PatientSummary>,
}

impl StaticPatientDirectory {
    pub fn new(patients: Vec<PatientSummary>) -> Self {
        Self { patients }
    }
}

#[async_trait]
impl PatientDirectory for StaticPatientDirectory {
    async fn search_subjects(&self, term: &str) -> Result<Vec<PatientSummary>, PatientError> {
        let term = sanitize_term(term);
        if term.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.patients.iter()
            .filter(|p| p.matches(&term))
            .take(DEFAULT_SEARCH_LIMIT)
            .cloned()
            .collect())
    }

    async fn get_summaries(&self, ids: &[Uuid]) -> Result<Vec<PatientSummary>, PatientError> {
        Ok(self.patients.iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }
}
