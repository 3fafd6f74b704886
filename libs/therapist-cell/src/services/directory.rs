use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use shared_database::supabase::SupabaseClient;

use crate::models::{Therapist, TherapistError};

/// Lists the therapists that can be shown as calendar columns.
#[async_trait]
pub trait TherapistDirectory: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<Therapist>, TherapistError>;
}

pub struct SupabaseTherapistDirectory {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseTherapistDirectory {
    pub fn new(supabase: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self {
            supabase,
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl TherapistDirectory for SupabaseTherapistDirectory {
    async fn list_resources(&self) -> Result<Vec<Therapist>, TherapistError> {
        let path = "/rest/v1/therapists?select=id,display_name,color&is_active=eq.true&deleted_at=is.null&order=display_name.asc";
        debug!("Listing active therapists");

        let result: Vec<Value> = self.supabase.request(
            Method::GET,
            path,
            Some(&self.auth_token),
            None,
        ).await.map_err(|e| TherapistError::DatabaseError(e.to_string()))?;

        result.into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Therapist>, _>>()
            .map_err(|e| TherapistError::DatabaseError(format!("Failed to parse therapists: {}", e)))
    }
}

/// Fixed therapist list, for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTherapistDirectory {
    therapists: Vec<Therapist>,
}

impl StaticTherapistDirectory {
    pub fn new(therapists: Vec<Therapist>) -> Self {
        Self { therapists }
    }
}

#[async_trait]
impl TherapistDirectory for StaticTherapistDirectory {
    async fn list_resources(&self) -> Result<Vec<Therapist>, TherapistError> {
        Ok(self.therapists.clone())
    }
}
