use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Denormalized patient fields needed to draw a calendar card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientSummary {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: Option<String>,
    pub phone_number: Option<String>,
}

impl PatientSummary {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn matches(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.full_name().to_lowercase().contains(&term)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientSearchQuery {
    pub term: String,
    pub limit: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatientError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}
