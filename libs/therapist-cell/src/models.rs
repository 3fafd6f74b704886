use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bookable resource on the calendar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Therapist {
    pub id: Uuid,
    pub display_name: String,
    /// Color token used to tell columns and cards apart. Carries no scheduling meaning.
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "slate".to_string()
}

impl Therapist {
    pub fn new(id: Uuid, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            color: color.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TherapistError {
    #[error("Therapist not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    DatabaseError(String),
}
