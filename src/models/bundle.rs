//! Chatbot bundle document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stored chatbot definition pointing at its packaged archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bundle {
    /// Chatbot identifier referenced by sessions.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning evaluator.
    pub user_id: String,
    /// Key of the zip archive in the bundle store.
    pub archive_id: String,
    /// Upload timestamp.
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    /// Construct a bundle document with a generated identifier.
    #[must_use]
    pub fn new(name: String, user_id: String, archive_id: String) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name,
            user_id,
            archive_id,
            created_at: Utc::now(),
        }
    }
}
