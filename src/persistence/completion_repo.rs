//! Append-only completion record repository.

use std::sync::Arc;

use crate::models::completion::CompletionRecord;
use crate::models::parse_timestamp;
use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for completion records.
///
/// Exposes no update or delete: records are immutable once appended.
#[derive(Clone)]
pub struct CompletionRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct CompletionRow {
    id: String,
    user_id: String,
    participant_id: String,
    date: String,
    questionnaire_id: String,
    chatbot_id: String,
    result_id: String,
}

impl CompletionRow {
    fn into_record(self) -> Result<CompletionRecord> {
        Ok(CompletionRecord {
            id: self.id,
            user_id: self.user_id,
            participant_id: self.participant_id,
            date: parse_timestamp("date", &self.date)?,
            questionnaire_id: self.questionnaire_id,
            chatbot_id: self.chatbot_id,
            result_id: self.result_id,
        })
    }
}

impl CompletionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a completion record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(&self, record: &CompletionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO completion_record (id, user_id, participant_id, date,
             questionnaire_id, chatbot_id, result_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.participant_id)
        .bind(record.date.to_rfc3339())
        .bind(&record.questionnaire_id)
        .bind(&record.chatbot_id)
        .bind(&record.result_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// List records for a participant, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_participant(&self, participant_id: &str) -> Result<Vec<CompletionRecord>> {
        let rows: Vec<CompletionRow> = sqlx::query_as(
            "SELECT * FROM completion_record WHERE participant_id = ?1 ORDER BY date ASC",
        )
        .bind(participant_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(CompletionRow::into_record).collect()
    }
}
