//! Questionnaire result repository.

use std::sync::Arc;

use crate::models::completion::QuestionnaireResult;
use crate::models::parse_timestamp;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for submitted answers.
#[derive(Clone)]
pub struct ResultRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    id: String,
    chatbot_id: String,
    participant_id: String,
    questionnaire_id: String,
    answers: String,
    created_at: String,
}

impl ResultRow {
    fn into_result(self) -> Result<QuestionnaireResult> {
        let answers = serde_json::from_str(&self.answers)
            .map_err(|e| AppError::Db(format!("invalid answers: {e}")))?;
        Ok(QuestionnaireResult {
            id: self.id,
            chatbot_id: self.chatbot_id,
            participant_id: self.participant_id,
            questionnaire_id: self.questionnaire_id,
            answers,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

impl ResultRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a result and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, result: &QuestionnaireResult) -> Result<String> {
        let answers = serde_json::to_string(&result.answers)
            .map_err(|e| AppError::Db(format!("serialize answers: {e}")))?;

        sqlx::query(
            "INSERT INTO questionnaire_result (id, chatbot_id, participant_id,
             questionnaire_id, answers, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&result.id)
        .bind(&result.chatbot_id)
        .bind(&result.participant_id)
        .bind(&result.questionnaire_id)
        .bind(&answers)
        .bind(result.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(result.id.clone())
    }

    /// Retrieve a result by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<QuestionnaireResult>> {
        let row: Option<ResultRow> =
            sqlx::query_as("SELECT * FROM questionnaire_result WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(ResultRow::into_result).transpose()
    }
}
