//! Activation session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::parse_timestamp;
use crate::models::session::{ActivationSession, QuestionnaireRef, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Outcome of removing one questionnaire from a session's pending set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    /// Session after the update; `status` is `Retired` when the set emptied.
    pub session: ActivationSession,
    /// Whether the questionnaire was pending before the update.
    pub removed: bool,
    /// Whether this update emptied the set and deleted the session.
    pub retired: bool,
}

/// Repository wrapper around `SQLite` for activation session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    chatbot_id: String,
    participant_id: String,
    user_id: String,
    pending_questionnaires: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<ActivationSession> {
        let pending: Vec<QuestionnaireRef> = serde_json::from_str(&self.pending_questionnaires)
            .map_err(|e| AppError::Db(format!("invalid pending_questionnaires: {e}")))?;

        Ok(ActivationSession {
            id: self.id,
            chatbot_id: self.chatbot_id,
            participant_id: self.participant_id,
            user_id: self.user_id,
            pending_questionnaires: pending,
            status: SessionStatus::parse(&self.status)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

fn pending_json(pending: &[QuestionnaireRef]) -> Result<String> {
    serde_json::to_string(pending)
        .map_err(|e| AppError::Db(format!("serialize pending_questionnaires: {e}")))
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &ActivationSession) -> Result<ActivationSession> {
        sqlx::query(
            "INSERT INTO activation_session (id, chatbot_id, participant_id, user_id,
             pending_questionnaires, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&session.id)
        .bind(&session.chatbot_id)
        .bind(&session.participant_id)
        .bind(&session.user_id)
        .bind(pending_json(&session.pending_questionnaires)?)
        .bind(session.status.as_str())
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ActivationSession>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM activation_session WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Update session status and `updated_at`, respecting the state machine.
    ///
    /// The write is conditional on the status read, so a concurrent writer
    /// surfaces as `AppError::RegistryConflict` instead of a lost update.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session does not exist,
    /// `AppError::InvalidTransition` if the lifecycle forbids the change.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<ActivationSession> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(id.to_owned()))?;

        if !current.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        let previous = current.status;
        current.status = status;
        current.updated_at = Utc::now();

        let result = sqlx::query(
            "UPDATE activation_session SET status = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
        )
        .bind(status.as_str())
        .bind(current.updated_at.to_rfc3339())
        .bind(id)
        .bind(previous.as_str())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::RegistryConflict(format!(
                "session {id} changed concurrently"
            )));
        }

        Ok(current)
    }

    /// Atomically remove one questionnaire from the pending set.
    ///
    /// Runs in a single transaction. When the set becomes empty the row is
    /// deleted in the same transaction and the returned session is marked
    /// `Retired`. Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RegistryConflict` on lock contention, or
    /// `AppError::Db` if the transaction fails.
    pub async fn remove_pending(
        &self,
        id: &str,
        questionnaire_id: &str,
    ) -> Result<Option<PendingUpdate>> {
        let mut tx = self.db.begin().await?;

        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM activation_session WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut session = row.into_session()?;

        if !session.remove_pending(questionnaire_id) {
            tx.commit().await?;
            return Ok(Some(PendingUpdate {
                session,
                removed: false,
                retired: false,
            }));
        }

        session.updated_at = Utc::now();
        let retired = session.pending_questionnaires.is_empty();

        if retired {
            sqlx::query("DELETE FROM activation_session WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            session.status = SessionStatus::Retired;
        } else {
            sqlx::query(
                "UPDATE activation_session SET pending_questionnaires = ?1, updated_at = ?2 \
                 WHERE id = ?3",
            )
            .bind(pending_json(&session.pending_questionnaires)?)
            .bind(session.updated_at.to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Some(PendingUpdate {
            session,
            removed: true,
            retired,
        }))
    }

    /// Delete a session record. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM activation_session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List identifiers of every registered session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM activation_session")
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
