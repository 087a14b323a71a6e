//! Result submission, questionnaire completion and retirement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use super::Orchestrator;
use crate::models::completion::{CompletionRecord, QuestionnaireResult};
use crate::{AppError, Result};

/// Caller-supplied details of a finished questionnaire.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CompletionMetadata {
    /// Stored answers this completion refers to.
    pub result_id: String,
    /// Completion date; defaults to now.
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

/// Outcome of [`Orchestrator::complete_questionnaire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    /// Whether this completion emptied the pending set.
    pub retired: bool,
    /// Whether a completion record was appended.
    pub archived: bool,
    /// Archive failure, reported without undoing retirement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_error: Option<String>,
}

impl Orchestrator {
    /// Store answers for a pending questionnaire and return the result id.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound`: the session is not live.
    /// - `AppError::InvalidInput`: the questionnaire is not pending.
    pub async fn submit_result(
        &self,
        session_id: &str,
        questionnaire_id: &str,
        answers: serde_json::Value,
    ) -> Result<String> {
        let session = self.registry.get(session_id).await?;
        if !session.is_pending(questionnaire_id) {
            return Err(AppError::InvalidInput(format!(
                "questionnaire {questionnaire_id} is not pending for session {session_id}"
            )));
        }

        let result = QuestionnaireResult::new(
            session.chatbot_id,
            session.participant_id,
            questionnaire_id.to_owned(),
            answers,
        );
        let result_id = self.store.insert_result(&result).await?;
        info!(session_id, questionnaire_id, %result_id, "result stored");
        Ok(result_id)
    }

    /// Mark `questionnaire_id` finished for `session_id`.
    ///
    /// Appends one completion record when the questionnaire was pending.
    /// When the pending set empties the session is retired: its worker is
    /// stopped, its workspace removed and its readiness state dropped.
    /// Completing a questionnaire that is not pending is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn complete_questionnaire(
        &self,
        session_id: &str,
        questionnaire_id: &str,
        metadata: CompletionMetadata,
    ) -> Result<CompletionOutcome> {
        let span = info_span!("complete_questionnaire", session_id, questionnaire_id);
        async {
            let update = self
                .registry
                .complete_questionnaire(session_id, questionnaire_id)
                .await?;

            if !update.removed {
                return Ok(CompletionOutcome {
                    retired: false,
                    archived: false,
                    archive_error: None,
                });
            }

            let session = update.session;
            let record = CompletionRecord::new(
                session.user_id,
                session.participant_id,
                metadata.date.unwrap_or_else(Utc::now),
                questionnaire_id.to_owned(),
                session.chatbot_id,
                metadata.result_id,
            );
            let archive_error = self
                .archiver
                .archive(&record)
                .await
                .err()
                .map(|err| err.to_string());

            if update.retired {
                self.release_session(session_id).await;
            }

            Ok(CompletionOutcome {
                retired: update.retired,
                archived: archive_error.is_none(),
                archive_error,
            })
        }
        .instrument(span)
        .await
    }

    /// Stop the worker and drop every per-session resource.
    ///
    /// Waits for an in-flight activation, so nothing it builds outlives
    /// the release.
    async fn release_session(&self, session_id: &str) {
        let _guard = self.activations.lock(session_id).await;
        self.release_locked(session_id).await;
    }

    /// [`release_session`](Self::release_session) for callers already
    /// holding the session's activation lock.
    pub(super) async fn release_locked(&self, session_id: &str) {
        self.stop_worker(session_id).await;
        if let Err(err) = self.preparer.remove(session_id).await {
            warn!(session_id, %err, "workspace left for the orphan sweep");
        }
        self.notifier.remove(session_id);
    }
}
