//! Session issuance, inspection, revocation and shutdown.

use tracing::{info, warn};

use super::{Orchestrator, SessionSummary};
use crate::models::session::{ActivationSession, QuestionnaireRef, SessionStatus};
use crate::{AppError, Result};

impl Orchestrator {
    /// Issue a new activation session for `chatbot_id`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound`: the chatbot does not exist.
    /// - `AppError::InvalidInput`: the pending set is empty or repeats an id.
    pub async fn issue_session(
        &self,
        chatbot_id: &str,
        participant_id: &str,
        user_id: &str,
        pending: Vec<QuestionnaireRef>,
    ) -> Result<ActivationSession> {
        if pending.is_empty() {
            return Err(AppError::InvalidInput(
                "a session needs at least one questionnaire".into(),
            ));
        }
        if self.store.find_bundle_by_id(chatbot_id).await?.is_none() {
            return Err(AppError::NotFound(format!("chatbot {chatbot_id}")));
        }

        let session = ActivationSession::new(
            chatbot_id.to_owned(),
            participant_id.to_owned(),
            user_id.to_owned(),
            pending,
        )?;
        self.registry.register(&session).await?;
        Ok(session)
    }

    /// Caller-facing view of a live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn get_session_summary(&self, session_id: &str) -> Result<SessionSummary> {
        let session = self.registry.get(session_id).await?;
        let endpoint = self
            .worker(session_id)
            .filter(crate::worker::WorkerHandle::is_running)
            .map(|worker| worker.endpoint().to_owned());

        Ok(SessionSummary {
            id: session.id,
            chatbot_id: session.chatbot_id,
            participant_id: session.participant_id,
            pending_questionnaires: session.pending_questionnaires,
            status: session.status,
            endpoint,
        })
    }

    /// Revoke a session: stop its worker, delete it and remove its workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn revoke(&self, session_id: &str) -> Result<()> {
        let _guard = self.activations.lock(session_id).await;

        self.stop_worker(session_id).await;
        self.registry.revoke(session_id).await?;
        self.release_locked(session_id).await;
        Ok(())
    }

    /// Stop every worker and return their sessions to `Created`.
    ///
    /// Sessions stay registered, so links keep working after a restart.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.lock_workers().drain().collect();
        info!(workers = workers.len(), "stopping workers");

        for (session_id, worker) in workers {
            self.supervisor.stop(&worker).await;
            match self
                .registry
                .set_status(&session_id, SessionStatus::Created)
                .await
            {
                Ok(_) | Err(AppError::SessionNotFound(_)) => {}
                Err(err) => warn!(session_id, %err, "could not reset session status"),
            }
        }
    }
}
