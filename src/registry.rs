//! Session registry: the single writer for activation session state.
//!
//! Mutations for one session id serialize on a per-session async lock;
//! different sessions proceed concurrently. Store contention surfaces as
//! `RegistryConflict` and is retried here with a short backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::locks::KeyedLocks;
use crate::models::session::{ensure_unique, ActivationSession, SessionStatus};
use crate::store::DocumentStore;
use crate::{AppError, Result};

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF: Duration = Duration::from_millis(20);

/// Outcome of [`SessionRegistry::complete_questionnaire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionUpdate {
    /// Session after the update; `Retired` when the set emptied.
    pub session: ActivationSession,
    /// Whether the questionnaire was pending.
    pub removed: bool,
    /// Whether this call emptied the set and retired the session.
    pub retired: bool,
}

/// Live session registry backed by the document store.
pub struct SessionRegistry {
    store: Arc<dyn DocumentStore>,
    locks: KeyedLocks,
}

impl SessionRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Register a newly issued session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if the pending set repeats an id or
    /// the session id is already registered.
    pub async fn register(&self, session: &ActivationSession) -> Result<()> {
        ensure_unique(&session.pending_questionnaires)?;

        let _guard = self.locks.lock(&session.id).await;

        if self.store.find_session_by_id(&session.id).await?.is_some() {
            return Err(AppError::InvalidInput(format!(
                "session {} already registered",
                session.id
            )));
        }
        self.store.insert_session(session).await?;
        info!(
            session_id = %session.id,
            chatbot_id = %session.chatbot_id,
            pending = session.pending_questionnaires.len(),
            "session registered"
        );
        Ok(())
    }

    /// Fetch a live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session was retired or
    /// never issued.
    pub async fn get(&self, session_id: &str) -> Result<ActivationSession> {
        self.store
            .find_session_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_owned()))
    }

    /// Move a session to `status`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` or `AppError::InvalidTransition`.
    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<ActivationSession> {
        let _guard = self.locks.lock(session_id).await;

        let session = with_retry(session_id, || {
            self.store.update_session_status(session_id, status)
        })
        .await?;
        debug!(session_id, status = status.as_str(), "session status updated");
        Ok(session)
    }

    /// Remove `questionnaire_id` from the pending set, retiring the session
    /// when the set becomes empty.
    ///
    /// Completing an id that is not pending changes nothing and reports
    /// `removed: false, retired: false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn complete_questionnaire(
        &self,
        session_id: &str,
        questionnaire_id: &str,
    ) -> Result<CompletionUpdate> {
        let guard = self.locks.lock(session_id).await;

        let update = with_retry(session_id, || {
            self.store
                .update_session_pending_set(session_id, questionnaire_id)
        })
        .await?
        .ok_or_else(|| AppError::SessionNotFound(session_id.to_owned()))?;

        drop(guard);

        if update.retired {
            info!(session_id, questionnaire_id, "session retired");
        } else if update.removed {
            info!(
                session_id,
                questionnaire_id,
                remaining = update.session.pending_questionnaires.len(),
                "questionnaire completed"
            );
        } else {
            debug!(session_id, questionnaire_id, "questionnaire not pending, ignored");
        }

        Ok(CompletionUpdate {
            session: update.session,
            removed: update.removed,
            retired: update.retired,
        })
    }

    /// Delete a session outright.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn revoke(&self, session_id: &str) -> Result<()> {
        let guard = self.locks.lock(session_id).await;

        let existed = with_retry(session_id, || self.store.delete_session(session_id)).await?;
        drop(guard);

        if !existed {
            return Err(AppError::SessionNotFound(session_id.to_owned()));
        }
        info!(session_id, "session revoked");
        Ok(())
    }

    /// Sessions with a mutation in progress or waiting.
    #[must_use]
    pub fn locked_sessions(&self) -> usize {
        self.locks.len()
    }
}

/// Retry `op` while the store reports contention.
async fn with_retry<T, F, Fut>(session_id: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(AppError::RegistryConflict(msg)) if attempt < MAX_ATTEMPTS => {
                debug!(session_id, attempt, %msg, "registry conflict, retrying");
                tokio::time::sleep(BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(AppError::RegistryConflict(msg)) => {
                warn!(session_id, attempt, %msg, "registry contention persisted");
                return Err(AppError::Db(format!(
                    "session {session_id} contention after {attempt} attempts: {msg}"
                )));
            }
            other => return other,
        }
    }
}
