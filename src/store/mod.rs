//! Document Store and Bundle Store collaborator interfaces.
//!
//! The orchestrator reaches persistence only through these two traits.
//! [`SqliteDocumentStore`] implements both over one pool.

pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use crate::models::bundle::Bundle;
use crate::models::completion::{CompletionRecord, QuestionnaireResult};
use crate::models::session::{ActivationSession, SessionStatus};
use crate::persistence::session_repo::PendingUpdate;
use crate::Result;

pub use sqlite::SqliteDocumentStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Document-oriented persistence for sessions, chatbots, results and
/// completion records.
pub trait DocumentStore: Send + Sync {
    /// Persist a newly issued session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the insert fails.
    fn insert_session(&self, session: &ActivationSession) -> StoreFuture<'_, ()>;

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the query fails.
    fn find_session_by_id(&self, id: &str) -> StoreFuture<'_, Option<ActivationSession>>;

    /// Look up a chatbot bundle document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the query fails.
    fn find_bundle_by_id(&self, id: &str) -> StoreFuture<'_, Option<Bundle>>;

    /// Move a session to `status`, validating the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionNotFound`](crate::AppError::SessionNotFound),
    /// [`AppError::InvalidTransition`](crate::AppError::InvalidTransition) or
    /// [`AppError::RegistryConflict`](crate::AppError::RegistryConflict).
    fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreFuture<'_, ActivationSession>;

    /// Atomically remove one questionnaire from the pending set, deleting the
    /// session in the same step when the set becomes empty.
    ///
    /// Returns `None` when the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::RegistryConflict`](crate::AppError::RegistryConflict)
    /// on contention.
    fn update_session_pending_set(
        &self,
        id: &str,
        remove_questionnaire_id: &str,
    ) -> StoreFuture<'_, Option<PendingUpdate>>;

    /// Delete a session. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the delete fails.
    fn delete_session(&self, id: &str) -> StoreFuture<'_, bool>;

    /// Identifiers of every registered session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the query fails.
    fn list_session_ids(&self) -> StoreFuture<'_, Vec<String>>;

    /// Append an immutable completion record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the insert fails.
    fn append_completion_record(&self, record: &CompletionRecord) -> StoreFuture<'_, ()>;

    /// Store submitted answers and return the result identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) if the insert fails.
    fn insert_result(&self, result: &QuestionnaireResult) -> StoreFuture<'_, String>;
}

/// Read-only storage of packaged chatbot archives.
pub trait BundleStore: Send + Sync {
    /// Fetch the raw archive bytes stored under `archive_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BundleUnavailable`](crate::AppError::BundleUnavailable)
    /// if the archive is missing or retrieval fails.
    fn fetch_bundle(&self, archive_id: &str) -> StoreFuture<'_, Vec<u8>>;
}
