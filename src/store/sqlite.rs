//! `SQLite`-backed implementation of both store traits.

use std::sync::Arc;

use crate::models::bundle::Bundle;
use crate::models::completion::{CompletionRecord, QuestionnaireResult};
use crate::models::session::{ActivationSession, SessionStatus};
use crate::persistence::bundle_repo::BundleRepo;
use crate::persistence::completion_repo::CompletionRepo;
use crate::persistence::db::Database;
use crate::persistence::result_repo::ResultRepo;
use crate::persistence::session_repo::{PendingUpdate, SessionRepo};
use crate::AppError;

use super::{BundleStore, DocumentStore, StoreFuture};

/// Document and bundle store over one `SQLite` pool.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    sessions: SessionRepo,
    bundles: BundleRepo,
    results: ResultRepo,
    completions: CompletionRepo,
}

impl SqliteDocumentStore {
    /// Build the store from a shared pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            bundles: BundleRepo::new(Arc::clone(&db)),
            results: ResultRepo::new(Arc::clone(&db)),
            completions: CompletionRepo::new(db),
        }
    }

    /// Chatbot document and archive repository.
    #[must_use]
    pub fn bundles(&self) -> &BundleRepo {
        &self.bundles
    }

    /// Result repository.
    #[must_use]
    pub fn results(&self) -> &ResultRepo {
        &self.results
    }

    /// Completion record repository.
    #[must_use]
    pub fn completions(&self) -> &CompletionRepo {
        &self.completions
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn insert_session(&self, session: &ActivationSession) -> StoreFuture<'_, ()> {
        let session = session.clone();
        Box::pin(async move {
            self.sessions.create(&session).await?;
            Ok(())
        })
    }

    fn find_session_by_id(&self, id: &str) -> StoreFuture<'_, Option<ActivationSession>> {
        let id = id.to_owned();
        Box::pin(async move { self.sessions.get_by_id(&id).await })
    }

    fn find_bundle_by_id(&self, id: &str) -> StoreFuture<'_, Option<Bundle>> {
        let id = id.to_owned();
        Box::pin(async move { self.bundles.get_by_id(&id).await })
    }

    fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreFuture<'_, ActivationSession> {
        let id = id.to_owned();
        Box::pin(async move { self.sessions.update_status(&id, status).await })
    }

    fn update_session_pending_set(
        &self,
        id: &str,
        remove_questionnaire_id: &str,
    ) -> StoreFuture<'_, Option<PendingUpdate>> {
        let id = id.to_owned();
        let questionnaire_id = remove_questionnaire_id.to_owned();
        Box::pin(async move { self.sessions.remove_pending(&id, &questionnaire_id).await })
    }

    fn delete_session(&self, id: &str) -> StoreFuture<'_, bool> {
        let id = id.to_owned();
        Box::pin(async move { self.sessions.delete(&id).await })
    }

    fn list_session_ids(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { self.sessions.list_ids().await })
    }

    fn append_completion_record(&self, record: &CompletionRecord) -> StoreFuture<'_, ()> {
        let record = record.clone();
        Box::pin(async move { self.completions.append(&record).await })
    }

    fn insert_result(&self, result: &QuestionnaireResult) -> StoreFuture<'_, String> {
        let result = result.clone();
        Box::pin(async move { self.results.insert(&result).await })
    }
}

impl BundleStore for SqliteDocumentStore {
    fn fetch_bundle(&self, archive_id: &str) -> StoreFuture<'_, Vec<u8>> {
        let archive_id = archive_id.to_owned();
        Box::pin(async move {
            match self.bundles.get_archive(&archive_id).await {
                Ok(Some(data)) => Ok(data),
                Ok(None) => Err(AppError::BundleUnavailable(format!(
                    "archive {archive_id} not found"
                ))),
                Err(err) => Err(AppError::BundleUnavailable(format!(
                    "archive {archive_id}: {err}"
                ))),
            }
        })
    }
}
