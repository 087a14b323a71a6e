use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use activation_orchestrator::models::bundle::Bundle;
use activation_orchestrator::models::completion::{CompletionRecord, QuestionnaireResult};
use activation_orchestrator::models::session::{
    ActivationSession, QuestionnaireRef, SessionStatus,
};
use activation_orchestrator::persistence::db;
use activation_orchestrator::persistence::session_repo::PendingUpdate;
use activation_orchestrator::registry::SessionRegistry;
use activation_orchestrator::store::{DocumentStore, SqliteDocumentStore, StoreFuture};
use activation_orchestrator::AppError;

async fn registry() -> SessionRegistry {
    let pool = db::connect_memory().await.expect("db connect");
    SessionRegistry::new(Arc::new(SqliteDocumentStore::new(Arc::new(pool))))
}

fn session(ids: &[&str]) -> ActivationSession {
    ActivationSession::new(
        "bot-1".into(),
        "p-1".into(),
        "u-1".into(),
        ids.iter().map(|id| QuestionnaireRef::new(*id, *id)).collect(),
    )
    .expect("valid session")
}

// ── Completion bookkeeping ───────────────────────────────────

#[tokio::test]
async fn two_questionnaires_retire_on_second() {
    let registry = registry().await;
    let s = session(&["q1", "q2"]);
    registry.register(&s).await.expect("register");

    let first = registry
        .complete_questionnaire(&s.id, "q1")
        .await
        .expect("complete q1");
    assert!(first.removed);
    assert!(!first.retired);
    assert_eq!(first.session.pending_questionnaires.len(), 1);
    assert!(registry.get(&s.id).await.is_ok(), "still live after q1");

    let second = registry
        .complete_questionnaire(&s.id, "q2")
        .await
        .expect("complete q2");
    assert!(second.removed);
    assert!(second.retired);
    assert_eq!(second.session.status, SessionStatus::Retired);

    let err = registry.get(&s.id).await.expect_err("retired");
    assert!(matches!(err, AppError::SessionNotFound(_)));
}

#[tokio::test]
async fn completing_unknown_questionnaire_changes_nothing() {
    let registry = registry().await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");

    let update = registry
        .complete_questionnaire(&s.id, "q-other")
        .await
        .expect("no-op");
    assert!(!update.removed);
    assert!(!update.retired);
    assert_eq!(
        registry.get(&s.id).await.expect("live").pending_questionnaires,
        s.pending_questionnaires
    );
}

#[tokio::test]
async fn completing_on_retired_session_is_not_found() {
    let registry = registry().await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");
    registry
        .complete_questionnaire(&s.id, "q1")
        .await
        .expect("retire");

    let err = registry
        .complete_questionnaire(&s.id, "q1")
        .await
        .expect_err("gone");
    assert!(matches!(err, AppError::SessionNotFound(_)));
}

#[tokio::test]
async fn concurrent_completions_retire_exactly_once() {
    let registry = Arc::new(registry().await);
    let ids: Vec<String> = (0..8).map(|i| format!("q{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let s = session(&refs);
    registry.register(&s).await.expect("register");

    let tasks: Vec<_> = ids
        .iter()
        .map(|qid| {
            let registry = Arc::clone(&registry);
            let sid = s.id.clone();
            let qid = qid.clone();
            tokio::spawn(async move { registry.complete_questionnaire(&sid, &qid).await })
        })
        .collect();

    let mut retired = 0;
    for task in tasks {
        let update = task.await.expect("join").expect("complete");
        assert!(update.removed);
        if update.retired {
            retired += 1;
        }
    }
    assert_eq!(retired, 1);
}

#[tokio::test]
async fn concurrent_duplicate_completion_removes_once() {
    let registry = Arc::new(registry().await);
    let s = session(&["q1", "q2"]);
    registry.register(&s).await.expect("register");

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let sid = s.id.clone();
            tokio::spawn(async move { registry.complete_questionnaire(&sid, "q1").await })
        })
        .collect();

    let mut removed = 0;
    for task in tasks {
        if task.await.expect("join").expect("complete").removed {
            removed += 1;
        }
    }
    assert_eq!(removed, 1);
    assert!(registry.get(&s.id).await.is_ok());
}

// ── Registration and status ──────────────────────────────────

#[tokio::test]
async fn duplicate_registration_rejected() {
    let registry = registry().await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");

    let err = registry.register(&s).await.expect_err("duplicate id");
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn duplicate_pending_ids_rejected_at_register() {
    let registry = registry().await;
    let mut s = session(&["q1"]);
    s.pending_questionnaires.push(QuestionnaireRef::new("q1", "again"));

    let err = registry.register(&s).await.expect_err("duplicate pending");
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(registry.get(&s.id).await.is_err());
}

#[tokio::test]
async fn set_status_and_revoke() {
    let registry = registry().await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");

    let updated = registry
        .set_status(&s.id, SessionStatus::Preparing)
        .await
        .expect("preparing");
    assert_eq!(updated.status, SessionStatus::Preparing);

    registry.revoke(&s.id).await.expect("revoke");
    let err = registry.revoke(&s.id).await.expect_err("already revoked");
    assert!(matches!(err, AppError::SessionNotFound(_)));
}

// ── Contention handling ──────────────────────────────────────

/// Store that reports contention for the first `conflicts` status updates.
struct ContendedStore {
    inner: SqliteDocumentStore,
    conflicts: AtomicUsize,
}

impl DocumentStore for ContendedStore {
    fn insert_session(&self, session: &ActivationSession) -> StoreFuture<'_, ()> {
        self.inner.insert_session(session)
    }

    fn find_session_by_id(&self, id: &str) -> StoreFuture<'_, Option<ActivationSession>> {
        self.inner.find_session_by_id(id)
    }

    fn find_bundle_by_id(&self, id: &str) -> StoreFuture<'_, Option<Bundle>> {
        self.inner.find_bundle_by_id(id)
    }

    fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreFuture<'_, ActivationSession> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Box::pin(async {
                Err::<ActivationSession, _>(AppError::RegistryConflict(
                    "database is locked".into(),
                ))
            });
        }
        self.inner.update_session_status(id, status)
    }

    fn update_session_pending_set(
        &self,
        id: &str,
        remove_questionnaire_id: &str,
    ) -> StoreFuture<'_, Option<PendingUpdate>> {
        self.inner.update_session_pending_set(id, remove_questionnaire_id)
    }

    fn delete_session(&self, id: &str) -> StoreFuture<'_, bool> {
        self.inner.delete_session(id)
    }

    fn list_session_ids(&self) -> StoreFuture<'_, Vec<String>> {
        self.inner.list_session_ids()
    }

    fn append_completion_record(&self, record: &CompletionRecord) -> StoreFuture<'_, ()> {
        self.inner.append_completion_record(record)
    }

    fn insert_result(&self, result: &QuestionnaireResult) -> StoreFuture<'_, String> {
        self.inner.insert_result(result)
    }
}

async fn contended_registry(conflicts: usize) -> SessionRegistry {
    let pool = db::connect_memory().await.expect("db connect");
    SessionRegistry::new(Arc::new(ContendedStore {
        inner: SqliteDocumentStore::new(Arc::new(pool)),
        conflicts: AtomicUsize::new(conflicts),
    }))
}

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let registry = contended_registry(2).await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");

    let updated = registry
        .set_status(&s.id, SessionStatus::Preparing)
        .await
        .expect("succeeds after retries");
    assert_eq!(updated.status, SessionStatus::Preparing);
}

#[tokio::test]
async fn persistent_conflict_surfaces_as_db_error() {
    let registry = contended_registry(100).await;
    let s = session(&["q1"]);
    registry.register(&s).await.expect("register");

    let err = registry
        .set_status(&s.id, SessionStatus::Preparing)
        .await
        .expect_err("gives up");
    assert!(matches!(err, AppError::Db(_)));
}
