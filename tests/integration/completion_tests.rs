//! Questionnaire submission, completion archiving and session retirement.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use activation_orchestrator::models::session::SessionStatus;
use activation_orchestrator::orchestrator::{CompletionMetadata, Orchestrator};
use activation_orchestrator::worker::WorkerState;
use activation_orchestrator::AppError;
use chrono::{TimeZone, Utc};
use serde_json::json;

use super::test_helpers::{
    pending, CountingBundleStore, FailingArchiveStore, TestEnv, READY_SCRIPT,
};

fn metadata(result_id: &str) -> CompletionMetadata {
    CompletionMetadata {
        result_id: result_id.to_owned(),
        date: None,
    }
}

#[tokio::test]
async fn two_questionnaires_retire_after_both_complete() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1", "q2"]).await;
    env.orchestrator.activate(&session.id).await.expect("activate");
    let worker = env.orchestrator.worker(&session.id).expect("worker attached");

    let r1 = env
        .orchestrator
        .submit_result(&session.id, "q1", json!({ "score": 72 }))
        .await
        .expect("submit q1");
    let first = env
        .orchestrator
        .complete_questionnaire(&session.id, "q1", metadata(&r1))
        .await
        .expect("complete q1");
    assert!(!first.retired);
    assert!(first.archived);

    let summary = env
        .orchestrator
        .get_session_summary(&session.id)
        .await
        .expect("still live");
    let remaining: Vec<_> = summary
        .pending_questionnaires
        .iter()
        .map(|q| q.id.as_str())
        .collect();
    assert_eq!(remaining, ["q2"]);
    assert!(summary.endpoint.is_some(), "worker keeps serving");

    let r2 = env
        .orchestrator
        .submit_result(&session.id, "q2", json!({ "score": 80 }))
        .await
        .expect("submit q2");
    let second = env
        .orchestrator
        .complete_questionnaire(&session.id, "q2", metadata(&r2))
        .await
        .expect("complete q2");
    assert!(second.retired);
    assert!(second.archived);

    let records = env
        .store
        .completions()
        .list_for_participant("participant-1")
        .await
        .expect("records");
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.chatbot_id == env.chatbot.id && r.user_id == "evaluator-1"));
    let mut result_ids: Vec<_> = records.iter().map(|r| r.result_id.clone()).collect();
    result_ids.sort();
    let mut expected = vec![r1, r2];
    expected.sort();
    assert_eq!(result_ids, expected);

    // Retirement releases everything the session held.
    assert_eq!(env.status(&session.id).await, None);
    assert!(!env.workspace(&session.id).exists());
    assert_eq!(env.orchestrator.worker_count(), 0);
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(env.orchestrator.notifier().current(&session.id).is_none());

    let err = env
        .orchestrator
        .activate(&session.id)
        .await
        .expect_err("link consumed");
    assert!(matches!(err, AppError::SessionNotFound(_)));
}

#[tokio::test]
async fn completion_date_is_recorded_as_given() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1", "q2"]).await;
    let date = Utc
        .with_ymd_and_hms(2026, 5, 4, 13, 30, 0)
        .single()
        .expect("date");

    env.orchestrator
        .complete_questionnaire(
            &session.id,
            "q1",
            CompletionMetadata {
                result_id: "r-1".into(),
                date: Some(date),
            },
        )
        .await
        .expect("complete");

    let records = env
        .store
        .completions()
        .list_for_participant("participant-1")
        .await
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].date, date);
    assert_eq!(records[0].questionnaire_id, "q1");
}

#[tokio::test]
async fn completing_a_non_pending_questionnaire_is_a_noop() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1"]).await;

    let outcome = env
        .orchestrator
        .complete_questionnaire(&session.id, "unrelated", metadata("r-x"))
        .await
        .expect("no-op");
    assert!(!outcome.retired);
    assert!(!outcome.archived);
    assert!(outcome.archive_error.is_none());

    let records = env
        .store
        .completions()
        .list_for_participant("participant-1")
        .await
        .expect("records");
    assert!(records.is_empty());
    assert_eq!(env.status(&session.id).await, Some(SessionStatus::Created));
}

#[tokio::test]
async fn retirement_without_activation_is_allowed() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1"]).await;

    let outcome = env
        .orchestrator
        .complete_questionnaire(&session.id, "q1", metadata("r-1"))
        .await
        .expect("complete");
    assert!(outcome.retired);
    assert_eq!(env.status(&session.id).await, None);
}

#[tokio::test]
async fn archive_failure_does_not_undo_retirement() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let failing = Arc::new(FailingArchiveStore {
        inner: Arc::clone(&env.store),
    });
    let orchestrator =
        Orchestrator::new(&env.config, failing, env.store.clone()).expect("orchestrator");
    let session = orchestrator
        .issue_session(&env.chatbot.id, "participant-1", "evaluator-1", pending(&["q1"]))
        .await
        .expect("issue");

    let outcome = orchestrator
        .complete_questionnaire(&session.id, "q1", metadata("r-1"))
        .await
        .expect("completion still succeeds");
    assert!(outcome.retired);
    assert!(!outcome.archived);
    assert!(outcome
        .archive_error
        .as_deref()
        .is_some_and(|msg| msg.contains("read-only")));
    assert_eq!(env.status(&session.id).await, None, "retired regardless");
}

#[tokio::test]
async fn submit_requires_a_pending_questionnaire() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1"]).await;

    let err = env
        .orchestrator
        .submit_result(&session.id, "q9", json!({}))
        .await
        .expect_err("not pending");
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = env
        .orchestrator
        .submit_result("deadbeef", "q1", json!({}))
        .await
        .expect_err("unknown session");
    assert!(matches!(err, AppError::SessionNotFound(_)));

    let id = env
        .orchestrator
        .submit_result(&session.id, "q1", json!({ "a": [1, 2, 3] }))
        .await
        .expect("submit");
    let stored = env
        .store
        .results()
        .get_by_id(&id)
        .await
        .expect("query")
        .expect("stored");
    assert_eq!(stored.participant_id, "participant-1");
    assert_eq!(stored.answers, json!({ "a": [1, 2, 3] }));
}

#[tokio::test]
async fn concurrent_final_completions_retire_once() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1", "q2", "q3"]).await;
    env.orchestrator.activate(&session.id).await.expect("activate");

    let tasks: Vec<_> = ["q1", "q2", "q3"]
        .into_iter()
        .map(|qid| {
            let orchestrator = Arc::clone(&env.orchestrator);
            let id = session.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .complete_questionnaire(&id, qid, metadata(&format!("r-{qid}")))
                    .await
            })
        })
        .collect();

    let mut retired = 0;
    for task in tasks {
        if task.await.expect("join").expect("complete").retired {
            retired += 1;
        }
    }
    assert_eq!(retired, 1);

    let records = env
        .store
        .completions()
        .list_for_participant("participant-1")
        .await
        .expect("records");
    assert_eq!(records.len(), 3);

    assert_eq!(env.orchestrator.worker_count(), 0);
    assert!(!env.workspace(&session.id).exists());
}

#[tokio::test]
async fn retirement_during_activation_leaves_nothing_behind() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let slow = Arc::new(CountingBundleStore::new(
        Arc::clone(&env.store),
        Duration::from_millis(600),
    ));
    let orchestrator =
        Orchestrator::new(&env.config, env.store.clone(), slow).expect("orchestrator");
    let session = orchestrator
        .issue_session(&env.chatbot.id, "participant-1", "evaluator-1", pending(&["q1"]))
        .await
        .expect("issue");

    let activation = {
        let orchestrator = Arc::clone(&orchestrator);
        let id = session.id.clone();
        tokio::spawn(async move { orchestrator.activate(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = orchestrator
        .complete_questionnaire(&session.id, "q1", metadata("r-1"))
        .await
        .expect("complete");
    assert!(outcome.retired);

    let activated = activation.await.expect("join");
    assert!(matches!(activated, Err(AppError::SessionNotFound(_))));

    assert!(!env.workspace(&session.id).exists(), "workspace released");
    assert!(orchestrator.notifier().current(&session.id).is_none());
    assert_eq!(orchestrator.worker_count(), 0);
    assert_eq!(orchestrator.activation_locks(), 0);
}

#[tokio::test]
async fn revoke_consumes_the_link() {
    let env = TestEnv::new(READY_SCRIPT).await;
    let session = env.issue(&["q1"]).await;
    env.orchestrator.activate(&session.id).await.expect("activate");

    env.orchestrator.revoke(&session.id).await.expect("revoke");
    assert_eq!(env.status(&session.id).await, None);
    assert_eq!(env.orchestrator.worker_count(), 0);
    assert!(!env.workspace(&session.id).exists());

    let err = env.orchestrator.revoke(&session.id).await.expect_err("gone");
    assert!(matches!(err, AppError::SessionNotFound(_)));
}
