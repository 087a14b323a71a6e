use activation_orchestrator::models::session::{
    ensure_unique, ActivationSession, QuestionnaireRef, SessionStatus,
};
use activation_orchestrator::AppError;

fn refs(ids: &[&str]) -> Vec<QuestionnaireRef> {
    ids.iter()
        .map(|id| QuestionnaireRef::new(*id, id.to_uppercase()))
        .collect()
}

fn session(ids: &[&str]) -> ActivationSession {
    ActivationSession::new("bot-1".into(), "p-1".into(), "u-1".into(), refs(ids))
        .expect("valid session")
}

#[test]
fn new_session_starts_created_with_opaque_id() {
    let s = session(&["q1", "q2"]);
    assert_eq!(s.status, SessionStatus::Created);
    assert_eq!(s.id.len(), 32);
    assert!(s.id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(s.pending_questionnaires.len(), 2);
}

#[test]
fn ids_are_unique_per_issue() {
    let a = session(&["q1"]);
    let b = session(&["q1"]);
    assert_ne!(a.id, b.id);
}

#[test]
fn duplicate_pending_ids_rejected() {
    let err = ActivationSession::new("bot".into(), "p".into(), "u".into(), refs(&["q1", "q1"]))
        .expect_err("duplicates rejected");
    assert!(matches!(err, AppError::InvalidInput(_)));
    assert!(ensure_unique(&refs(&["a", "b", "c"])).is_ok());
}

#[test]
fn remove_pending_preserves_order() {
    let mut s = session(&["q1", "q2", "q3"]);
    assert!(s.remove_pending("q2"));
    let remaining: Vec<_> = s.pending_questionnaires.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(remaining, ["q1", "q3"]);
}

#[test]
fn remove_pending_unknown_is_noop() {
    let mut s = session(&["q1"]);
    assert!(!s.remove_pending("q9"));
    assert!(s.is_pending("q1"));
    assert!(!s.is_pending("q9"));
}

#[test]
fn in_flight_statuses() {
    assert!(!SessionStatus::Created.is_in_flight());
    assert!(!SessionStatus::Failed.is_in_flight());
    assert!(!SessionStatus::Retired.is_in_flight());
    assert!(SessionStatus::Launching.is_in_flight());
    assert!(SessionStatus::Serving.is_in_flight());
}

#[test]
fn serving_may_fall_back_to_failed_or_created() {
    let mut s = session(&["q1"]);
    s.status = SessionStatus::Serving;
    assert!(s.can_transition_to(SessionStatus::Failed));
    assert!(s.can_transition_to(SessionStatus::Created));
    assert!(s.can_transition_to(SessionStatus::Retired));
    assert!(!s.can_transition_to(SessionStatus::Launching));
}

#[test]
fn training_is_optional_between_preparing_and_launching() {
    let mut s = session(&["q1"]);
    s.status = SessionStatus::Preparing;
    assert!(s.can_transition_to(SessionStatus::Training));
    assert!(s.can_transition_to(SessionStatus::Launching));
    s.status = SessionStatus::Training;
    assert!(s.can_transition_to(SessionStatus::Launching));
    assert!(!s.can_transition_to(SessionStatus::Ready));
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&SessionStatus::Serving).expect("serialize");
    assert_eq!(json, "\"serving\"");
}
