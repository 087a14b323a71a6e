//! Activation session model and lifecycle helpers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Lifecycle status for an activation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Issued, no activation attempted yet.
    Created,
    /// Workspace is being materialized.
    Preparing,
    /// Engine training phase running.
    Training,
    /// Engine process spawned, waiting for readiness.
    Launching,
    /// Engine emitted its readiness marker.
    Ready,
    /// Endpoint handed out to the participant.
    Serving,
    /// Last activation attempt failed; may be re-triggered.
    Failed,
    /// Every questionnaire answered; link consumed.
    Retired,
}

impl SessionStatus {
    /// Stable lowercase name used for persistence.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::Training => "training",
            Self::Launching => "launching",
            Self::Ready => "ready",
            Self::Serving => "serving",
            Self::Failed => "failed",
            Self::Retired => "retired",
        }
    }

    /// Parse the persisted status name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "preparing" => Ok(Self::Preparing),
            "training" => Ok(Self::Training),
            "launching" => Ok(Self::Launching),
            "ready" => Ok(Self::Ready),
            "serving" => Ok(Self::Serving),
            "failed" => Ok(Self::Failed),
            "retired" => Ok(Self::Retired),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }

    /// Statuses reached only while an activation pipeline is in flight or
    /// a worker is attached.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Training | Self::Launching | Self::Ready | Self::Serving
        )
    }
}

/// Reference to one questionnaire instance the participant still owes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionnaireRef {
    /// Questionnaire identifier; unique within a pending set.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl QuestionnaireRef {
    /// Build a reference from id and display name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One participant's single-use activation of a deployed chatbot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationSession {
    /// Opaque token; also the activation URL key.
    pub id: String,
    /// Chatbot (bundle document) the session deploys.
    pub chatbot_id: String,
    /// Evaluated participant.
    pub participant_id: String,
    /// Evaluator who issued the link.
    pub user_id: String,
    /// Ordered questionnaires still owed.
    pub pending_questionnaires: Vec<QuestionnaireRef>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Issue timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ActivationSession {
    /// Construct a new session with a generated identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if two pending questionnaires share an id.
    pub fn new(
        chatbot_id: String,
        participant_id: String,
        user_id: String,
        pending_questionnaires: Vec<QuestionnaireRef>,
    ) -> Result<Self> {
        ensure_unique(&pending_questionnaires)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            chatbot_id,
            participant_id,
            user_id,
            pending_questionnaires,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `questionnaire_id` is still owed.
    #[must_use]
    pub fn is_pending(&self, questionnaire_id: &str) -> bool {
        self.pending_questionnaires
            .iter()
            .any(|q| q.id == questionnaire_id)
    }

    /// Remove `questionnaire_id` from the pending set.
    ///
    /// Returns `false` when it was not pending.
    pub fn remove_pending(&mut self, questionnaire_id: &str) -> bool {
        let before = self.pending_questionnaires.len();
        self.pending_questionnaires
            .retain(|q| q.id != questionnaire_id);
        self.pending_questionnaires.len() != before
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::{
            Created, Failed, Launching, Preparing, Ready, Retired, Serving, Training,
        };

        matches!(
            (self.status, next),
            (Created | Failed, Preparing)
                | (Preparing, Training | Launching)
                | (Training, Launching)
                | (Launching, Ready)
                | (Ready, Serving)
                | (Preparing | Training | Launching | Ready | Serving, Failed | Created)
                | (
                    Created | Preparing | Training | Launching | Ready | Serving | Failed,
                    Retired
                )
        )
    }
}

/// Reject pending sets that repeat a questionnaire id.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` naming the first duplicate.
pub fn ensure_unique(pending: &[QuestionnaireRef]) -> Result<()> {
    let mut seen = HashSet::with_capacity(pending.len());
    for q in pending {
        if !seen.insert(q.id.as_str()) {
            return Err(AppError::InvalidInput(format!(
                "duplicate questionnaire id {} in pending set",
                q.id
            )));
        }
    }
    Ok(())
}
