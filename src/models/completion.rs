//! Completion records and stored questionnaire results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable record appended when a questionnaire instance is finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Record identifier.
    pub id: String,
    /// Evaluator who issued the session.
    pub user_id: String,
    /// Participant who answered.
    pub participant_id: String,
    /// Completion date as reported by the caller.
    pub date: DateTime<Utc>,
    /// Finished questionnaire.
    pub questionnaire_id: String,
    /// Chatbot the session deployed.
    pub chatbot_id: String,
    /// Stored answers this completion refers to.
    pub result_id: String,
}

impl CompletionRecord {
    /// Construct a record with a generated identifier.
    #[must_use]
    pub fn new(
        user_id: String,
        participant_id: String,
        date: DateTime<Utc>,
        questionnaire_id: String,
        chatbot_id: String,
        result_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            participant_id,
            date,
            questionnaire_id,
            chatbot_id,
            result_id,
        }
    }
}

/// Answers submitted for one questionnaire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionnaireResult {
    /// Result identifier returned to the caller.
    pub id: String,
    /// Chatbot the answers evaluate.
    pub chatbot_id: String,
    /// Participant who answered.
    pub participant_id: String,
    /// Questionnaire answered.
    pub questionnaire_id: String,
    /// Raw answers payload.
    pub answers: serde_json::Value,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

impl QuestionnaireResult {
    /// Construct a result with a generated identifier.
    #[must_use]
    pub fn new(
        chatbot_id: String,
        participant_id: String,
        questionnaire_id: String,
        answers: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chatbot_id,
            participant_id,
            questionnaire_id,
            answers,
            created_at: Utc::now(),
        }
    }
}
