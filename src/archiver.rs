//! Completion archiving.

use std::sync::Arc;

use tracing::{error, info};

use crate::models::completion::CompletionRecord;
use crate::store::DocumentStore;
use crate::Result;

/// Appends immutable completion records.
///
/// Archiving is a separate effect from retirement: a failure here is
/// returned to the caller for reporting but never undoes a retirement.
pub struct CompletionArchiver {
    store: Arc<dyn DocumentStore>,
}

impl CompletionArchiver {
    /// Create an archiver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Append `record`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the append fails.
    pub async fn archive(&self, record: &CompletionRecord) -> Result<()> {
        match self.store.append_completion_record(record).await {
            Ok(()) => {
                info!(
                    participant_id = %record.participant_id,
                    questionnaire_id = %record.questionnaire_id,
                    result_id = %record.result_id,
                    "completion archived"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    participant_id = %record.participant_id,
                    questionnaire_id = %record.questionnaire_id,
                    %err,
                    "failed to archive completion"
                );
                Err(err)
            }
        }
    }
}
