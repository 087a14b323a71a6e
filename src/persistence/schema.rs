//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so it is safe to
//! re-run on every server startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS activation_session (
    id              TEXT PRIMARY KEY NOT NULL,
    chatbot_id      TEXT NOT NULL,
    participant_id  TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    pending_questionnaires TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('created','preparing','training','launching','ready','serving','failed','retired')),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chatbot (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    archive_id      TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bundle_archive (
    id              TEXT PRIMARY KEY NOT NULL,
    data            BLOB NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS questionnaire_result (
    id              TEXT PRIMARY KEY NOT NULL,
    chatbot_id      TEXT NOT NULL,
    participant_id  TEXT NOT NULL,
    questionnaire_id TEXT NOT NULL,
    answers         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS completion_record (
    id              TEXT PRIMARY KEY NOT NULL,
    user_id         TEXT NOT NULL,
    participant_id  TEXT NOT NULL,
    date            TEXT NOT NULL,
    questionnaire_id TEXT NOT NULL,
    chatbot_id      TEXT NOT NULL,
    result_id       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_chatbot ON activation_session(chatbot_id);
CREATE INDEX IF NOT EXISTS idx_result_chatbot ON questionnaire_result(chatbot_id);
CREATE INDEX IF NOT EXISTS idx_completion_participant ON completion_record(participant_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
