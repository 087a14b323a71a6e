//! Chatbot document and bundle archive repository.

use std::sync::Arc;

use chrono::Utc;

use crate::models::bundle::Bundle;
use crate::models::parse_timestamp;
use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for chatbot documents and their archives.
#[derive(Clone)]
pub struct BundleRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct BundleRow {
    id: String,
    name: String,
    user_id: String,
    archive_id: String,
    created_at: String,
}

impl BundleRow {
    fn into_bundle(self) -> Result<Bundle> {
        Ok(Bundle {
            id: self.id,
            name: self.name,
            user_id: self.user_id,
            archive_id: self.archive_id,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

impl BundleRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a chatbot document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, bundle: &Bundle) -> Result<Bundle> {
        sqlx::query(
            "INSERT INTO chatbot (id, name, user_id, archive_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&bundle.id)
        .bind(&bundle.name)
        .bind(&bundle.user_id)
        .bind(&bundle.archive_id)
        .bind(bundle.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(bundle.clone())
    }

    /// Retrieve a chatbot document by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Bundle>> {
        let row: Option<BundleRow> = sqlx::query_as("SELECT * FROM chatbot WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(BundleRow::into_bundle).transpose()
    }

    /// Store raw archive bytes under `archive_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn put_archive(&self, archive_id: &str, data: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO bundle_archive (id, data, created_at) VALUES (?1, ?2, ?3)")
            .bind(archive_id)
            .bind(data)
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Fetch raw archive bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_archive(&self, archive_id: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM bundle_archive WHERE id = ?1")
                .bind(archive_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row.map(|(data,)| data))
    }
}
