//! Domain model module declarations.

pub mod bundle;
pub mod completion;
pub mod session;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// Parse an RFC 3339 column value into a UTC timestamp.
pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}
