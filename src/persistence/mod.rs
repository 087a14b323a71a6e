//! Persistence layer modules.

pub mod bundle_repo;
pub mod completion_repo;
pub mod db;
pub mod result_repo;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
