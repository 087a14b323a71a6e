//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Bundle document or archive could not be fetched. Retryable.
    BundleUnavailable(String),
    /// Unpacking the bundle or injecting shared files failed.
    WorkspaceCorrupt(String),
    /// The engine training phase exited unsuccessfully.
    TrainingFailed(String),
    /// The engine process could not be spawned or died before readiness.
    LaunchFailed(String),
    /// The engine never emitted its readiness marker in time.
    ReadinessTimeout(String),
    /// Activation link already consumed or never issued.
    SessionNotFound(String),
    /// Concurrent mutation contention on a session record.
    RegistryConflict(String),
    /// Worker crashed or stopped; interaction refused until re-activated.
    WorkerUnavailable(String),
    /// Session status transition not permitted by the lifecycle.
    InvalidTransition(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller supplied an invalid request.
    InvalidInput(String),
}

impl AppError {
    /// Whether the caller may re-trigger the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BundleUnavailable(_)
                | Self::TrainingFailed(_)
                | Self::LaunchFailed(_)
                | Self::ReadinessTimeout(_)
                | Self::WorkerUnavailable(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::BundleUnavailable(msg) => write!(f, "bundle unavailable: {msg}"),
            Self::WorkspaceCorrupt(msg) => write!(f, "workspace corrupt: {msg}"),
            Self::TrainingFailed(msg) => write!(f, "training failed: {msg}"),
            Self::LaunchFailed(msg) => write!(f, "launch failed: {msg}"),
            Self::ReadinessTimeout(msg) => write!(f, "readiness timeout: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::RegistryConflict(msg) => write!(f, "registry conflict: {msg}"),
            Self::WorkerUnavailable(msg) => write!(f, "worker unavailable: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            return Self::RegistryConflict(err.to_string());
        }
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::WorkspaceCorrupt(format!("archive: {err}"))
    }
}

/// `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6), including extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}
