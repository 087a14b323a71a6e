//! Per-session workspace directories.

pub mod preparer;
pub mod sweeper;

pub use preparer::{WorkspaceHandle, WorkspacePreparer, READY_MARKER};
