#![forbid(unsafe_code)]

//! One-time activation links that deploy a packaged chatbot into an
//! isolated workspace, supervise its engine process and track the
//! questionnaires the participant still owes.

pub mod archiver;
pub mod config;
pub mod errors;
pub mod http;
pub mod locks;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod worker;
pub mod workspace;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
