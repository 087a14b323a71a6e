//! Activation and deployment orchestration.
//!
//! [`Orchestrator`] ties the registry, workspace preparer, worker supervisor,
//! readiness notifier and completion archiver together behind the request
//! surface: activate, summary, submit, complete, plus issuance, revocation
//! and shutdown.

mod activation;
mod admin;
mod completion;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::archiver::CompletionArchiver;
use crate::config::GlobalConfig;
use crate::locks::KeyedLocks;
use crate::models::session::{QuestionnaireRef, SessionStatus};
use crate::notifier::ReadinessNotifier;
use crate::registry::SessionRegistry;
use crate::store::{BundleStore, DocumentStore};
use crate::worker::{PortAllocator, WorkerHandle, WorkerSupervisor};
use crate::workspace::WorkspacePreparer;
use crate::Result;

pub use completion::{CompletionMetadata, CompletionOutcome};

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationOutcome {
    /// Whether the worker is serving.
    pub servable: bool,
    /// URL the participant interacts with.
    pub endpoint: Option<String>,
}

/// Caller-facing view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Deployed chatbot.
    pub chatbot_id: String,
    /// Participant.
    pub participant_id: String,
    /// Questionnaires still owed, in order.
    pub pending_questionnaires: Vec<QuestionnaireRef>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Endpoint of the serving worker, if any.
    pub endpoint: Option<String>,
}

/// Orchestrates activation sessions end to end.
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    registry: SessionRegistry,
    preparer: Arc<WorkspacePreparer>,
    supervisor: WorkerSupervisor,
    notifier: Arc<ReadinessNotifier>,
    archiver: CompletionArchiver,
    readiness_timeout: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    activations: KeyedLocks,
}

impl Orchestrator {
    /// Assemble an orchestrator from configuration and store collaborators.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the engine readiness pattern is invalid.
    pub fn new(
        config: &GlobalConfig,
        store: Arc<dyn DocumentStore>,
        bundles: Arc<dyn BundleStore>,
    ) -> Result<Arc<Self>> {
        let notifier = Arc::new(ReadinessNotifier::new());
        let supervisor = WorkerSupervisor::new(
            config.engine.clone(),
            PortAllocator::new(config.ports),
            Arc::clone(&notifier),
        )?;
        let preparer = Arc::new(WorkspacePreparer::new(
            config.workspace_root.clone(),
            config.shared_files_dir.clone(),
            bundles,
        ));

        Ok(Arc::new(Self {
            registry: SessionRegistry::new(Arc::clone(&store)),
            archiver: CompletionArchiver::new(Arc::clone(&store)),
            store,
            preparer,
            supervisor,
            notifier,
            readiness_timeout: config.engine.readiness_timeout(),
            workers: Mutex::new(HashMap::new()),
            activations: KeyedLocks::new(),
        }))
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Workspace preparer, shared with the orphan sweep.
    #[must_use]
    pub fn preparer(&self) -> &Arc<WorkspacePreparer> {
        &self.preparer
    }

    /// Readiness notifier.
    #[must_use]
    pub fn notifier(&self) -> &Arc<ReadinessNotifier> {
        &self.notifier
    }

    /// Worker supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Worker currently attached to `session_id`.
    #[must_use]
    pub fn worker(&self, session_id: &str) -> Option<WorkerHandle> {
        self.lock_workers().get(session_id).cloned()
    }

    /// Number of attached workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    fn attach_worker(&self, worker: &WorkerHandle) {
        self.lock_workers()
            .insert(worker.session_id().to_owned(), worker.clone());
    }

    fn detach_worker(&self, session_id: &str) -> Option<WorkerHandle> {
        self.lock_workers().remove(session_id)
    }

    /// Detach `worker` only if it is still the one attached to its session.
    fn detach_if_current(&self, worker: &WorkerHandle) -> bool {
        let mut workers = self.lock_workers();
        let current = workers
            .get(worker.session_id())
            .is_some_and(|attached| attached.same_worker(worker));
        if current {
            workers.remove(worker.session_id());
        }
        current
    }

    async fn stop_worker(&self, session_id: &str) {
        if let Some(worker) = self.detach_worker(session_id) {
            self.supervisor.stop(&worker).await;
        }
    }

    /// Sessions with an activation, revocation or release in progress.
    #[must_use]
    pub fn activation_locks(&self) -> usize {
        self.activations.len()
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
