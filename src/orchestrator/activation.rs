//! The activation pipeline: prepare, launch, await readiness.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use super::{ActivationOutcome, Orchestrator};
use crate::models::session::{ActivationSession, SessionStatus};
use crate::notifier::{ReadinessEvent, ReadinessSubscription};
use crate::worker::{ReadyOutcome, WorkerHandle, WorkerState};
use crate::{AppError, Result};

impl Orchestrator {
    /// Bring the session's worker up and return its endpoint.
    ///
    /// Calls for the same session serialize. A session whose worker is
    /// already serving gets the existing endpoint without re-preparing. A
    /// failed attempt leaves the session `Failed` with its workspace and
    /// logs on disk; calling again starts a fresh attempt.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound`: link consumed or never issued.
    /// - `AppError::BundleUnavailable`, `AppError::WorkspaceCorrupt`,
    ///   `AppError::TrainingFailed`, `AppError::LaunchFailed`,
    ///   `AppError::ReadinessTimeout`: the attempt failed.
    pub async fn activate(self: &Arc<Self>, session_id: &str) -> Result<ActivationOutcome> {
        let _guard = self.activations.lock(session_id).await;

        let session = self.registry.get(session_id).await?;

        if let Some(worker) = self.worker(session_id) {
            if worker.is_running() {
                if session.status == SessionStatus::Ready {
                    self.registry
                        .set_status(session_id, SessionStatus::Serving)
                        .await?;
                }
                info!(session_id, endpoint = worker.endpoint(), "worker already serving");
                return Ok(serving(&worker));
            }
            // Crashed or stopped; clear it before relaunching.
            self.stop_worker(session_id).await;
        }

        let span = info_span!(
            "activate",
            session_id,
            chatbot_id = %session.chatbot_id
        );
        self.start_attempt(session).instrument(span).await
    }

    /// Endpoint to interact with, only while the session's worker serves.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound`: link consumed or never issued.
    /// - `AppError::WorkerUnavailable`: not activated yet, or the worker
    ///   crashed or stopped. Interaction resumes after a fresh `activate`.
    pub async fn interaction_endpoint(&self, session_id: &str) -> Result<String> {
        let session = self.registry.get(session_id).await?;
        match self.worker(session_id) {
            Some(worker) if worker.is_running() => Ok(worker.endpoint().to_owned()),
            Some(worker) => Err(AppError::WorkerUnavailable(format!(
                "worker for session {session_id} is {:?}",
                worker.state()
            ))),
            None => Err(AppError::WorkerUnavailable(format!(
                "session {session_id} has no worker (status {})",
                session.status.as_str()
            ))),
        }
    }

    /// Observe readiness for a live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the session is not live.
    pub async fn subscribe_readiness(&self, session_id: &str) -> Result<ReadinessSubscription> {
        self.registry.get(session_id).await?;
        Ok(self.notifier.subscribe(session_id))
    }

    async fn start_attempt(self: &Arc<Self>, session: ActivationSession) -> Result<ActivationOutcome> {
        let session_id = session.id.clone();

        if session.status.is_in_flight() {
            // Left over from a crashed worker or a previous process.
            self.registry
                .set_status(&session_id, SessionStatus::Failed)
                .await?;
        }
        self.notifier.reset(&session_id);
        self.registry
            .set_status(&session_id, SessionStatus::Preparing)
            .await?;

        match self.run_pipeline(&session).await {
            Ok(worker) => {
                info!(endpoint = worker.endpoint(), "session serving");
                Ok(serving(&worker))
            }
            Err(err) => {
                warn!(%err, "activation failed");
                self.notifier.publish(
                    &session_id,
                    ReadinessEvent::Failed {
                        reason: err.to_string(),
                    },
                );
                self.stop_worker(&session_id).await;
                if let Err(status_err) = self
                    .registry
                    .set_status(&session_id, SessionStatus::Failed)
                    .await
                {
                    warn!(%status_err, "could not mark session failed");
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(self: &Arc<Self>, session: &ActivationSession) -> Result<WorkerHandle> {
        let session_id = session.id.as_str();

        let bundle = self
            .store
            .find_bundle_by_id(&session.chatbot_id)
            .await
            .map_err(|err| AppError::BundleUnavailable(err.to_string()))?
            .ok_or_else(|| {
                AppError::BundleUnavailable(format!("chatbot {} not found", session.chatbot_id))
            })?;

        let workspace = self.preparer.prepare(session_id, &bundle.archive_id).await?;

        let training = self.supervisor.trains_before_launch();
        if training {
            self.registry
                .set_status(session_id, SessionStatus::Training)
                .await?;
        }

        let worker = self.supervisor.launch(&workspace)?;
        self.attach_worker(&worker);

        if training {
            let state = worker
                .wait_for_state(|state| *state != WorkerState::Training)
                .await;
            if state == WorkerState::Crashed {
                return Err(worker.failure().map_or_else(
                    || AppError::TrainingFailed("training ended without a result".into()),
                    |failure| failure.to_error(),
                ));
            }
        }
        self.registry
            .set_status(session_id, SessionStatus::Launching)
            .await?;

        match self
            .supervisor
            .await_ready(&worker, self.readiness_timeout)
            .await
        {
            ReadyOutcome::Ready => {}
            ReadyOutcome::Failed(err) => return Err(err),
            ReadyOutcome::TimedOut => {
                return Err(AppError::ReadinessTimeout(format!(
                    "no readiness marker within {:?}",
                    self.readiness_timeout
                )))
            }
        }

        self.registry
            .set_status(session_id, SessionStatus::Ready)
            .await?;
        self.watch_exit(&worker);
        self.registry
            .set_status(session_id, SessionStatus::Serving)
            .await?;

        Ok(worker)
    }

    /// Mark the session failed if the worker exits without being asked to.
    fn watch_exit(self: &Arc<Self>, worker: &WorkerHandle) {
        let this = Arc::clone(self);
        let worker = worker.clone();
        let span = info_span!("worker_exit_watch", session_id = worker.session_id());

        tokio::spawn(
            async move {
                let state = worker.exited().await;
                if worker.stop_requested() {
                    return;
                }

                let session_id = worker.session_id().to_owned();
                let _guard = this.activations.lock(&session_id).await;

                if !this.detach_if_current(&worker) {
                    return;
                }
                warn!(?state, "worker exited while serving");
                this.notifier.reset(&session_id);
                this.notifier.publish(
                    &session_id,
                    ReadinessEvent::Failed {
                        reason: format!("worker {state:?} while serving"),
                    },
                );
                match this
                    .registry
                    .set_status(&session_id, SessionStatus::Failed)
                    .await
                {
                    Ok(_) | Err(AppError::SessionNotFound(_)) => {}
                    Err(err) => warn!(%err, "could not mark session failed"),
                }
            }
            .instrument(span),
        );
    }
}

fn serving(worker: &WorkerHandle) -> ActivationOutcome {
    ActivationOutcome {
        servable: true,
        endpoint: Some(worker.endpoint().to_owned()),
    }
}
