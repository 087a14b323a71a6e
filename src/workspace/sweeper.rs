//! Background reclamation of orphaned workspaces.
//!
//! A workspace is orphaned when its directory outlives the session that
//! owned it, e.g. after a crash between retirement and cleanup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::WorkspacePreparer;
use crate::store::DocumentStore;
use crate::Result;

/// Spawn the orphan sweep background task.
///
/// The first sweep runs immediately, then every `interval`.
#[must_use]
pub fn spawn_sweep_task(
    preparer: Arc<WorkspacePreparer>,
    store: Arc<dyn DocumentStore>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("workspace sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = sweep_once(&preparer, store.as_ref(), max_age).await {
                        error!(%err, "workspace sweep failed");
                    }
                }
            }
        }
    })
}

/// Run one sweep pass. Returns the number of workspaces removed.
///
/// # Errors
///
/// Returns an error if live sessions cannot be listed or the workspace root
/// cannot be read.
pub async fn sweep_once(
    preparer: &WorkspacePreparer,
    store: &dyn DocumentStore,
    max_age: Duration,
) -> Result<usize> {
    let live: HashSet<String> = store.list_session_ids().await?.into_iter().collect();
    let removed = preparer.sweep_orphans(&live, max_age).await?;
    if removed > 0 {
        info!(removed, live = live.len(), "orphaned workspaces reclaimed");
    }
    Ok(removed)
}
