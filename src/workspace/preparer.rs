//! Session-scoped workspace materialization.
//!
//! Every session gets `<workspace_root>/<session_id>/`: the bundle archive
//! unpacked, the shared support files copied over it, and a ready marker
//! holding the bundle digest. Preparation is single-flight per session id
//! and idempotent once the marker exists, including across restarts.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::BundleStore;
use crate::{AppError, Result};

/// File written last during preparation; its presence means the workspace is complete.
pub const READY_MARKER: &str = ".workspace-ready";

/// Materialized workspace owned by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    /// Owning session.
    pub session_id: String,
    /// Workspace directory; the engine's working directory.
    pub path: PathBuf,
    /// Hex SHA-256 of the archive the workspace was unpacked from.
    pub bundle_digest: String,
}

impl WorkspaceHandle {
    /// Directory holding engine output logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }
}

type Slot = Arc<OnceCell<WorkspaceHandle>>;

/// Unpacks bundles into isolated per-session directories.
pub struct WorkspacePreparer {
    root: PathBuf,
    shared_files_dir: Option<PathBuf>,
    bundles: Arc<dyn BundleStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl WorkspacePreparer {
    /// Create a preparer rooted at `root`.
    #[must_use]
    pub fn new(
        root: PathBuf,
        shared_files_dir: Option<PathBuf>,
        bundles: Arc<dyn BundleStore>,
    ) -> Self {
        Self {
            root,
            shared_files_dir,
            bundles,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory containing every workspace.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a session's workspace lives in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if `session_id` is not a safe path component.
    pub fn workspace_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    /// Materialize the workspace for `session_id` from `archive_id`.
    ///
    /// Concurrent first calls for the same session serialize on one slot, so
    /// the archive is fetched and unpacked at most once. Later calls return
    /// the existing handle. A failed attempt leaves the slot empty and the
    /// partial directory on disk for diagnostics; the next call starts over.
    ///
    /// # Errors
    ///
    /// - `AppError::BundleUnavailable`: the archive could not be fetched;
    ///   nothing is written to disk.
    /// - `AppError::WorkspaceCorrupt`: unpacking or the shared-file copy failed.
    pub async fn prepare(&self, session_id: &str, archive_id: &str) -> Result<WorkspaceHandle> {
        let path = self.workspace_path(session_id)?;
        let slot = self.slot(session_id);

        let handle = slot
            .get_or_try_init(|| {
                self.materialize(session_id, archive_id, path)
                    .instrument(info_span!("prepare_workspace", session_id, archive_id))
            })
            .await?;

        Ok(handle.clone())
    }

    /// Handle of an already prepared workspace, if any.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<WorkspaceHandle> {
        self.lock_slots()
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Delete a session's workspace and forget its slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be removed.
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.workspace_path(session_id)?;
        self.lock_slots().remove(session_id);

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(session_id, path = %path.display(), "workspace removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "failed to remove workspace {}: {err}",
                path.display()
            ))),
        }
    }

    /// Remove workspace directories older than `max_age` whose session is
    /// not in `live`. Returns the number of directories removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the workspace root cannot be listed.
    pub async fn sweep_orphans(&self, live: &HashSet<String>, max_age: Duration) -> Result<usize> {
        let root = self.root.clone();
        let live = live.clone();
        let orphans = tokio::task::spawn_blocking(move || find_orphans(&root, &live, max_age))
            .await
            .map_err(|err| AppError::Io(format!("sweep task panicked: {err}")))??;

        let mut removed = 0;
        for session_id in orphans {
            match self.remove(&session_id).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(session_id, %err, "failed to reclaim orphaned workspace"),
            }
        }
        Ok(removed)
    }

    fn slot(&self, session_id: &str) -> Slot {
        Arc::clone(self.lock_slots().entry(session_id.to_owned()).or_default())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn materialize(
        &self,
        session_id: &str,
        archive_id: &str,
        path: PathBuf,
    ) -> Result<WorkspaceHandle> {
        if let Some(digest) = read_marker(&path).await {
            info!(session_id, path = %path.display(), "reusing prepared workspace");
            return Ok(WorkspaceHandle {
                session_id: session_id.to_owned(),
                path,
                bundle_digest: digest,
            });
        }

        let archive = self.bundles.fetch_bundle(archive_id).await.map_err(|err| match err {
            AppError::BundleUnavailable(msg) => AppError::BundleUnavailable(msg),
            other => AppError::BundleUnavailable(other.to_string()),
        })?;
        let digest = format!("{:x}", Sha256::digest(&archive));
        debug!(session_id, bytes = archive.len(), %digest, "bundle fetched");

        let shared = self.shared_files_dir.clone();
        let target = path.clone();
        let marker_digest = digest.clone();
        tokio::task::spawn_blocking(move || {
            unpack_into(&target, archive, shared.as_deref(), &marker_digest)
        })
        .await
        .map_err(|err| AppError::WorkspaceCorrupt(format!("unpack task panicked: {err}")))??;

        info!(session_id, path = %path.display(), %digest, "workspace prepared");

        Ok(WorkspaceHandle {
            session_id: session_id.to_owned(),
            path,
            bundle_digest: digest,
        })
    }
}

/// Session ids become directory names; restrict them to a safe alphabet.
fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "session id {session_id:?} is not a valid workspace name"
        )))
    }
}

async fn read_marker(path: &Path) -> Option<String> {
    let digest = tokio::fs::read_to_string(path.join(READY_MARKER)).await.ok()?;
    let digest = digest.trim();
    (!digest.is_empty()).then(|| digest.to_owned())
}

fn unpack_into(
    target: &Path,
    archive: Vec<u8>,
    shared_files_dir: Option<&Path>,
    digest: &str,
) -> Result<()> {
    let corrupt = |what: &str, err: &dyn std::fmt::Display| {
        AppError::WorkspaceCorrupt(format!("{what} {}: {err}", target.display()))
    };

    if target.exists() {
        // Leftover from a failed attempt.
        fs::remove_dir_all(target).map_err(|e| corrupt("clear stale", &e))?;
    }
    fs::create_dir_all(target).map_err(|e| corrupt("create", &e))?;

    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    zip.extract(target)?;

    if let Some(shared) = shared_files_dir {
        copy_shared_files(shared, target)?;
    }

    fs::write(target.join(READY_MARKER), digest).map_err(|e| corrupt("write marker", &e))?;
    Ok(())
}

/// Copy every regular file in `shared` into `target`, overwriting bundle files.
fn copy_shared_files(shared: &Path, target: &Path) -> Result<()> {
    let entries = fs::read_dir(shared).map_err(|err| {
        AppError::WorkspaceCorrupt(format!(
            "cannot list shared files {}: {err}",
            shared.display()
        ))
    })?;

    for entry in entries {
        let entry = entry.map_err(|err| AppError::WorkspaceCorrupt(err.to_string()))?;
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let dest = target.join(entry.file_name());
        fs::copy(&source, &dest).map_err(|err| {
            AppError::WorkspaceCorrupt(format!(
                "copy {} -> {}: {err}",
                source.display(),
                dest.display()
            ))
        })?;
    }
    Ok(())
}

fn find_orphans(root: &Path, live: &HashSet<String>, max_age: Duration) -> Result<Vec<String>> {
    let now = SystemTime::now();
    let mut orphans = Vec::new();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(orphans),
        Err(err) => return Err(err.into()),
    };

    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if live.contains(&name) || validate_session_id(&name).is_err() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= max_age {
            orphans.push(name);
        }
    }
    Ok(orphans)
}
