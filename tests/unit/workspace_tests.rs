use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use activation_orchestrator::store::{BundleStore, StoreFuture};
use activation_orchestrator::workspace::{WorkspacePreparer, READY_MARKER};
use activation_orchestrator::AppError;

fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(contents.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish").into_inner()
}

/// In-memory bundle store with a fetch counter and optional latency.
struct MemoryBundles {
    archives: Vec<(String, Vec<u8>)>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl MemoryBundles {
    fn new(archives: Vec<(&str, Vec<u8>)>) -> Arc<Self> {
        Self::with_delay(archives, Duration::ZERO)
    }

    fn with_delay(archives: Vec<(&str, Vec<u8>)>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            archives: archives
                .into_iter()
                .map(|(id, data)| (id.to_owned(), data))
                .collect(),
            fetches: AtomicUsize::new(0),
            delay,
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BundleStore for MemoryBundles {
    fn fetch_bundle(&self, archive_id: &str) -> StoreFuture<'_, Vec<u8>> {
        let archive_id = archive_id.to_owned();
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.archives
                .iter()
                .find(|(id, _)| *id == archive_id)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| AppError::BundleUnavailable(format!("{archive_id} missing")))
        })
    }
}

fn preparer(root: &Path, shared: Option<&Path>, bundles: Arc<MemoryBundles>) -> WorkspacePreparer {
    WorkspacePreparer::new(root.to_path_buf(), shared.map(Path::to_path_buf), bundles)
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

// ── Preparation ──────────────────────────────────────────────

#[tokio::test]
async fn unpacks_bundle_and_overlays_shared_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shared = temp.path().join("shared");
    std::fs::create_dir_all(&shared).expect("shared dir");
    std::fs::write(shared.join("endpoints.yml"), "action_endpoint: shared\n").expect("write");
    std::fs::write(shared.join("credentials.yml"), "rest: {}\n").expect("write");

    let bundles = MemoryBundles::new(vec![(
        "a1",
        zip_of(&[
            ("domain.yml", "intents: []\n"),
            ("data/nlu.yml", "nlu: []\n"),
            ("endpoints.yml", "action_endpoint: bundled\n"),
        ]),
    )]);
    let root = temp.path().join("ws");
    let preparer = preparer(&root, Some(&shared), bundles);

    let handle = preparer.prepare("s1", "a1").await.expect("prepare");
    assert_eq!(handle.path, root.join("s1"));
    assert_eq!(read(&handle.path.join("domain.yml")), "intents: []\n");
    assert_eq!(read(&handle.path.join("data/nlu.yml")), "nlu: []\n");
    assert_eq!(
        read(&handle.path.join("endpoints.yml")),
        "action_endpoint: shared\n",
        "shared files win over bundle contents"
    );
    assert!(handle.path.join("credentials.yml").is_file());
    assert_eq!(read(&handle.path.join(READY_MARKER)), handle.bundle_digest);
    assert_eq!(handle.bundle_digest.len(), 64);
    assert_eq!(preparer.get("s1"), Some(handle));
}

#[tokio::test]
async fn concurrent_prepare_fetches_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::with_delay(
        vec![("a1", zip_of(&[("domain.yml", "x")]))],
        Duration::from_millis(100),
    );
    let preparer = Arc::new(preparer(temp.path(), None, Arc::clone(&bundles)));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let preparer = Arc::clone(&preparer);
            tokio::spawn(async move { preparer.prepare("s1", "a1").await })
        })
        .collect();

    let mut paths = HashSet::new();
    for task in tasks {
        paths.insert(task.await.expect("join").expect("prepare").path);
    }
    assert_eq!(paths.len(), 1);
    assert_eq!(bundles.fetches(), 1);
}

#[tokio::test]
async fn sessions_sharing_a_bundle_get_separate_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::new(vec![("a1", zip_of(&[("domain.yml", "x")]))]);
    let preparer = preparer(temp.path(), None, Arc::clone(&bundles));

    let a = preparer.prepare("s1", "a1").await.expect("prepare s1");
    let b = preparer.prepare("s2", "a1").await.expect("prepare s2");
    assert_ne!(a.path, b.path);
    assert_eq!(a.bundle_digest, b.bundle_digest);

    std::fs::write(a.path.join("domain.yml"), "changed").expect("write");
    assert_eq!(read(&b.path.join("domain.yml")), "x");
}

#[tokio::test]
async fn existing_marker_skips_fetch_after_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let archive = zip_of(&[("domain.yml", "x")]);

    let first = MemoryBundles::new(vec![("a1", archive.clone())]);
    let digest = preparer(temp.path(), None, first)
        .prepare("s1", "a1")
        .await
        .expect("prepare")
        .bundle_digest;

    let second = MemoryBundles::new(vec![("a1", archive)]);
    let reopened = preparer(temp.path(), None, Arc::clone(&second));
    let handle = reopened.prepare("s1", "a1").await.expect("reuse");
    assert_eq!(handle.bundle_digest, digest);
    assert_eq!(second.fetches(), 0);
}

// ── Failures ─────────────────────────────────────────────────

#[tokio::test]
async fn missing_bundle_writes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::new(vec![]);
    let preparer = preparer(temp.path(), None, Arc::clone(&bundles));

    let err = preparer.prepare("s1", "absent").await.expect_err("missing");
    assert!(matches!(err, AppError::BundleUnavailable(_)));
    assert!(!temp.path().join("s1").exists());

    // Not cached: the next attempt fetches again.
    let _ = preparer.prepare("s1", "absent").await;
    assert_eq!(bundles.fetches(), 2);
}

#[tokio::test]
async fn corrupt_archive_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::new(vec![("a1", b"definitely not a zip".to_vec())]);
    let preparer = preparer(temp.path(), None, bundles);

    let err = preparer.prepare("s1", "a1").await.expect_err("corrupt");
    assert!(matches!(err, AppError::WorkspaceCorrupt(_)));
    assert!(!err.is_retryable());
    assert!(!temp.path().join("s1").join(READY_MARKER).exists());
    assert!(preparer.get("s1").is_none());
}

#[tokio::test]
async fn unsafe_session_id_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let preparer = preparer(temp.path(), None, MemoryBundles::new(vec![]));

    let err = preparer.prepare("../escape", "a1").await.expect_err("unsafe");
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn archive_entry_escaping_the_workspace_is_refused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("workspaces");
    let bundles = MemoryBundles::new(vec![(
        "a1",
        zip_of(&[("domain.yml", "x"), ("../escaped.txt", "owned")]),
    )]);
    let preparer = preparer(&root, None, bundles);

    let err = preparer.prepare("s1", "a1").await.expect_err("escaping entry");
    assert!(matches!(err, AppError::WorkspaceCorrupt(_)));
    assert!(!root.join("escaped.txt").exists());
    assert!(!temp.path().join("escaped.txt").exists());
    assert!(!root.join("s1").join(READY_MARKER).exists());
}

// ── Removal and sweep ────────────────────────────────────────

#[tokio::test]
async fn remove_deletes_directory_and_slot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::new(vec![("a1", zip_of(&[("domain.yml", "x")]))]);
    let preparer = preparer(temp.path(), None, Arc::clone(&bundles));

    let handle = preparer.prepare("s1", "a1").await.expect("prepare");
    preparer.remove("s1").await.expect("remove");
    assert!(!handle.path.exists());
    assert!(preparer.get("s1").is_none());

    preparer.remove("s1").await.expect("removing twice is fine");

    preparer.prepare("s1", "a1").await.expect("prepare again");
    assert_eq!(bundles.fetches(), 2);
}

#[tokio::test]
async fn sweep_removes_only_old_orphans() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bundles = MemoryBundles::new(vec![("a1", zip_of(&[("domain.yml", "x")]))]);
    let preparer = preparer(temp.path(), None, bundles);

    preparer.prepare("live1", "a1").await.expect("prepare");
    preparer.prepare("orphan1", "a1").await.expect("prepare");
    std::fs::write(temp.path().join("stray.txt"), "not a workspace").expect("write");

    let live: HashSet<String> = ["live1".to_owned()].into_iter().collect();

    let removed = preparer
        .sweep_orphans(&live, Duration::from_secs(3600))
        .await
        .expect("sweep");
    assert_eq!(removed, 0, "orphan is too young");

    let removed = preparer
        .sweep_orphans(&live, Duration::ZERO)
        .await
        .expect("sweep");
    assert_eq!(removed, 1);
    assert!(temp.path().join("live1").is_dir());
    assert!(!temp.path().join("orphan1").exists());
    assert!(temp.path().join("stray.txt").is_file());
}
