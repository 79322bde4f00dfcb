//! Storage retention: an age sweep followed by a total-size sweep.
//!
//! Both sweeps use filesystem modification times rather than the index, so
//! pruning keeps working when the index is rebuilt or out of step with the
//! disk. When the enforcer has a metadata store it also removes the index row
//! of every raw image it deletes, then drops any remaining row whose raw file
//! is already gone.

use crate::error::PipelineError;
use crate::metadata_store::MetadataStore;
use crate::storage_paths::StoragePaths;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Sweep that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPhase {
    Age,
    Size,
    /// Files were deleted but the index row could not be removed
    Index,
}

impl fmt::Display for RetentionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPhase::Age => write!(f, "age"),
            RetentionPhase::Size => write!(f, "size"),
            RetentionPhase::Index => write!(f, "index"),
        }
    }
}

/// A file that could not be pruned
#[derive(Debug, Clone)]
pub struct RetentionFailure {
    pub path: PathBuf,
    pub phase: RetentionPhase,
    pub error: String,
}

/// Outcome of one retention run
#[derive(Debug, Default)]
pub struct RetentionReport {
    /// Raw images deleted; thumbnails are not counted separately
    pub deleted: usize,
    /// Index rows removed because their raw file no longer existed
    pub orphans: usize,
    pub failures: Vec<RetentionFailure>,
}

#[derive(Debug, Default)]
struct SweepOutcome {
    deleted: Vec<PathBuf>,
    failures: Vec<RetentionFailure>,
}

impl SweepOutcome {
    fn fail(&mut self, path: &Path, phase: RetentionPhase, error: impl fmt::Display) {
        self.failures.push(RetentionFailure {
            path: path.to_path_buf(),
            phase,
            error: error.to_string(),
        });
    }
}

/// Deletes image/thumbnail pairs by age and by total size
pub struct RetentionEnforcer {
    paths: StoragePaths,
    store: Option<Arc<MetadataStore>>,
}

impl RetentionEnforcer {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths, store: None }
    }

    /// Also delete the index row of every pruned image
    pub fn with_store(mut self, store: Arc<MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run the age sweep, then the size sweep on whatever remains.
    #[instrument(skip(self))]
    pub async fn enforce(&self, keep_days: u32, max_bytes: u64) -> RetentionReport {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(keep_days) * SECS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut report = RetentionReport::default();

        let age = run_blocking(self.paths.clone(), move |paths| age_sweep(paths, cutoff)).await;
        self.absorb(age, &mut report).await;

        let size = run_blocking(self.paths.clone(), move |paths| size_sweep(paths, max_bytes)).await;
        self.absorb(size, &mut report).await;

        self.reconcile(&mut report).await;

        metrics::counter!("retention.files.deleted").increment(report.deleted as u64);
        metrics::counter!("retention.failures").increment(report.failures.len() as u64);
        metrics::counter!("retention.orphans.removed").increment(report.orphans as u64);

        if report.deleted > 0 || report.orphans > 0 || !report.failures.is_empty() {
            info!(
                deleted = report.deleted,
                orphans = report.orphans,
                failures = report.failures.len(),
                keep_days = keep_days,
                max_bytes = max_bytes,
                "Retention pass finished"
            );
        }

        report
    }

    /// Fold a sweep into the report, removing index rows for deleted images.
    async fn absorb(&self, outcome: SweepOutcome, report: &mut RetentionReport) {
        report.deleted += outcome.deleted.len();
        report.failures.extend(outcome.failures);

        let Some(store) = &self.store else {
            return;
        };

        for path in outcome.deleted {
            let Some(filename) = self.paths.relative_to_images(&path) else {
                continue;
            };
            match store.delete_by_filename(&filename).await {
                Ok(true) => debug!(filename = %filename, "Removed index row"),
                Ok(false) => {}
                Err(e) => {
                    warn!(filename = %filename, error = %e, "Index row left behind for pruned image");
                    report.failures.push(RetentionFailure {
                        path,
                        phase: RetentionPhase::Index,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Drop index rows whose raw file is gone, e.g. after a crash between a
    /// sweep and its index cleanup.
    async fn reconcile(&self, report: &mut RetentionReport) {
        let Some(store) = &self.store else {
            return;
        };

        let orphans = match store.missing_files().await {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!(error = %e, "Could not check index for missing files");
                report.failures.push(RetentionFailure {
                    path: self.paths.images_dir().to_path_buf(),
                    phase: RetentionPhase::Index,
                    error: e.to_string(),
                });
                return;
            }
        };

        for (id, path) in orphans {
            match store.delete_by_id(id).await {
                Ok(()) | Err(PipelineError::NotFound(_)) => {
                    debug!(id = id, path = %path.display(), "Removed orphaned index row");
                    report.orphans += 1;
                }
                Err(e) => {
                    warn!(id = id, error = %e, "Could not remove orphaned index row");
                    report.failures.push(RetentionFailure {
                        path,
                        phase: RetentionPhase::Index,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

async fn run_blocking<F>(paths: StoragePaths, sweep: F) -> SweepOutcome
where
    F: FnOnce(&StoragePaths) -> SweepOutcome + Send + 'static,
{
    let dir = paths.images_dir().to_path_buf();
    match tokio::task::spawn_blocking(move || sweep(&paths)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let mut outcome = SweepOutcome::default();
            outcome.fail(&dir, RetentionPhase::Age, format!("sweep task failed: {e}"));
            outcome
        }
    }
}

/// Delete every file under `images_dir` last modified before `cutoff`.
fn age_sweep(paths: &StoragePaths, cutoff: SystemTime) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    let images_dir = paths.images_dir();

    for entry in WalkDir::new(images_dir).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(images_dir).to_path_buf();
                outcome.fail(&path, RetentionPhase::Age, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let modified = match entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                outcome.fail(path, RetentionPhase::Age, e);
                continue;
            }
        };

        if modified >= cutoff {
            continue;
        }

        match delete_pair(paths, path) {
            Ok(thumb_result) => {
                outcome.deleted.push(path.to_path_buf());
                if let Err((thumb, e)) = thumb_result {
                    outcome.fail(&thumb, RetentionPhase::Age, e);
                }
            }
            Err(e) => outcome.fail(path, RetentionPhase::Age, e),
        }
    }

    outcome
}

/// Delete the oldest `*.jpg` until the image tree fits in `max_bytes`.
///
/// Stops early when no image is left or a raw image cannot be deleted.
fn size_sweep(paths: &StoragePaths, max_bytes: u64) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    let images_dir = paths.images_dir();

    while dir_size(images_dir) > max_bytes {
        let Some(oldest) = oldest_jpeg(images_dir) else {
            break;
        };

        match delete_pair(paths, &oldest) {
            Ok(thumb_result) => {
                debug!(path = %oldest.display(), "Pruned oldest image over size budget");
                outcome.deleted.push(oldest);
                if let Err((thumb, e)) = thumb_result {
                    outcome.fail(&thumb, RetentionPhase::Size, e);
                }
            }
            Err(e) => {
                outcome.fail(&oldest, RetentionPhase::Size, e);
                break;
            }
        }
    }

    outcome
}

/// Remove a raw image, then its mirrored thumbnail.
///
/// The outer error means the raw image is still there. The inner result
/// reports a thumbnail that exists but could not be removed.
fn delete_pair(
    paths: &StoragePaths,
    image: &Path,
) -> io::Result<Result<(), (PathBuf, io::Error)>> {
    std::fs::remove_file(image)?;

    let Some(thumb) = paths.thumbnail_for(image) else {
        return Ok(Ok(()));
    };

    match std::fs::remove_file(&thumb) {
        Ok(()) => Ok(Ok(())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Ok(())),
        Err(e) => Ok(Err((thumb, e))),
    }
}

/// Total size of regular files under `dir`; unreadable entries count as 0.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn oldest_jpeg(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::NewImage;
    use chrono::Local;
    use filetime::FileTime;

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: StoragePaths,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = StoragePaths::new(dir.path().join("images"), dir.path().join("thumbs"));
            paths.ensure_dirs().unwrap();
            Self { _dir: dir, paths }
        }

        /// Write an image and its thumbnail with the given age in seconds.
        fn add(&self, relative: &str, size: usize, age_secs: i64) -> PathBuf {
            let image = self.paths.images_dir().join(relative);
            let thumb = self.paths.thumbs_dir().join(relative);
            for (path, len) in [(&image, size), (&thumb, 10)] {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, vec![0u8; len]).unwrap();
            }

            let mtime = FileTime::from_unix_time(FileTime::now().unix_seconds() - age_secs, 0);
            filetime::set_file_mtime(&image, mtime).unwrap();
            image
        }

        fn thumb(&self, relative: &str) -> PathBuf {
            self.paths.thumbs_dir().join(relative)
        }
    }

    #[tokio::test]
    async fn test_age_sweep_with_zero_keep_days() {
        let fx = Fixture::new();
        let a = fx.add("2025/11/17/20251117_100000.jpg", 100, 60);
        let b = fx.add("2025/11/17/20251117_110000.jpg", 100, 3600);

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(0, u64::MAX)
            .await;

        assert_eq!(report.deleted, 2);
        assert!(report.failures.is_empty());
        assert!(!a.exists() && !b.exists());
        assert!(!fx.thumb("2025/11/17/20251117_100000.jpg").exists());
        assert!(!fx.thumb("2025/11/17/20251117_110000.jpg").exists());
    }

    #[tokio::test]
    async fn test_age_sweep_keeps_recent_files() {
        let fx = Fixture::new();
        let old = fx.add("2025/01/01/20250101_000000.jpg", 100, 10 * SECS_PER_DAY as i64);
        let fresh = fx.add("2025/01/09/20250109_000000.jpg", 100, 60);

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(7, u64::MAX)
            .await;

        assert_eq!(report.deleted, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(fx.thumb("2025/01/09/20250109_000000.jpg").exists());
    }

    #[tokio::test]
    async fn test_age_sweep_tolerates_missing_thumbnail() {
        let fx = Fixture::new();
        let image = fx.add("2025/01/01/20250101_000000.jpg", 100, 10 * SECS_PER_DAY as i64);
        std::fs::remove_file(fx.thumb("2025/01/01/20250101_000000.jpg")).unwrap();

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(7, u64::MAX)
            .await;

        assert_eq!(report.deleted, 1);
        assert!(report.failures.is_empty());
        assert!(!image.exists());
    }

    #[tokio::test]
    async fn test_size_sweep_deletes_oldest_first() {
        let fx = Fixture::new();
        let oldest = fx.add("2025/11/17/20251117_100000.jpg", 100, 300);
        let middle = fx.add("2025/11/17/20251117_100100.jpg", 200, 200);
        let newest = fx.add("2025/11/17/20251117_100200.jpg", 300, 100);

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(30, 300)
            .await;

        assert_eq!(report.deleted, 2);
        assert!(!oldest.exists());
        assert!(!middle.exists());
        assert!(newest.exists());
        assert!(fx.thumb("2025/11/17/20251117_100200.jpg").exists());
        assert!(dir_size(fx.paths.images_dir()) <= 300);
    }

    #[tokio::test]
    async fn test_size_sweep_runs_until_under_budget() {
        let fx = Fixture::new();
        fx.add("a/1.jpg", 100, 300);
        fx.add("a/2.jpg", 200, 200);
        let newest = fx.add("a/3.jpg", 300, 100);

        // 300 bytes still exceeds 250, so the newest goes too
        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(30, 250)
            .await;

        assert_eq!(report.deleted, 3);
        assert!(!newest.exists());
        assert_eq!(dir_size(fx.paths.images_dir()), 0);
    }

    #[tokio::test]
    async fn test_size_sweep_stops_without_jpegs() {
        let fx = Fixture::new();
        let other = fx.paths.images_dir().join("notes.txt");
        std::fs::write(&other, vec![0u8; 1000]).unwrap();

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(30, 10)
            .await;

        assert_eq!(report.deleted, 0);
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_pruned_images_leave_the_index() {
        let fx = Fixture::new();
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());

        for (relative, age) in [("2025/01/01/old.jpg", 10 * SECS_PER_DAY as i64), ("2025/01/09/new.jpg", 60)] {
            let image = fx.add(relative, 100, age);
            store
                .insert(&NewImage {
                    filename: relative.to_string(),
                    timestamp: Local::now().fixed_offset(),
                    filepath: image,
                    thumbnail_path: fx.thumb(relative),
                    filesize: 100,
                    width: None,
                    height: None,
                    checksum: None,
                })
                .await
                .unwrap();
        }

        let report = RetentionEnforcer::new(fx.paths.clone())
            .with_store(store.clone())
            .enforce(7, u64::MAX)
            .await;

        assert_eq!(report.deleted, 1);
        assert!(store.get_by_filename("2025/01/01/old.jpg").await.unwrap().is_none());
        assert!(store.get_by_filename("2025/01/09/new.jpg").await.unwrap().is_some());
        assert!(store.missing_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_age_sweep_records_failure_and_continues() {
        let fx = Fixture::new();
        let stuck = "2025/01/01/20250101_000000.jpg";
        let first = fx.add(stuck, 100, 10 * SECS_PER_DAY as i64);
        let second = fx.add("2025/01/02/20250102_000000.jpg", 100, 9 * SECS_PER_DAY as i64);

        // A directory where the thumbnail should be cannot be removed as a file
        let thumb = fx.thumb(stuck);
        std::fs::remove_file(&thumb).unwrap();
        std::fs::create_dir_all(thumb.join("blocker")).unwrap();

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(7, u64::MAX)
            .await;

        assert_eq!(report.deleted, 2);
        assert!(!first.exists() && !second.exists());
        assert!(!fx.thumb("2025/01/02/20250102_000000.jpg").exists());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, RetentionPhase::Age);
        assert_eq!(report.failures[0].path, thumb);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_size_sweep_stops_on_undeletable_image() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let oldest = fx.add("a/1.jpg", 100, 300);
        let newer = fx.add("b/2.jpg", 100, 200);

        let locked = oldest.parent().unwrap().to_path_buf();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Permission bits do not bind a privileged user
        if std::fs::File::create(locked.join(".write-check")).is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let report = RetentionEnforcer::new(fx.paths.clone())
            .enforce(30, 0)
            .await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.deleted, 0);
        assert!(oldest.exists());
        assert!(newer.exists());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, RetentionPhase::Size);
        assert_eq!(report.failures[0].path, oldest);
    }

    #[tokio::test]
    async fn test_rows_without_files_are_reconciled() {
        let fx = Fixture::new();
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());

        let kept = "2025/01/09/20250109_000000.jpg";
        let gone = "2025/01/08/20250108_000000.jpg";
        for relative in [kept, gone] {
            let image = fx.add(relative, 100, 60);
            store
                .insert(&NewImage {
                    filename: relative.to_string(),
                    timestamp: Local::now().fixed_offset(),
                    filepath: image,
                    thumbnail_path: fx.thumb(relative),
                    filesize: 100,
                    width: None,
                    height: None,
                    checksum: None,
                })
                .await
                .unwrap();
        }
        std::fs::remove_file(fx.paths.images_dir().join(gone)).unwrap();

        let report = RetentionEnforcer::new(fx.paths.clone())
            .with_store(store.clone())
            .enforce(30, u64::MAX)
            .await;

        assert_eq!(report.deleted, 0);
        assert_eq!(report.orphans, 1);
        assert!(report.failures.is_empty());
        assert!(store.get_by_filename(gone).await.unwrap().is_none());
        assert!(store.get_by_filename(kept).await.unwrap().is_some());
    }

    #[test]
    fn test_dir_size_of_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(dir_size(&dir.path().join("absent")), 0);
    }
}
