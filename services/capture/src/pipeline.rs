//! The capture-and-persist unit shared by the scheduler and the HTTP API.
//!
//! One call captures a still, derives the thumbnail and checksum, and inserts
//! the index row. The row is only written after both files are on disk, so a
//! visible record always points at existing files.

use crate::capture_invoker::CaptureInvoker;
use crate::codec;
use crate::error::{PipelineError, Result};
use crate::metadata_store::{ImageRecord, MetadataStore, NewImage};
use crate::settings::{RuntimeSettings, SharedSettings};
use crate::storage_paths::StoragePaths;
use chrono::{DateTime, FixedOffset, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const DEFAULT_THUMBNAIL_BOUNDS: (u32, u32) = (320, 180);

/// File facts computed off the async runtime
struct CodecOutput {
    filesize: u64,
    checksum: String,
    dimensions: Option<(u32, u32)>,
}

/// Captures and indexes one image at a time
pub struct CapturePipeline {
    paths: StoragePaths,
    invoker: CaptureInvoker,
    store: Arc<MetadataStore>,
    settings: SharedSettings,
    thumbnail_bounds: (u32, u32),
    /// Held for the whole unit so the device is never driven twice at once
    capture_lock: Mutex<()>,
}

impl CapturePipeline {
    pub fn new(
        paths: StoragePaths,
        invoker: CaptureInvoker,
        store: Arc<MetadataStore>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            paths,
            invoker,
            store,
            settings,
            thumbnail_bounds: DEFAULT_THUMBNAIL_BOUNDS,
            capture_lock: Mutex::new(()),
        }
    }

    pub fn with_thumbnail_bounds(mut self, bounds: (u32, u32)) -> Self {
        self.thumbnail_bounds = bounds;
        self
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Capture, thumbnail and index one image stamped with the current local time.
    ///
    /// Concurrent callers queue on an internal lock. A caller that lands in
    /// the same second as the previous capture gets `Constraint` and the
    /// earlier image is left untouched.
    #[instrument(skip(self))]
    pub async fn capture_one(&self) -> Result<ImageRecord> {
        let _guard = self.capture_lock.lock().await;

        let started = Instant::now();
        let settings = self.settings.snapshot();
        let timestamp = Local::now().fixed_offset();

        let result = self.capture_at(timestamp, &settings).await;

        metrics::histogram!("capture.duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(record) => {
                metrics::counter!("capture.attempts.succeeded").increment(1);
                info!(
                    id = record.id,
                    filename = %record.filename,
                    filesize = record.filesize,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Image captured"
                );
            }
            Err(e) => {
                metrics::counter!("capture.attempts.failed", "code" => e.code()).increment(1);
            }
        }

        result
    }

    async fn capture_at(
        &self,
        timestamp: DateTime<FixedOffset>,
        settings: &RuntimeSettings,
    ) -> Result<ImageRecord> {
        let filename = StoragePaths::relative_name(&timestamp);

        if self.paths.images_dir().join(&filename).exists()
            || self.store.get_by_filename(&filename).await?.is_some()
        {
            warn!(filename = %filename, "Capture collides with an existing image");
            return Err(PipelineError::Constraint(filename));
        }

        let (_, raw_path) = self.paths.image_path(&timestamp)?;
        let (_, thumb_path) = self.paths.thumbnail_path(&timestamp)?;

        match self
            .persist(&filename, timestamp, &raw_path, &thumb_path, settings)
            .await
        {
            Ok(record) => Ok(record),
            Err(e @ PipelineError::Constraint(_)) => Err(e),
            Err(e) => {
                remove_partial(&raw_path);
                remove_partial(&thumb_path);
                Err(e)
            }
        }
    }

    async fn persist(
        &self,
        filename: &str,
        timestamp: DateTime<FixedOffset>,
        raw_path: &Path,
        thumb_path: &Path,
        settings: &RuntimeSettings,
    ) -> Result<ImageRecord> {
        self.invoker
            .capture_raw(raw_path, &settings.image_resolution)
            .await?;

        let output = self
            .encode(
                raw_path.to_path_buf(),
                thumb_path.to_path_buf(),
                codec::thumbnail_quality(settings.jpeg_quality),
            )
            .await?;

        let image = NewImage {
            filename: filename.to_string(),
            timestamp,
            filepath: raw_path.to_path_buf(),
            thumbnail_path: thumb_path.to_path_buf(),
            filesize: output.filesize,
            width: output.dimensions.map(|(w, _)| w),
            height: output.dimensions.map(|(_, h)| h),
            checksum: Some(output.checksum),
        };

        let id = self.store.insert(&image).await?;

        Ok(ImageRecord {
            id,
            filename: image.filename,
            timestamp,
            filepath: image.filepath.to_string_lossy().into_owned(),
            thumbnail_path: image.thumbnail_path.to_string_lossy().into_owned(),
            filesize: image.filesize,
            width: image.width,
            height: image.height,
            checksum: image.checksum,
            note: None,
        })
    }

    async fn encode(&self, raw: PathBuf, thumb: PathBuf, quality: u8) -> Result<CodecOutput> {
        let bounds = self.thumbnail_bounds;

        tokio::task::spawn_blocking(move || -> Result<CodecOutput> {
            codec::thumbnail(&raw, &thumb, bounds, quality)?;

            let filesize = std::fs::metadata(&raw)
                .map_err(|e| PipelineError::filesystem(&raw, e))?
                .len();

            Ok(CodecOutput {
                filesize,
                checksum: codec::checksum(&raw)?,
                dimensions: codec::probe_dimensions(&raw),
            })
        })
        .await
        .map_err(|e| PipelineError::Codec(format!("codec task failed: {e}")))?
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial capture file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial capture file"),
    }
}
