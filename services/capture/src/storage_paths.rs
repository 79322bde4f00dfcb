//! Directory layout for raw images and thumbnails.
//!
//! Both trees mirror each other: a raw image at
//! `{images_dir}/2025/11/17/20251117_153000.jpg` has its thumbnail at
//! `{thumbs_dir}/2025/11/17/20251117_153000.jpg`, and the relative part is
//! the record's filename in the metadata index.

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Datelike, TimeZone};
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Resolved storage roots.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    images_dir: PathBuf,
    thumbs_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(images_dir: impl Into<PathBuf>, thumbs_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            thumbs_dir: thumbs_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.images_dir, &config.thumbs_dir)
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn thumbs_dir(&self) -> &Path {
        &self.thumbs_dir
    }

    /// Create both roots if they do not exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.images_dir, &self.thumbs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| PipelineError::filesystem(dir, e))?;
        }
        Ok(())
    }

    /// Relative filename for a capture taken at `ts`.
    pub fn relative_name<Tz>(ts: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        format!(
            "{:04}/{:02}/{:02}/{}.jpg",
            ts.year(),
            ts.month(),
            ts.day(),
            ts.format("%Y%m%d_%H%M%S")
        )
    }

    /// Build the relative and absolute path for `ts` under `base`, creating
    /// the day directory.
    pub fn build<Tz>(base: &Path, ts: &DateTime<Tz>) -> Result<(String, PathBuf)>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let relative = Self::relative_name(ts);
        let full = base.join(&relative);

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::filesystem(parent, e))?;
        }

        Ok((relative, full))
    }

    /// Paths for the raw image of a capture at `ts`.
    pub fn image_path<Tz>(&self, ts: &DateTime<Tz>) -> Result<(String, PathBuf)>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self::build(&self.images_dir, ts)
    }

    /// Paths for the thumbnail of a capture at `ts`.
    pub fn thumbnail_path<Tz>(&self, ts: &DateTime<Tz>) -> Result<(String, PathBuf)>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self::build(&self.thumbs_dir, ts)
    }

    /// Thumbnail counterpart of a raw image path, if it lives under the images root.
    pub fn thumbnail_for(&self, image: &Path) -> Option<PathBuf> {
        image
            .strip_prefix(&self.images_dir)
            .ok()
            .map(|rel| self.thumbs_dir.join(rel))
    }

    /// Relative filename of a raw image path, with `/` separators.
    pub fn relative_to_images(&self, image: &Path) -> Option<String> {
        let rel = image.strip_prefix(&self.images_dir).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Local, Utc};

    #[test]
    fn test_relative_name_format() {
        let ts = Utc.with_ymd_and_hms(2025, 11, 17, 15, 30, 0).unwrap();
        assert_eq!(
            StoragePaths::relative_name(&ts),
            "2025/11/17/20251117_153000.jpg"
        );
    }

    #[test]
    fn test_relative_name_uses_local_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let ts = tz.with_ymd_and_hms(2025, 1, 2, 23, 59, 59).unwrap();
        assert_eq!(
            StoragePaths::relative_name(&ts),
            "2025/01/02/20250102_235959.jpg"
        );
    }

    #[test]
    fn test_build_creates_day_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ts = Local::now();

        let (relative, full) = StoragePaths::build(dir.path(), &ts).unwrap();

        assert_eq!(full, dir.path().join(&relative));
        assert!(full.parent().unwrap().is_dir());
        assert!(!full.exists());

        let parts: Vec<&str> = relative.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
        assert!(parts[3].ends_with(".jpg"));
    }

    #[test]
    fn test_image_and_thumbnail_share_filename() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path().join("images"), dir.path().join("thumbs"));
        let ts = Utc.with_ymd_and_hms(2025, 11, 17, 10, 0, 0).unwrap();

        let (image_rel, image_full) = paths.image_path(&ts).unwrap();
        let (thumb_rel, thumb_full) = paths.thumbnail_path(&ts).unwrap();

        assert_eq!(image_rel, thumb_rel);
        assert_eq!(paths.thumbnail_for(&image_full), Some(thumb_full));
        assert_eq!(paths.relative_to_images(&image_full), Some(image_rel));
    }

    #[test]
    fn test_build_fails_when_base_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let ts = Utc::now();
        let err = StoragePaths::build(&blocker, &ts).unwrap_err();
        assert!(matches!(err, PipelineError::Filesystem { .. }));
    }
}
