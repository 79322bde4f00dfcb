//! Runtime tunables that can be changed through the settings endpoint.
//!
//! The scheduler and the capture pipeline take a snapshot at the start of
//! every cycle, so an update applies from the next capture on.

use crate::config::{is_valid_resolution, Config};
use crate::error::{PipelineError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Current values of the runtime tunables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSettings {
    pub capture_interval_seconds: u64,
    pub image_resolution: String,
    pub jpeg_quality: u8,
    pub retention_days: u32,
    pub max_storage_bytes: u64,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_interval_seconds: config.capture.interval_seconds,
            image_resolution: config.capture.resolution.clone(),
            jpeg_quality: config.capture.jpeg_quality,
            retention_days: config.retention.keep_days,
            max_storage_bytes: config.retention.max_bytes,
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(self.capture_interval_seconds)
    }
}

/// Partial update; absent fields keep their value, unknown keys are ignored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub capture_interval_seconds: Option<u64>,
    pub image_resolution: Option<String>,
    pub jpeg_quality: Option<u8>,
    pub retention_days: Option<u32>,
    pub max_storage_bytes: Option<u64>,
}

impl SettingsUpdate {
    /// Reject the whole update if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.capture_interval_seconds == Some(0) {
            return Err(PipelineError::Validation(
                "capture_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if let Some(resolution) = &self.image_resolution {
            if !is_valid_resolution(resolution) {
                return Err(PipelineError::Validation(
                    "image_resolution must look like 1280x720".to_string(),
                ));
            }
        }
        if matches!(self.jpeg_quality, Some(q) if q > 100) {
            return Err(PipelineError::Validation(
                "jpeg_quality must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings shared between the scheduler, the pipeline and the API
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl SharedSettings {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> RuntimeSettings {
        self.inner.read().clone()
    }

    /// Validate and apply an update, returning the new values.
    pub fn apply(&self, update: SettingsUpdate) -> Result<RuntimeSettings> {
        update.validate()?;

        let mut settings = self.inner.write();
        if let Some(v) = update.capture_interval_seconds {
            settings.capture_interval_seconds = v;
        }
        if let Some(v) = update.image_resolution {
            settings.image_resolution = v;
        }
        if let Some(v) = update.jpeg_quality {
            settings.jpeg_quality = v;
        }
        if let Some(v) = update.retention_days {
            settings.retention_days = v;
        }
        if let Some(v) = update.max_storage_bytes {
            settings.max_storage_bytes = v;
        }

        info!(settings = ?*settings, "Runtime settings updated");
        Ok(settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedSettings {
        SharedSettings::new(RuntimeSettings::from_config(&Config::default()))
    }

    #[test]
    fn test_seeded_from_config() {
        let settings = shared().snapshot();
        assert_eq!(settings.capture_interval_seconds, 300);
        assert_eq!(settings.image_resolution, "1280x720");
        assert_eq!(settings.jpeg_quality, 85);
        assert_eq!(settings.retention_days, 7);
    }

    #[test]
    fn test_partial_update() {
        let settings = shared();
        let updated = settings
            .apply(SettingsUpdate {
                capture_interval_seconds: Some(60),
                retention_days: Some(3),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(updated.capture_interval_seconds, 60);
        assert_eq!(updated.retention_days, 3);
        assert_eq!(updated.jpeg_quality, 85);
        assert_eq!(settings.snapshot(), updated);
    }

    #[test]
    fn test_invalid_update_is_not_applied() {
        let settings = shared();
        let err = settings
            .apply(SettingsUpdate {
                capture_interval_seconds: Some(10),
                jpeg_quality: Some(150),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(settings.snapshot().capture_interval_seconds, 300);
    }

    #[test]
    fn test_update_ignores_unknown_keys() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"jpeg_quality": 70, "unknown": true}"#).unwrap();
        assert_eq!(update.jpeg_quality, Some(70));
        assert!(update.image_resolution.is_none());
    }
}
