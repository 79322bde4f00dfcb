use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Camera capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// On-disk image layout
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retention policy
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Camera capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Seconds between scheduled captures
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Resolution passed to the capture command, e.g. "1280x720"
    #[serde(default = "default_resolution")]
    pub resolution: String,
    /// JPEG quality of captured images (0-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Command template; `{resolution}` and `{outfile}` are substituted per argument
    #[serde(default = "default_command_template")]
    pub command_template: String,
    /// Seconds before a hung capture command is killed
    #[serde(default = "default_capture_timeout_secs")]
    pub timeout_secs: u64,
    /// Thumbnail bounding box width
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    /// Thumbnail bounding box height
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
    /// Run retention every N scheduled cycles
    #[serde(default = "default_retention_every_cycles")]
    pub retention_every_cycles: u64,
}

/// Directory layout for raw images and thumbnails
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    #[serde(default = "default_thumbs_dir")]
    pub thumbs_dir: PathBuf,
}

/// Retention policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Delete images older than this many days
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,
    /// Delete oldest images while the image tree exceeds this size
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Shared secret required for settings writes
    #[serde(default)]
    pub admin_api_key: Option<String>,
    /// Base URL for image links; derived from the Host header when unset
    #[serde(default)]
    pub public_base_url: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "capture-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_command_template() -> String {
    "fswebcam -r {resolution} --no-banner -S 2 {outfile}".to_string()
}

fn default_capture_timeout_secs() -> u64 {
    30
}

fn default_thumbnail_width() -> u32 {
    320
}

fn default_thumbnail_height() -> u32 {
    180
}

fn default_retention_every_cycles() -> u64 {
    10
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("data/images")
}

fn default_thumbs_dir() -> PathBuf {
    PathBuf::from("data/thumbnails")
}

fn default_keep_days() -> u32 {
    7
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/petcam.db")
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/capture").required(false))
            .add_source(config::File::with_name("/etc/petcam/capture").required(false))
            // Override with environment variables
            // PETCAM__CAPTURE__INTERVAL_SECONDS -> capture.interval_seconds
            .add_source(
                config::Environment::with_prefix("PETCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let template = self.capture.command_template.trim();
        if template.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.command_template".to_string(),
            ));
        }
        if !template.contains("{outfile}") {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.command_template".to_string(),
                message: "template must contain the {outfile} placeholder".to_string(),
            });
        }

        if self.capture.interval_seconds == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.interval_seconds".to_string(),
                message: "interval must be greater than 0".to_string(),
            });
        }

        if self.capture.jpeg_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.jpeg_quality".to_string(),
                message: "quality must be between 0 and 100".to_string(),
            });
        }

        if !is_valid_resolution(&self.capture.resolution) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.resolution".to_string(),
                message: "resolution must look like 1280x720".to_string(),
            });
        }

        if self.capture.thumbnail_width == 0 || self.capture.thumbnail_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.thumbnail_width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.capture.retention_every_cycles == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.retention_every_cycles".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get capture command timeout as Duration
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture.timeout_secs)
    }

    /// Thumbnail bounding box as (width, height)
    pub fn thumbnail_bounds(&self) -> (u32, u32) {
        (self.capture.thumbnail_width, self.capture.thumbnail_height)
    }
}

/// Check a `WIDTHxHEIGHT` resolution string.
pub fn is_valid_resolution(resolution: &str) -> bool {
    match resolution.split_once('x') {
        Some((w, h)) => {
            matches!(w.parse::<u32>(), Ok(w) if w > 0) && matches!(h.parse::<u32>(), Ok(h) if h > 0)
        }
        None => false,
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            resolution: default_resolution(),
            jpeg_quality: default_jpeg_quality(),
            command_template: default_command_template(),
            timeout_secs: default_capture_timeout_secs(),
            thumbnail_width: default_thumbnail_width(),
            thumbnail_height: default_thumbnail_height(),
            retention_every_cycles: default_retention_every_cycles(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            images_dir: default_images_dir(),
            thumbs_dir: default_thumbs_dir(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_days: default_keep_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            admin_api_key: None,
            public_base_url: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            capture: CaptureConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_interval_seconds(), 300);
        assert_eq!(default_jpeg_quality(), 85);
        assert_eq!(default_max_bytes(), 10_737_418_240);
        assert_eq!(default_retention_every_cycles(), 10);
    }

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_command_template() {
        let mut config = Config::default();
        config.capture.command_template = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_template_without_outfile() {
        let mut config = Config::default();
        config.capture.command_template = "fswebcam -r {resolution}".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_quality_and_interval() {
        let mut config = Config::default();
        config.capture.jpeg_quality = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolution_format() {
        assert!(is_valid_resolution("1280x720"));
        assert!(!is_valid_resolution("1280"));
        assert!(!is_valid_resolution("0x720"));
        assert!(!is_valid_resolution("axb"));
    }
}
