//! Error taxonomy shared by the capture pipeline, the metadata index, the
//! retention enforcer and the HTTP surface.

use std::path::PathBuf;
use thiserror::Error;

/// Ways the external capture command can fail.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture command exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("capture command timed out after {0}s")]
    TimedOut(u64),

    #[error("capture command succeeded but produced no file at {0}")]
    MissingOutput(PathBuf),

    #[error("invalid capture command template: {0}")]
    InvalidTemplate(String),
}

impl CaptureError {
    /// Exit code of the external process, when it ran to completion.
    pub fn exit_status(&self) -> Option<&str> {
        match self {
            CaptureError::Exited { status, .. } => Some(status),
            _ => None,
        }
    }
}

/// Errors raised by the capture-and-retention pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("image codec error: {0}")]
    Codec(String),

    #[error("an image named {0} is already indexed")]
    Constraint(String),

    #[error("image {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid admin key")]
    Auth,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl PipelineError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code reported to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Filesystem { .. } => "filesystem_error",
            PipelineError::Capture(_) => "capture_failed",
            PipelineError::Codec(_) => "codec_error",
            PipelineError::Constraint(_) => "duplicate_capture",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Validation(_) => "invalid_request",
            PipelineError::Auth => "unauthorized",
            PipelineError::Database(_) => "database_error",
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(e: image::ImageError) -> Self {
        PipelineError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
