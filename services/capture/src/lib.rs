//! Petcam Capture Service
//!
//! Periodically grabs a still from the attached camera, stores it with a
//! thumbnail, indexes it in SQLite and keeps disk usage within an age and a
//! size budget. A small HTTP API exposes the index, the stored files, an
//! on-demand capture trigger and the runtime settings.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                              images/{Y}/{m}/{d}/
//! │ Scheduler    │──┐                           thumbnails/{Y}/{m}/{d}/
//! └──────────────┘  │   ┌──────────────┐               ▲    │
//!                   ├──▶│ Capture      │───────────────┘    │
//! ┌──────────────┐  │   │ Pipeline     │                    │
//! │ POST /capture│──┘   └──────────────┘                    ▼
//! └──────────────┘             │                    ┌──────────────┐
//!                              ▼                    │ Retention    │
//! ┌──────────────┐      ┌──────────────┐            │ Enforcer     │
//! │ HTTP API     │─────▶│ Metadata     │◀───────────└──────────────┘
//! └──────────────┘      │ Index        │
//!                       └──────────────┘
//! ```

pub mod api;
pub mod capture_invoker;
pub mod codec;
pub mod config;
pub mod error;
pub mod metadata_store;
pub mod pipeline;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod storage_paths;

pub use api::{create_router, start_api_server, AppState, ImageResponse};
pub use capture_invoker::CaptureInvoker;
pub use config::Config;
pub use error::{CaptureError, PipelineError};
pub use metadata_store::{ImagePage, ImageQuery, ImageRecord, MetadataStore, NewImage};
pub use pipeline::CapturePipeline;
pub use retention::{RetentionEnforcer, RetentionReport};
pub use scheduler::{CaptureScheduler, SchedulerState};
pub use settings::{RuntimeSettings, SettingsUpdate, SharedSettings};
pub use storage_paths::StoragePaths;
