use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, TimeZone};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Metadata of one captured image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    /// Index-assigned identifier
    pub id: i64,
    /// Relative path, e.g. `2025/11/17/20251117_153000.jpg`
    pub filename: String,
    /// Capture time in the local zone of the camera host
    pub timestamp: DateTime<FixedOffset>,
    /// Absolute path of the raw image
    pub filepath: String,
    /// Absolute path of the thumbnail
    pub thumbnail_path: String,
    /// Raw image size in bytes
    pub filesize: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// SHA-256 of the raw image, lowercase hex
    pub checksum: Option<String>,
    /// Free-text annotation, never set by the pipeline
    pub note: Option<String>,
}

/// A record about to be inserted
#[derive(Debug, Clone)]
pub struct NewImage {
    pub filename: String,
    pub timestamp: DateTime<FixedOffset>,
    pub filepath: PathBuf,
    pub thumbnail_path: PathBuf,
    pub filesize: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub checksum: Option<String>,
}

/// Query parameters for image listing
#[derive(Debug, Clone)]
pub struct ImageQuery {
    /// Calendar day in local time, `YYYY-MM-DD`
    pub date: Option<String>,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub per_page: u32,
}

impl Default for ImageQuery {
    fn default() -> Self {
        Self {
            date: None,
            page: 1,
            per_page: 50,
        }
    }
}

/// One page of listing results
#[derive(Debug, Clone)]
pub struct ImagePage {
    pub items: Vec<ImageRecord>,
    /// Matching rows before pagination
    pub total: i64,
}

#[derive(Debug, FromRow)]
struct ImageRow {
    id: i64,
    filename: String,
    timestamp: String,
    filepath: String,
    thumbnail_path: String,
    filesize: i64,
    width: Option<i64>,
    height: Option<i64>,
    checksum: Option<String>,
    note: Option<String>,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = PipelineError;

    fn try_from(row: ImageRow) -> Result<Self> {
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| PipelineError::Database(sqlx::Error::Decode(Box::new(e))))?;

        Ok(Self {
            id: row.id,
            filename: row.filename,
            timestamp,
            filepath: row.filepath,
            thumbnail_path: row.thumbnail_path,
            filesize: row.filesize.max(0) as u64,
            width: row.width.and_then(|w| u32::try_from(w).ok()),
            height: row.height.and_then(|h| u32::try_from(h).ok()),
            checksum: row.checksum,
            note: row.note,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, filename, timestamp, filepath, thumbnail_path,
           filesize, width, height, checksum, note
    FROM images
"#;

/// Metadata index of captured images in SQLite
///
/// The pool holds a single connection, so all writes are serialized by the
/// storage engine.
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if needed) the database file
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite")?;

        info!(path = %config.path.display(), "Opened metadata index");

        Ok(Self { pool })
    }

    /// In-memory index with migrations applied
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid SQLite path")?;

        // The database lives only as long as its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite")?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a record, failing with `Constraint` if the filename exists
    #[instrument(skip(self, image), fields(filename = %image.filename))]
    pub async fn insert(&self, image: &NewImage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (
                filename, timestamp, captured_at_ms, filepath, thumbnail_path,
                filesize, width, height, checksum
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9
            )
            "#,
        )
        .bind(&image.filename)
        .bind(image.timestamp.to_rfc3339())
        .bind(image.timestamp.timestamp_millis())
        .bind(image.filepath.to_string_lossy().into_owned())
        .bind(image.thumbnail_path.to_string_lossy().into_owned())
        .bind(image.filesize as i64)
        .bind(image.width.map(i64::from))
        .bind(image.height.map(i64::from))
        .bind(&image.checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                PipelineError::Constraint(image.filename.clone())
            }
            other => PipelineError::Database(other),
        })?;

        let id = result.last_insert_rowid();

        debug!(id = id, filename = %image.filename, "Image indexed");
        metrics::counter!("index.images.inserted").increment(1);

        Ok(id)
    }

    /// Get image metadata by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        row.map(ImageRecord::try_from).transpose()
    }

    /// Get image metadata by relative filename
    pub async fn get_by_filename(&self, filename: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_COLUMNS} WHERE filename = ?1"))
            .bind(filename)
            .fetch_optional(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        row.map(ImageRecord::try_from).transpose()
    }

    /// Most recent image by capture time
    pub async fn latest(&self) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_COLUMNS} ORDER BY captured_at_ms DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        row.map(ImageRecord::try_from).transpose()
    }

    /// List images newest first, optionally restricted to one local calendar day
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ImageQuery) -> Result<ImagePage> {
        let (start_ms, end_ms) = match query.date.as_deref() {
            Some(date) => {
                let (start, end) = local_day_bounds(date)?;
                (Some(start), Some(end))
            }
            None => (None, None),
        };

        let page = query.page.max(1) as i64;
        let per_page = query.per_page.max(1) as i64;
        let offset = (page - 1) * per_page;

        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE (?1 IS NULL OR captured_at_ms >= ?1)
              AND (?2 IS NULL OR captured_at_ms < ?2)
            ORDER BY captured_at_ms DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#
        ))
        .bind(start_ms)
        .bind(end_ms)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM images
            WHERE (?1 IS NULL OR captured_at_ms >= ?1)
              AND (?2 IS NULL OR captured_at_ms < ?2)
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(PipelineError::Database)?;

        let items = rows
            .into_iter()
            .map(ImageRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(ImagePage { items, total })
    }

    /// Total number of indexed images
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        Ok(count)
    }

    /// Delete a record by ID
    #[instrument(skip(self))]
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(id));
        }

        Ok(())
    }

    /// Delete a record by relative filename, returning whether a row existed
    pub async fn delete_by_filename(&self, filename: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM images WHERE filename = ?1")
            .bind(filename)
            .execute(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// IDs and paths of records whose raw file no longer exists on disk
    pub async fn missing_files(&self) -> Result<Vec<(i64, PathBuf)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, filepath FROM images ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::Database)?;

        Ok(rows
            .into_iter()
            .map(|(id, path)| (id, PathBuf::from(path)))
            .filter(|(_, path)| !path.exists())
            .collect())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// UTC epoch-millisecond bounds `[start, end)` of a local calendar day.
fn local_day_bounds(date: &str) -> Result<(i64, i64)> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
        PipelineError::Validation("invalid date format, use YYYY-MM-DD".to_string())
    })?;
    let next = day
        .succ_opt()
        .ok_or_else(|| PipelineError::Validation(format!("date {date} is out of range")))?;

    Ok((local_midnight_ms(day), local_midnight_ms(next)))
}

fn local_midnight_ms(day: NaiveDate) -> i64 {
    let midnight = day.and_time(chrono::NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        // Midnight skipped by a DST jump: fall back to the UTC reading
        .unwrap_or_else(|| midnight.and_utc().timestamp_millis())
}
