use crate::config::Config;
use crate::thumbnail::ThumbnailIdentity;
use anyhow::{Context, Result};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// A pending alternate-format generation, keyed by the full cache tuple.
/// Rows are drained and deleted by an out-of-process batch generator; this
/// service only ever appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedGeneration {
    pub file_path: String,
    pub file_type: String,
    pub width: u32,
    pub height: u32,
    pub quality: Option<u8>,
}

impl QueuedGeneration {
    pub fn from_identity(identity: &ThumbnailIdentity) -> Self {
        Self {
            file_path: identity.source_path().to_string(),
            file_type: identity.format().as_str().to_string(),
            width: identity.size().width,
            height: identity.size().height,
            quality: identity.quality(),
        }
    }
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db directory {:?}", parent))?;
            }
        }
        let db_url = format!("sqlite://{}?mode=rwc", config.db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .context("connect to sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS d_queue (
          file_path TEXT NOT NULL,
          file_type TEXT NOT NULL,
          width INTEGER NOT NULL,
          height INTEGER NOT NULL,
          quality INTEGER,
          registered_at INTEGER NOT NULL,
          UNIQUE(file_path, file_type, width, height, quality)
        );
        "#;
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    /// Registers a pending generation. Returns the number of rows inserted:
    /// 1 for a fresh entry, 0 when the same tuple is already queued or when
    /// the store is momentarily locked (the next request will retry the
    /// insert anyway). Any other store error propagates.
    pub async fn enqueue_generation(&self, request: &QueuedGeneration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO d_queue (file_path, file_type, width, height, quality, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&request.file_path)
        .bind(&request.file_type)
        .bind(request.width)
        .bind(request.height)
        .bind(request.quality)
        .bind(now_epoch())
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(sqlx::Error::Database(db_err)) if db_err.kind() == ErrorKind::UniqueViolation => {
                Ok(0)
            }
            Err(sqlx::Error::Database(db_err)) if is_busy(db_err.as_ref()) => {
                warn!(
                    file_path = %request.file_path,
                    file_type = %request.file_type,
                    "queue store busy; generation not registered"
                );
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(test)]
    pub async fn queued_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM d_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

fn is_busy(db_err: &dyn sqlx::error::DatabaseError) -> bool {
    match db_err.code().as_deref() {
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
        Some("5" | "6" | "261" | "262" | "517") => true,
        _ => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
