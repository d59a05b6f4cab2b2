//! Per-chunk import progress, keyed by `(job, chunk_offset)`.
//!
//! A chunk only counts as done for a later run when that run cuts the same
//! window (same batch size and offset) over the same items (same fingerprint).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::collections::HashMap;

use crate::db::DbPool;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Done,
    Failed,
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkStatus::Done => write!(f, "done"),
            ChunkStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Row counters for one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportProgress {
    pub job: String,
    pub chunk_offset: i64,
    /// Batch size the job was cut with
    pub chunk_size: i64,
    /// sha256 of the keys of the items in the chunk
    pub fingerprint: String,
    pub status: String,
    pub imported: i64,
    pub skipped: i64,
    pub errors: i64,
    pub last_error: Option<String>,
    pub updated_at: String,
}

/// Totals over every recorded chunk of a job
#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct ImportSummary {
    pub chunks_done: i64,
    pub chunks_failed: i64,
    pub imported: i64,
    pub skipped: i64,
    pub errors: i64,
    pub last_updated: Option<String>,
}

impl ImportProgress {
    pub fn new(
        job: &str,
        chunk_offset: usize,
        chunk_size: usize,
        status: ChunkStatus,
        counts: ChunkCounts,
        last_error: Option<String>,
    ) -> Self {
        Self {
            job: job.to_string(),
            chunk_offset: chunk_offset as i64,
            chunk_size: chunk_size as i64,
            fingerprint: String::new(),
            status: status.to_string(),
            imported: counts.imported as i64,
            skipped: counts.skipped as i64,
            errors: counts.errors as i64,
            last_error,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn is_done(&self) -> bool {
        self.status == "done"
    }

    /// Insert or overwrite the row for this chunk
    pub async fn record(&self, pool: &DbPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO import_progress
                (job, chunk_offset, chunk_size, fingerprint, status, imported, skipped, errors, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job, chunk_offset) DO UPDATE SET
                chunk_size = excluded.chunk_size,
                fingerprint = excluded.fingerprint,
                status = excluded.status,
                imported = excluded.imported,
                skipped = excluded.skipped,
                errors = excluded.errors,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.job)
        .bind(self.chunk_offset)
        .bind(self.chunk_size)
        .bind(&self.fingerprint)
        .bind(&self.status)
        .bind(self.imported)
        .bind(self.skipped)
        .bind(self.errors)
        .bind(&self.last_error)
        .bind(&self.updated_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Fingerprints of chunks that finished successfully, by offset
    pub async fn completed_chunks(pool: &DbPool, job: &str) -> sqlx::Result<HashMap<usize, String>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT chunk_offset, fingerprint FROM import_progress WHERE job = ? AND status = 'done'",
        )
        .bind(job)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(o, f)| (o as usize, f)).collect())
    }

    /// Distinct batch sizes recorded for a job
    pub async fn batch_sizes(pool: &DbPool, job: &str) -> sqlx::Result<Vec<usize>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT chunk_size FROM import_progress WHERE job = ? ORDER BY chunk_size",
        )
        .bind(job)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s as usize).collect())
    }

    pub async fn list(pool: &DbPool, job: &str) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, ImportProgress>(
            "SELECT * FROM import_progress WHERE job = ? ORDER BY chunk_offset",
        )
        .bind(job)
        .fetch_all(pool)
        .await
    }

    pub async fn summary(pool: &DbPool, job: &str) -> sqlx::Result<ImportSummary> {
        sqlx::query_as::<_, ImportSummary>(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END), 0) AS chunks_done,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS chunks_failed,
                COALESCE(SUM(imported), 0) AS imported,
                COALESCE(SUM(skipped), 0) AS skipped,
                COALESCE(SUM(errors), 0) AS errors,
                MAX(updated_at) AS last_updated
            FROM import_progress
            WHERE job = ?
            "#,
        )
        .bind(job)
        .fetch_one(pool)
        .await
    }

    /// Identify the items of a chunk by their keys, in order
    pub fn fingerprint<I, S>(keys: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for key in keys {
            hasher.update(key.as_ref().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Forget all progress for a job; returns the number of removed chunk rows
    pub async fn reset(pool: &DbPool, job: &str) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM import_progress WHERE job = ?")
            .bind(job)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
