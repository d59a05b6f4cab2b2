use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::row::history_key;
use super::{customer_row, history_row, Contact, HistoryEntry, HistoryKind, ImportError};
use crate::backend::{Backend, BackendError, Filter, InsertOptions, Privilege, Query, RetryPolicy};
use crate::config::ImportConfig;
use crate::db::{ChunkCounts, ChunkStatus, DbPool, ImportProgress};

pub const CUSTOMERS_TABLE: &str = "customers";
pub const COMMUNICATIONS_TABLE: &str = "customer_communications";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub planned: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
    pub chunks_done: usize,
    /// Chunks finished by an earlier run of the same job
    pub chunks_resumed: usize,
    pub chunks_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub imported: usize,
    /// Already present on the backend or repeated in the input
    pub skipped: usize,
    pub unknown_customer: usize,
    pub errors: usize,
    pub chunks_done: usize,
    pub chunks_resumed: usize,
    pub chunks_failed: usize,
}

/// Lookups shared by the chunks of one history import
#[derive(Default)]
struct HistoryCache {
    /// phone to customer id; `None` when no customer has the phone
    customers: HashMap<String, Option<String>>,
    /// customers whose existing communications are in `seen`
    loaded: HashSet<String>,
    seen: HashSet<String>,
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Writes contacts and their history to the backend in resumable chunks
pub struct Importer {
    backend: Arc<dyn Backend>,
    pool: DbPool,
    config: ImportConfig,
    retry: RetryPolicy,
}

impl Importer {
    pub fn new(
        backend: Arc<dyn Backend>,
        pool: DbPool,
        config: ImportConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
            retry,
        }
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    async fn pause(&self) {
        if self.config.batch_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
        }
    }

    /// Import `contacts` as customers.
    ///
    /// A chunk finished by an earlier run is skipped only when the same offset
    /// still holds the same phones; anything else is imported again, and the
    /// pre-filter skips customers that already exist.
    pub async fn run(
        &self,
        contacts: &[Contact],
        job: &str,
        dry_run: bool,
    ) -> Result<ImportStats, ImportError> {
        let size = self.batch_size();
        let done = self.completed_chunks(job, size).await?;
        let total_chunks = contacts.len().div_ceil(size);
        let mut stats = ImportStats {
            planned: contacts.len(),
            ..Default::default()
        };

        info!(
            job,
            contacts = contacts.len(),
            chunks = total_chunks,
            batch_size = size,
            already_done = done.len(),
            dry_run,
            "Starting customer import"
        );

        let now = Utc::now();
        let mut first = true;
        for (index, chunk) in contacts.chunks(size).enumerate() {
            let offset = index * size;
            let fingerprint = ImportProgress::fingerprint(chunk.iter().map(|c| c.phone.as_str()));
            match done.get(&offset) {
                Some(recorded) if *recorded == fingerprint => {
                    stats.chunks_resumed += 1;
                    info!(job, chunk = index + 1, offset, "Chunk already imported, skipping");
                    continue;
                }
                Some(_) => {
                    warn!(job, chunk = index + 1, offset, "Chunk contents changed since the last run, importing again");
                }
                None => {}
            }
            if dry_run {
                for contact in chunk {
                    let row = customer_row(contact, &self.config, now);
                    info!(job, offset, "[dry-run] {}", row);
                }
                continue;
            }

            if !first {
                self.pause().await;
            }
            first = false;

            match self.import_chunk(chunk, now).await {
                Ok(counts) => {
                    info!(
                        job,
                        chunk = index + 1,
                        total = total_chunks,
                        imported = counts.imported,
                        skipped = counts.skipped,
                        "Chunk imported"
                    );
                    ImportProgress::new(job, offset, size, ChunkStatus::Done, counts, None)
                        .with_fingerprint(fingerprint)
                        .record(&self.pool)
                        .await?;
                    stats.imported += counts.imported;
                    stats.skipped += counts.skipped;
                    stats.chunks_done += 1;
                }
                Err(err) => {
                    error!(
                        job,
                        chunk = index + 1,
                        total = total_chunks,
                        offset,
                        error_kind = err.kind(),
                        "Chunk failed: {}",
                        err
                    );
                    let counts = ChunkCounts {
                        errors: chunk.len(),
                        ..Default::default()
                    };
                    ImportProgress::new(
                        job,
                        offset,
                        size,
                        ChunkStatus::Failed,
                        counts,
                        Some(err.to_string()),
                    )
                    .with_fingerprint(fingerprint)
                    .record(&self.pool)
                    .await?;
                    stats.errors += chunk.len();
                    stats.chunks_failed += 1;
                }
            }
        }

        info!(
            job,
            imported = stats.imported,
            skipped = stats.skipped,
            errors = stats.errors,
            resumed = stats.chunks_resumed,
            "Customer import finished"
        );
        Ok(stats)
    }

    /// Fingerprints of finished chunks, by offset. Offsets only line up when
    /// every run of a job uses the same batch size.
    async fn completed_chunks(
        &self,
        job: &str,
        size: usize,
    ) -> Result<HashMap<usize, String>, ImportError> {
        if let Some(&recorded) = ImportProgress::batch_sizes(&self.pool, job)
            .await?
            .iter()
            .find(|&&s| s != size)
        {
            return Err(ImportError::BatchSizeChanged {
                job: job.to_string(),
                recorded,
                current: size,
            });
        }
        Ok(ImportProgress::completed_chunks(&self.pool, job).await?)
    }

    async fn import_chunk(
        &self,
        chunk: &[Contact],
        now: DateTime<Utc>,
    ) -> Result<ChunkCounts, BackendError> {
        let query = Query::new()
            .columns("phone")
            .filter(Filter::in_list("phone", chunk.iter().map(|c| c.phone.as_str())));
        let existing: HashSet<String> = self
            .retry
            .run("select customers", || {
                self.backend.select(CUSTOMERS_TABLE, &query, Privilege::Service)
            })
            .await?
            .iter()
            .filter_map(|row| row.get("phone").and_then(as_text))
            .collect();

        let rows: Vec<Value> = chunk
            .iter()
            .filter(|c| !existing.contains(&c.phone))
            .map(|c| customer_row(c, &self.config, now))
            .collect();
        let mut counts = ChunkCounts {
            skipped: chunk.len() - rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(counts);
        }

        let options = self
            .config
            .conflict_column
            .as_deref()
            .map(InsertOptions::upsert)
            .unwrap_or_default();
        let inserted = self
            .retry
            .run("insert customers", || {
                self.backend.insert(CUSTOMERS_TABLE, &rows, &options)
            })
            .await?;

        // Upserts that hit an existing row come back without it
        counts.imported = inserted.len();
        counts.skipped += rows.len().saturating_sub(inserted.len());
        Ok(counts)
    }

    /// Attach SMS and call history to the customers created by [`Importer::run`].
    ///
    /// Entries for phones with no customer are counted and dropped. Entries
    /// that already exist on the backend are skipped, so re-running is safe.
    pub async fn import_history(
        &self,
        entries: &[HistoryEntry],
        job: &str,
    ) -> Result<HistoryStats, ImportError> {
        let job = format!("{}-history", job);
        let size = self.batch_size();
        let done = self.completed_chunks(&job, size).await?;
        let mut stats = HistoryStats::default();
        let mut cache = HistoryCache::default();

        info!(job = %job, entries = entries.len(), batch_size = size, "Starting history import");

        let now = Utc::now();
        let mut first = true;
        for (index, chunk) in entries.chunks(size).enumerate() {
            let offset = index * size;
            let fingerprint = ImportProgress::fingerprint(chunk.iter().map(|e| {
                format!("{}|{}|{}|{}", e.phone, e.kind.as_str(), e.sent_at, e.message)
            }));
            if done.get(&offset) == Some(&fingerprint) {
                stats.chunks_resumed += 1;
                continue;
            }
            if !first {
                self.pause().await;
            }
            first = false;

            match self.import_history_chunk(chunk, &mut cache, now).await {
                Ok((counts, unknown)) => {
                    ImportProgress::new(&job, offset, size, ChunkStatus::Done, counts, None)
                        .with_fingerprint(fingerprint)
                        .record(&self.pool)
                        .await?;
                    stats.imported += counts.imported;
                    stats.skipped += counts.skipped - unknown;
                    stats.unknown_customer += unknown;
                    stats.chunks_done += 1;
                }
                Err(err) => {
                    error!(job = %job, offset, error_kind = err.kind(), "History chunk failed: {}", err);
                    let counts = ChunkCounts {
                        errors: chunk.len(),
                        ..Default::default()
                    };
                    ImportProgress::new(
                        &job,
                        offset,
                        size,
                        ChunkStatus::Failed,
                        counts,
                        Some(err.to_string()),
                    )
                    .with_fingerprint(fingerprint)
                    .record(&self.pool)
                    .await?;
                    stats.errors += chunk.len();
                    stats.chunks_failed += 1;
                }
            }
        }

        if stats.unknown_customer > 0 {
            warn!(job = %job, entries = stats.unknown_customer, "History entries without a customer were dropped");
        }
        info!(
            job = %job,
            imported = stats.imported,
            skipped = stats.skipped,
            errors = stats.errors,
            "History import finished"
        );
        Ok(stats)
    }

    /// Returns the chunk counters and how many of the skipped entries had no customer
    async fn import_history_chunk(
        &self,
        chunk: &[HistoryEntry],
        cache: &mut HistoryCache,
        now: DateTime<Utc>,
    ) -> Result<(ChunkCounts, usize), BackendError> {
        let unresolved: Vec<&str> = chunk
            .iter()
            .map(|e| e.phone.as_str())
            .filter(|p| !cache.customers.contains_key(*p))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !unresolved.is_empty() {
            let query = Query::new()
                .columns("id,phone")
                .filter(Filter::in_list("phone", &unresolved));
            let found = self
                .retry
                .run("select customers", || {
                    self.backend.select(CUSTOMERS_TABLE, &query, Privilege::Service)
                })
                .await?;
            for phone in &unresolved {
                cache.customers.insert(phone.to_string(), None);
            }
            for row in found {
                if let (Some(id), Some(phone)) =
                    (row.get("id").and_then(as_text), row.get("phone").and_then(as_text))
                {
                    cache.customers.insert(phone, Some(id));
                }
            }
        }

        let unloaded: Vec<String> = chunk
            .iter()
            .filter_map(|e| cache.customers.get(&e.phone).cloned().flatten())
            .filter(|id| !cache.loaded.contains(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !unloaded.is_empty() {
            let query = Query::new()
                .columns("customer_id,type,sent_at,message")
                .filter(Filter::in_list("customer_id", &unloaded));
            let existing = self
                .retry
                .run("select communications", || {
                    self.backend
                        .select(COMMUNICATIONS_TABLE, &query, Privilege::Service)
                })
                .await?;
            for row in existing {
                let text = |column: &str| row.get(column).and_then(as_text).unwrap_or_default();
                let kind = match text("type").as_str() {
                    "sms" => HistoryKind::Sms,
                    "phone_call" => HistoryKind::PhoneCall,
                    _ => continue,
                };
                cache.seen.insert(history_key(
                    &text("customer_id"),
                    kind,
                    &text("sent_at"),
                    &text("message"),
                ));
            }
            cache.loaded.extend(unloaded);
        }

        let mut counts = ChunkCounts::default();
        let mut unknown = 0;
        let mut pending = HashSet::new();
        let mut rows = Vec::new();
        for entry in chunk {
            let customer_id = match cache.customers.get(&entry.phone) {
                Some(Some(id)) => id,
                _ => {
                    unknown += 1;
                    counts.skipped += 1;
                    continue;
                }
            };
            let key = history_key(customer_id, entry.kind, &entry.sent_at, &entry.message);
            if cache.seen.contains(&key) || !pending.insert(key) {
                counts.skipped += 1;
                continue;
            }
            rows.push(history_row(entry, customer_id, now));
        }

        if !rows.is_empty() {
            let options = InsertOptions::default();
            let inserted = self
                .retry
                .run("insert communications", || {
                    self.backend.insert(COMMUNICATIONS_TABLE, &rows, &options)
                })
                .await?;
            counts.imported = inserted.len();
        }
        cache.seen.extend(pending);
        Ok((counts, unknown))
    }
}
