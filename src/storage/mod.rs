//! Storage bucket management.

use serde::Serialize;
use tracing::info;

use crate::backend::{Backend, BackendError, Bucket, NewBucket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

pub async fn list(backend: &dyn Backend) -> Result<Vec<Bucket>, BackendError> {
    let mut buckets = backend.list_buckets().await?;
    buckets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(buckets)
}

/// Create the bucket unless it exists. A create that races another client and
/// reports a duplicate also counts as existing.
pub async fn ensure_bucket(
    backend: &dyn Backend,
    name: &str,
    public: bool,
) -> Result<EnsureOutcome, BackendError> {
    if name.trim().is_empty() {
        return Err(BackendError::InvalidRequest("bucket name is empty".to_string()));
    }

    let existing = backend.list_buckets().await?;
    if existing.iter().any(|b| b.name == name || b.id == name) {
        info!(bucket = name, "Bucket already exists");
        return Ok(EnsureOutcome::AlreadyExists);
    }

    match backend.create_bucket(&NewBucket::new(name, public)).await {
        Ok(()) => {
            info!(bucket = name, public, "Bucket created");
            Ok(EnsureOutcome::Created)
        }
        Err(e) if e.is_conflict() => {
            info!(bucket = name, "Bucket already exists");
            Ok(EnsureOutcome::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}
