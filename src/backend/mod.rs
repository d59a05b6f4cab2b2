//! Client for the hosted Postgres backend.
//!
//! The backend exposes three surfaces that every maintenance task uses:
//! - table endpoints (`/rest/v1/<table>`) with PostgREST-style filters
//! - RPC endpoints (`/rest/v1/rpc/<function>`), including the raw SQL escape hatch
//! - storage bucket endpoints (`/storage/v1/bucket`)
//!
//! Higher layers depend on the [`Backend`] trait so they can run against a fake.

mod client;
mod error;
mod retry;

#[cfg(test)]
pub mod testing;

pub use client::{parse_content_range, RestBackend};
pub use error::BackendError;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which API key a request is made with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Public key, subject to row-level security
    Anon,
    /// Service-role key, bypasses row-level security
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsValue {
    Null,
    True,
    False,
}

impl IsValue {
    fn as_str(&self) -> &'static str {
        match self {
            IsValue::Null => "null",
            IsValue::True => "true",
            IsValue::False => "false",
        }
    }
}

/// A single column filter
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    Neq(String, String),
    Gt(String, String),
    Gte(String, String),
    Lt(String, String),
    Lte(String, String),
    Like(String, String),
    ILike(String, String),
    Is(String, IsValue),
    In(String, Vec<String>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Eq(column.into(), value.to_string())
    }

    pub fn neq(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Neq(column.into(), value.to_string())
    }

    pub fn gte(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Gte(column.into(), value.to_string())
    }

    pub fn lt(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Lt(column.into(), value.to_string())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::Is(column.into(), IsValue::Null)
    }

    pub fn in_list<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Filter::In(
            column.into(),
            values.into_iter().map(|v| v.to_string()).collect(),
        )
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _)
            | Filter::Neq(c, _)
            | Filter::Gt(c, _)
            | Filter::Gte(c, _)
            | Filter::Lt(c, _)
            | Filter::Lte(c, _)
            | Filter::Like(c, _)
            | Filter::ILike(c, _)
            | Filter::Is(c, _)
            | Filter::In(c, _) => c,
        }
    }

    /// Render the right-hand side of `column=<op>.<value>`
    pub fn render(&self) -> String {
        match self {
            Filter::Eq(_, v) => format!("eq.{}", v),
            Filter::Neq(_, v) => format!("neq.{}", v),
            Filter::Gt(_, v) => format!("gt.{}", v),
            Filter::Gte(_, v) => format!("gte.{}", v),
            Filter::Lt(_, v) => format!("lt.{}", v),
            Filter::Lte(_, v) => format!("lte.{}", v),
            Filter::Like(_, v) => format!("like.{}", v),
            Filter::ILike(_, v) => format!("ilike.{}", v),
            Filter::Is(_, v) => format!("is.{}", v.as_str()),
            Filter::In(_, values) => {
                let items: Vec<String> = values.iter().map(|v| quote_list_item(v)).collect();
                format!("in.({})", items.join(","))
            }
        }
    }

    pub fn to_pair(&self) -> (String, String) {
        (self.column().to_string(), self.render())
    }
}

/// Quote a value inside an `in.(...)` list when it carries reserved characters.
fn quote_list_item(value: &str) -> String {
    let reserved = value
        .chars()
        .any(|c| matches!(c, ',' | '(' | ')' | '"' | '\\' | ':') || c.is_whitespace());
    if !reserved && !value.is_empty() {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// A read query against a table endpoint
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "select".to_string(),
            self.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        pairs.extend(self.filters.iter().map(Filter::to_pair));
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", column, direction)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// How conflicting rows are handled on insert
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Unique column for upserts; plain insert when `None`
    pub on_conflict: Option<String>,
    /// Update existing rows instead of skipping them
    pub merge_duplicates: bool,
}

impl InsertOptions {
    pub fn upsert(column: impl Into<String>) -> Self {
        Self {
            on_conflict: Some(column.into()),
            merge_duplicates: false,
        }
    }

    pub fn prefer_header(&self) -> String {
        match (&self.on_conflict, self.merge_duplicates) {
            (Some(_), true) => "return=representation,resolution=merge-duplicates".to_string(),
            (Some(_), false) => "return=representation,resolution=ignore-duplicates".to_string(),
            (None, _) => "return=representation".to_string(),
        }
    }
}

/// A storage bucket as listed by the storage API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewBucket {
    pub id: String,
    pub name: String,
    pub public: bool,
}

impl NewBucket {
    pub fn new(name: impl Into<String>, public: bool) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            public,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        privilege: Privilege,
    ) -> Result<Vec<Value>, BackendError>;

    /// Exact row count for the filters
    async fn count(
        &self,
        table: &str,
        filters: &[Filter],
        privilege: Privilege,
    ) -> Result<u64, BackendError>;

    async fn insert(
        &self,
        table: &str,
        rows: &[Value],
        options: &InsertOptions,
    ) -> Result<Vec<Value>, BackendError>;

    /// Refuses to run without filters
    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Value,
    ) -> Result<Vec<Value>, BackendError>;

    /// Refuses to run without filters; returns the number of deleted rows
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, BackendError>;

    async fn rpc(
        &self,
        function: &str,
        args: &Value,
        privilege: Privilege,
    ) -> Result<Value, BackendError>;

    /// Run raw SQL through the exec-SQL RPC function
    async fn exec_sql(&self, sql: &str) -> Result<(), BackendError>;

    async fn list_buckets(&self) -> Result<Vec<Bucket>, BackendError>;

    async fn create_bucket(&self, bucket: &NewBucket) -> Result<(), BackendError>;

    /// Cheap reachability check against the REST root
    async fn ping(&self) -> Result<(), BackendError>;
}
