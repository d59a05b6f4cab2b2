//! Offline analysis of an exported messages CSV for promotion targeting.
//!
//! Messages from services (banks, mobile money, platforms) are dropped, the
//! rest are grouped into one [`CustomerProfile`] per phone number, scored, and
//! sorted into promotion segments.

mod profile;
mod segment;

pub use profile::{
    extract_phone, is_real_customer_message, normalize_id, CustomerProfile, CustomerType, Message,
    UNKNOWN_CUSTOMER,
};
pub use segment::{
    customer_type, engagement_score, loyalty_score, Segment, SegmentKind, TOP_PROFILES,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::contacts::parse_timestamp;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("failed to serialise report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub customers: usize,
    /// Messages that passed the customer filter
    pub messages_considered: usize,
    pub messages_total: usize,
    pub analysis_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub summary: AnalysisSummary,
    pub segments: Vec<Segment>,
    pub customers: Vec<CustomerProfile>,
}

impl AnalysisReport {
    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments.iter().find(|s| s.kind == kind)
    }

    pub fn to_json(&self) -> Result<String, AnalysisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), AnalysisError> {
        std::fs::write(path, self.to_json()?).map_err(|source| AnalysisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Analysis report written");
        Ok(())
    }
}

fn column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Read the messages export. Returns the messages and the number of data rows.
/// Rows shorter than the header are counted but skipped.
pub fn read_messages<R: Read>(reader: R) -> Result<(Vec<Message>, usize), AnalysisError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let text_col = column(&headers, "Text").ok_or(AnalysisError::MissingColumn("Text"))?;
    let sender_id_col =
        column(&headers, "Sender ID").ok_or(AnalysisError::MissingColumn("Sender ID"))?;
    let date_col = column(&headers, "Message Date");
    let session_col = column(&headers, "Chat Session");
    let service_col = column(&headers, "Service");
    let type_col = column(&headers, "Type");
    let name_col = column(&headers, "Sender Name");

    let mut messages = Vec::new();
    let mut total = 0;
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        total += 1;
        if record.len() < headers.len() {
            continue;
        }

        let get = |index: Option<usize>| {
            index
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .to_string()
        };
        messages.push(Message {
            chat_session: get(session_col),
            date: date_col.and_then(|i| record.get(i)).and_then(parse_timestamp),
            service: get(service_col),
            kind: get(type_col),
            sender_id: get(Some(sender_id_col)),
            sender_name: get(name_col),
            text: get(Some(text_col)),
        });
    }
    Ok((messages, total))
}

/// Profile, score and segment the messages as of `now`
pub fn analyze(messages: &[Message], messages_total: usize, now: DateTime<Utc>) -> AnalysisReport {
    let mut profiles: Vec<CustomerProfile> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut considered = 0;

    for message in messages {
        if !is_real_customer_message(message) {
            continue;
        }
        considered += 1;

        let phone = match extract_phone(message) {
            Some(p) => p,
            None => {
                debug!(sender = %message.sender_name, "No phone number in message, skipping");
                continue;
            }
        };
        let id = normalize_id(&phone);
        let slot = match index.get(&id) {
            Some(&slot) => slot,
            None => match CustomerProfile::from_message(message) {
                Some(profile) => {
                    profiles.push(profile);
                    index.insert(id, profiles.len() - 1);
                    profiles.len() - 1
                }
                None => continue,
            },
        };
        profiles[slot].record(message);
    }

    for profile in profiles.iter_mut() {
        segment::score(profile, now);
    }
    let segments = segment::segments(&profiles, now);

    info!(
        customers = profiles.len(),
        messages = considered,
        total = messages_total,
        "Customer analysis complete"
    );
    for s in &segments {
        info!(segment = ?s.kind, count = s.count, "{}", s.reason);
    }

    AnalysisReport {
        summary: AnalysisSummary {
            customers: profiles.len(),
            messages_considered: considered,
            messages_total,
            analysis_date: now,
        },
        segments,
        customers: profiles,
    }
}

/// Read and analyse an export file
pub fn analyze_file(path: &Path, now: DateTime<Utc>) -> Result<AnalysisReport, AnalysisError> {
    let file = std::fs::File::open(path).map_err(|source| AnalysisError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (messages, total) = read_messages(file)?;
    Ok(analyze(&messages, total, now))
}

/// `customer-analysis-<date>.json` for the analysis date
pub fn default_report_name(now: DateTime<Utc>) -> String {
    format!("customer-analysis-{}.json", now.format("%Y-%m-%d"))
}
