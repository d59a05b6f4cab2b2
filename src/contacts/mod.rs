//! Bulk customer import from phone exports.
//!
//! Three sources feed the import: an SMS backup (XML), a contacts CSV and a
//! call-log CSV. Each is reduced to [`Contact`]s keyed by normalised phone
//! number, merged, turned into `customers` rows and written in chunks whose
//! progress is kept in the local ledger.

mod call_log;
mod csv_source;
mod importer;
mod merge;
pub mod phone;
mod row;
mod sms;

pub use call_log::{parse_call_log, parse_duration, CallLogExtract, CallLogStats};
pub use csv_source::{parse_contacts_csv, CsvExtract, CsvStats};
pub use importer::{HistoryStats, ImportStats, Importer};
pub use merge::{choose_better_name, merge_contacts, MergeOutcome, MergeStats};
pub use row::{color_tag, customer_row, history_row, initial_notes, loyalty_level};
pub use sms::{parse_sms_backup, SmsExtract};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::backend::BackendError;
use crate::config::ImportConfig;

pub const SOURCE_SMS: &str = "SMS Backup";
pub const SOURCE_CSV: &str = "CSV Import";
pub const SOURCE_CALL_LOG: &str = "Call Log";
pub const UNKNOWN_CONTACT: &str = "Unknown Contact";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid SMS backup: {0}")]
    Xml(String),

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("nothing to import: no source files given")]
    NoSources,

    #[error("job '{job}' was recorded with batch size {recorded}, now {current}; restore the batch size or run `import reset --job {job}`")]
    BatchSizeChanged {
        job: String,
        recorded: usize,
        current: usize,
    },
}

/// Call activity for one contact
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub count: u32,
    pub total_duration_secs: u64,
    pub incoming: u32,
    pub outgoing: u32,
    pub missed: u32,
    pub first_call_at: Option<DateTime<Utc>>,
    pub last_call_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Contact {
    /// Normalised, e.g. `+255712345678`
    pub phone: String,
    pub name: String,
    pub email: String,
    pub address: String,
    /// Source labels in first-seen order, without duplicates
    pub sources: Vec<String>,
    pub message_count: u32,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub calls: CallStats,
    pub from_sms: bool,
    pub from_csv: bool,
    pub from_call_log: bool,
}

impl Contact {
    pub fn new(phone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_source(&mut self, source: &str) {
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
    }

    /// Messages plus calls
    pub fn activity(&self) -> u32 {
        self.message_count + self.calls.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Sms,
    PhoneCall,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Sms => "sms",
            HistoryKind::PhoneCall => "phone_call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Sent,
    Incoming,
    Outgoing,
    Missed,
    Unknown,
}

/// One message or call to attach to a customer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub phone: String,
    pub kind: HistoryKind,
    pub direction: Direction,
    pub message: String,
    /// RFC 3339 when the source date could be parsed, the raw text otherwise
    pub sent_at: String,
    pub contact_name: Option<String>,
}

impl HistoryEntry {
    pub fn status(&self) -> &'static str {
        if self.direction == Direction::Missed {
            "failed"
        } else {
            "delivered"
        }
    }
}

/// Parsed sources ready to merge
#[derive(Debug, Default)]
pub struct Sources {
    pub sms: Option<SmsExtract>,
    pub csv: Option<CsvExtract>,
    pub calls: Option<CallLogExtract>,
}

impl Sources {
    pub fn load(
        sms: Option<&Path>,
        csv: Option<&Path>,
        calls: Option<&Path>,
        config: &ImportConfig,
    ) -> Result<Self, ImportError> {
        if sms.is_none() && csv.is_none() && calls.is_none() {
            return Err(ImportError::NoSources);
        }
        let country_code = config.country_code.as_str();

        let sms = sms
            .map(|path| read_to_string(path).and_then(|xml| parse_sms_backup(&xml, country_code)))
            .transpose()?;
        let csv = csv
            .map(|path| open(path).and_then(|file| parse_contacts_csv(file, country_code)))
            .transpose()?;
        let calls = calls
            .map(|path| {
                open(path).and_then(|file| {
                    parse_call_log(file, country_code, config.own_number.as_deref())
                })
            })
            .transpose()?;

        if let Some(s) = &sms {
            info!(contacts = s.contacts.len(), messages = s.messages_total, history = s.history.len(), "Read SMS backup");
        }
        if let Some(c) = &csv {
            info!(contacts = c.contacts.len(), total = c.stats.total, invalid = c.stats.invalid, "Read contacts CSV");
        }
        if let Some(c) = &calls {
            info!(
                contacts = c.contacts.len(),
                calls = c.stats.local,
                duration = %format_duration(c.stats.total_duration_secs),
                "Read call log"
            );
        }

        Ok(Self { sms, csv, calls })
    }

    pub fn merge(&self) -> MergeOutcome {
        merge_contacts(
            self.sms.as_ref().map(|s| s.contacts.as_slice()).unwrap_or(&[]),
            self.csv.as_ref().map(|c| c.contacts.as_slice()).unwrap_or(&[]),
            self.calls.as_ref().map(|c| c.contacts.as_slice()).unwrap_or(&[]),
        )
    }

    /// SMS history followed by call history, in file order
    pub fn history(&self) -> Vec<HistoryEntry> {
        let mut entries = Vec::new();
        if let Some(s) = &self.sms {
            entries.extend(s.history.iter().cloned());
        }
        if let Some(c) = &self.calls {
            entries.extend(c.history.iter().cloned());
        }
        entries
    }
}

fn read_to_string(path: &Path) -> Result<String, ImportError> {
    std::fs::read_to_string(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn open(path: &Path) -> Result<std::fs::File, ImportError> {
    std::fs::File::open(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Index of the first header matching any of `names`
pub(crate) fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
}

pub(crate) fn field<'a>(record: &'a csv::StringRecord, index: Option<usize>) -> &'a str {
    index
        .and_then(|i| record.get(i))
        .map(str::trim)
        .unwrap_or("")
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%b %d, %Y %I:%M:%S %p",
    "%d %b %Y %H:%M:%S",
];

/// Parse the date formats seen in phone exports. Naive times are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Keep the earliest and latest of the seen timestamps
pub(crate) fn widen(first: &mut Option<DateTime<Utc>>, last: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if first.map(|f| at < f).unwrap_or(true) {
        *first = Some(at);
    }
    if last.map(|l| at > l).unwrap_or(true) {
        *last = Some(at);
    }
}

pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
