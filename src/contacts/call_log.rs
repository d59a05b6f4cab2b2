use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;

use super::phone::normalize;
use super::{
    column, field, format_duration, parse_timestamp, widen, Contact, Direction, HistoryEntry,
    HistoryKind, ImportError, SOURCE_CALL_LOG, UNKNOWN_CONTACT,
};

lazy_static! {
    static ref DURATION: Regex = Regex::new(r"(\d+)h\s+(\d+)m\s+(\d+)s").unwrap();
    // Business names in call logs use `|` as a separator, so it survives cleaning
    static ref NAME_NOISE: Regex = Regex::new(r"[^A-Za-z0-9_\s\-.|]").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallLogStats {
    pub total: usize,
    /// Calls with a usable local counterpart number
    pub local: usize,
    pub incoming: usize,
    pub outgoing: usize,
    pub missed: usize,
    pub total_duration_secs: u64,
}

impl CallLogStats {
    pub fn average_duration_secs(&self) -> u64 {
        if self.local == 0 {
            0
        } else {
            self.total_duration_secs / self.local as u64
        }
    }
}

#[derive(Debug, Default)]
pub struct CallLogExtract {
    pub contacts: Vec<Contact>,
    pub history: Vec<HistoryEntry>,
    pub stats: CallLogStats,
}

/// `00h 01m 06s` to seconds; anything else counts as zero
pub fn parse_duration(raw: &str) -> u64 {
    DURATION
        .captures(raw)
        .map(|caps| {
            let part = |i: usize| caps[i].parse::<u64>().unwrap_or(0);
            part(1) * 3600 + part(2) * 60 + part(3)
        })
        .unwrap_or(0)
}

fn clean_call_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() || name == "Unknown" {
        return UNKNOWN_CONTACT.to_string();
    }
    let cleaned = NAME_NOISE.replace_all(name, "");
    match cleaned.trim() {
        "" => UNKNOWN_CONTACT.to_string(),
        s => s.to_string(),
    }
}

fn direction(kind: &str) -> Direction {
    match kind.trim().to_ascii_lowercase().as_str() {
        "incoming" => Direction::Incoming,
        "outgoing" => Direction::Outgoing,
        "missed" => Direction::Missed,
        _ => Direction::Unknown,
    }
}

/// Parse a call-log CSV (`From Number, To Number, Name, Date Time, Duration, Type`).
///
/// The counterpart of each call is the number that is not `own_number`. Without
/// an own number, outgoing calls use the `To` number and everything else `From`.
pub fn parse_call_log<R: Read>(
    reader: R,
    country_code: &str,
    own_number: Option<&str>,
) -> Result<CallLogExtract, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let from_col = column(&headers, &["From Number", "from_number"])
        .ok_or(ImportError::MissingColumn("From Number"))?;
    let to_col = column(&headers, &["To Number", "to_number"])
        .ok_or(ImportError::MissingColumn("To Number"))?;
    let date_col = column(&headers, &["Date Time", "date_time"])
        .ok_or(ImportError::MissingColumn("Date Time"))?;
    let name_col = column(&headers, &["Name", "name"]);
    let duration_col = column(&headers, &["Duration", "duration"]);
    let type_col = column(&headers, &["Type", "type"]);

    let own = own_number.and_then(|n| normalize(n, country_code));

    let mut extract = CallLogExtract::default();
    let mut contacts: HashMap<String, Contact> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for record in reader.records() {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        extract.stats.total += 1;

        let from = field(&record, Some(from_col));
        let to = field(&record, Some(to_col));
        let date_time = field(&record, Some(date_col));
        if from.is_empty() || to.is_empty() || date_time.is_empty() {
            continue;
        }

        let call_direction = direction(field(&record, type_col));
        let counterpart = match &own {
            Some(own) if normalize(from, country_code).as_ref() == Some(own) => to,
            Some(_) => from,
            None if call_direction == Direction::Outgoing => to,
            None => from,
        };
        let phone = match normalize(counterpart, country_code) {
            Some(p) => p,
            None => continue,
        };

        extract.stats.local += 1;
        let seconds = parse_duration(field(&record, duration_col));
        extract.stats.total_duration_secs += seconds;
        match call_direction {
            Direction::Incoming => extract.stats.incoming += 1,
            Direction::Outgoing => extract.stats.outgoing += 1,
            Direction::Missed => extract.stats.missed += 1,
            _ => {}
        }

        let raw_name = field(&record, name_col);
        let contact = contacts.entry(phone.clone()).or_insert_with(|| {
            order.push(phone.clone());
            let mut contact = Contact::new(phone.clone(), clean_call_name(raw_name));
            contact.add_source(SOURCE_CALL_LOG);
            contact.from_call_log = true;
            contact
        });

        let calls = &mut contact.calls;
        calls.count += 1;
        calls.total_duration_secs += seconds;
        match call_direction {
            Direction::Incoming => calls.incoming += 1,
            Direction::Outgoing => calls.outgoing += 1,
            Direction::Missed => calls.missed += 1,
            _ => {}
        }
        let at = parse_timestamp(date_time);
        if let Some(at) = at {
            widen(&mut calls.first_call_at, &mut calls.last_call_at, at);
        }

        let label = match call_direction {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Missed => "missed",
            _ => "unknown",
        };
        extract.history.push(HistoryEntry {
            phone,
            kind: HistoryKind::PhoneCall,
            direction: call_direction,
            message: format!("Call {} - Duration: {}", label, format_duration(seconds)),
            sent_at: at
                .map(|a| a.to_rfc3339())
                .unwrap_or_else(|| date_time.to_string()),
            contact_name: Some(raw_name.to_string()).filter(|n| !n.is_empty()),
        });
    }

    extract.contacts = order
        .into_iter()
        .filter_map(|phone| contacts.remove(&phone))
        .collect();
    Ok(extract)
}
