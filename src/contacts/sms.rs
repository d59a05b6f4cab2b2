use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::collections::HashMap;

use super::phone::{local_prefix, normalize};
use super::{widen, Contact, Direction, HistoryEntry, HistoryKind, ImportError, SOURCE_SMS, UNKNOWN_CONTACT};

lazy_static! {
    static ref SHORT_CODE: Regex = Regex::new(r"^\d{3,5}$").unwrap();
}

/// Senders that are services, not people
const SYSTEM_SENDERS: &[&str] = &[
    "TIGOPESA",
    "Tigopesa",
    "Tigo Packs",
    "CRDB BANK",
    "JIHUDUMIE",
    "15670",
    "SILENTOCEAN",
    "B2B DATA",
    "MIXX BY YAS",
];

#[derive(Debug, Default)]
pub struct SmsExtract {
    pub contacts: Vec<Contact>,
    pub history: Vec<HistoryEntry>,
    /// Every `<sms>` element, including skipped ones
    pub messages_total: usize,
}

#[derive(Debug, Default)]
struct SmsRecord {
    address: String,
    body: String,
    date: Option<DateTime<Utc>>,
    readable_date: String,
    kind: String,
    contact_name: Option<String>,
}

pub(crate) fn is_system_sender(address: &str) -> bool {
    let address = address.trim();
    SYSTEM_SENDERS.contains(&address)
        || address.chars().count() < 10
        || SHORT_CODE.is_match(address)
}

fn placeholder_name(normalized: &str, country_code: &str) -> String {
    match local_prefix(normalized, country_code) {
        Some(prefix) => format!("Contact {}***", prefix),
        None => UNKNOWN_CONTACT.to_string(),
    }
}

fn read_record(element: &BytesStart<'_>) -> Result<SmsRecord, ImportError> {
    let mut record = SmsRecord::default();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ImportError::Xml(e.to_string()))?;
        // Emoji in backups are often written as surrogate-pair references, which do not unescape
        let value = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        match attr.key.as_ref() {
            b"address" => record.address = value,
            b"body" => record.body = value,
            b"date" => {
                record.date = value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }
            b"readable_date" => record.readable_date = value,
            b"type" => record.kind = value,
            b"contact_name" => {
                let name = value.trim();
                if !name.is_empty() && name != "(Unknown)" {
                    record.contact_name = Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(record)
}

/// Parse an SMS backup (`<smses><sms address=".." body=".." date=".." type=".."/>..</smses>`)
pub fn parse_sms_backup(xml: &str, country_code: &str) -> Result<SmsExtract, ImportError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_root = false;
    let mut extract = SmsExtract::default();
    let mut contacts: HashMap<String, Contact> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ImportError::Xml(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        let element = match event {
            Event::Start(e) | Event::Empty(e) => e,
            Event::Eof => break,
            _ => continue,
        };

        match element.name().as_ref() {
            b"smses" => saw_root = true,
            b"sms" => {
                extract.messages_total += 1;
                let record = read_record(&element)?;
                if is_system_sender(&record.address) {
                    continue;
                }
                let phone = match normalize(&record.address, country_code) {
                    Some(p) => p,
                    None => continue,
                };

                let contact = contacts.entry(phone.clone()).or_insert_with(|| {
                    order.push(phone.clone());
                    let name = record
                        .contact_name
                        .clone()
                        .unwrap_or_else(|| placeholder_name(&phone, country_code));
                    let mut contact = Contact::new(phone.clone(), name);
                    contact.add_source(SOURCE_SMS);
                    contact.from_sms = true;
                    contact
                });
                contact.message_count += 1;
                if let Some(at) = record.date {
                    widen(&mut contact.first_message_at, &mut contact.last_message_at, at);
                }

                extract.history.push(HistoryEntry {
                    phone,
                    kind: HistoryKind::Sms,
                    direction: if record.kind.trim() == "1" {
                        Direction::Received
                    } else {
                        Direction::Sent
                    },
                    message: record.body,
                    sent_at: record
                        .date
                        .map(|d| d.to_rfc3339())
                        .unwrap_or(record.readable_date),
                    contact_name: record.contact_name,
                });
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(ImportError::Xml("missing <smses> root element".to_string()));
    }

    extract.contacts = order
        .into_iter()
        .filter_map(|phone| contacts.remove(&phone))
        .collect();
    Ok(extract)
}
