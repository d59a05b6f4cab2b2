use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{format_duration, Contact, HistoryEntry, HistoryKind, SOURCE_CALL_LOG};
use crate::config::ImportConfig;

/// Human-readable provenance stored with the customer
pub fn initial_notes(contact: &Contact) -> String {
    let mut notes = Vec::new();
    if !contact.sources.is_empty() {
        notes.push(format!("Imported from: {}", contact.sources.join(", ")));
    }
    if contact.message_count > 0 {
        notes.push(format!("SMS messages: {}", contact.message_count));
    }
    let calls = &contact.calls;
    if calls.count > 0 {
        notes.push(format!(
            "Calls: {} ({})",
            calls.count,
            format_duration(calls.total_duration_secs)
        ));
        if calls.incoming > 0 {
            notes.push(format!("Incoming: {}", calls.incoming));
        }
        if calls.outgoing > 0 {
            notes.push(format!("Outgoing: {}", calls.outgoing));
        }
        if calls.missed > 0 {
            notes.push(format!("Missed: {}", calls.missed));
        }
    }
    notes.join(". ")
}

pub fn loyalty_level(contact: &Contact) -> &'static str {
    match contact.activity() {
        n if n >= 50 => "platinum",
        n if n >= 20 => "gold",
        n if n >= 10 => "silver",
        _ => "bronze",
    }
}

pub fn color_tag(contact: &Contact) -> &'static str {
    let frequent_caller =
        contact.sources.iter().any(|s| s == SOURCE_CALL_LOG) && contact.calls.count > 10;
    if frequent_caller {
        "vip"
    } else if contact.message_count > 20 {
        "purchased"
    } else {
        "new"
    }
}

/// Row for the `customers` table
pub fn customer_row(contact: &Contact, config: &ImportConfig, now: DateTime<Utc>) -> Value {
    let city = if contact.address.trim().is_empty() {
        config.default_city.as_str()
    } else {
        contact.address.as_str()
    };
    let now = now.to_rfc3339();
    json!({
        "name": contact.name,
        "phone": contact.phone,
        "email": contact.email,
        "gender": "other",
        "city": city,
        "whatsapp": contact.phone,
        "referral_source": contact.sources.join(", "),
        "initial_notes": initial_notes(contact),
        "loyalty_level": loyalty_level(contact),
        "color_tag": color_tag(contact),
        "is_active": true,
        "created_at": now,
        "updated_at": now,
    })
}

/// Row for the `customer_communications` table
pub fn history_row(entry: &HistoryEntry, customer_id: &str, now: DateTime<Utc>) -> Value {
    json!({
        "customer_id": customer_id,
        "type": entry.kind.as_str(),
        "message": entry.message,
        "status": entry.status(),
        "phone_number": entry.phone,
        "sent_at": entry.sent_at,
        "created_at": now.to_rfc3339(),
    })
}

/// Identity of a communication row for de-duplication. SMS bodies are part of
/// the key since several messages can share a timestamp.
pub(crate) fn history_key(customer_id: &str, kind: HistoryKind, sent_at: &str, message: &str) -> String {
    match kind {
        HistoryKind::Sms => format!("{}|{}|{}|{}", customer_id, kind.as_str(), sent_at, message),
        HistoryKind::PhoneCall => format!("{}|{}|{}", customer_id, kind.as_str(), sent_at),
    }
}
