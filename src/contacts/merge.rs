use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use super::{Contact, UNKNOWN_CONTACT};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub sms_only: usize,
    pub csv_only: usize,
    pub call_log_only: usize,
    /// Contacts seen in two or more sources
    pub merged: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Sorted by phone
    pub contacts: Vec<Contact>,
    pub stats: MergeStats,
}

fn is_placeholder(name: &str) -> bool {
    let name = name.trim();
    name.is_empty()
        || name == UNKNOWN_CONTACT
        || (name.starts_with("Contact ") && name.ends_with("***"))
}

/// Prefer a real name over a placeholder, then the longer one
pub fn choose_better_name(current: &str, candidate: &str) -> String {
    let better = match (is_placeholder(current), is_placeholder(candidate)) {
        (true, false) => candidate,
        (false, true) => current,
        _ if current.chars().count() > candidate.chars().count() => current,
        _ if candidate.trim().is_empty() => current,
        _ => candidate,
    };
    better.to_string()
}

/// Merge the three sources by phone. Statistics come from where each final
/// contact was seen, so a contact present in all three counts once as merged.
pub fn merge_contacts(sms: &[Contact], csv: &[Contact], calls: &[Contact]) -> MergeOutcome {
    let mut merged: BTreeMap<String, Contact> = BTreeMap::new();

    for contact in sms {
        match merged.get_mut(&contact.phone) {
            Some(existing) => {
                existing.message_count += contact.message_count;
                existing.from_sms = true;
            }
            None => {
                merged.insert(contact.phone.clone(), contact.clone());
            }
        }
    }

    for contact in csv {
        match merged.get_mut(&contact.phone) {
            Some(existing) => {
                existing.name = choose_better_name(&existing.name, &contact.name);
                if !contact.email.is_empty() {
                    existing.email = contact.email.clone();
                }
                if !contact.address.is_empty() {
                    existing.address = contact.address.clone();
                }
                for source in &contact.sources {
                    existing.add_source(source);
                }
                existing.from_csv = true;
            }
            None => {
                merged.insert(contact.phone.clone(), contact.clone());
            }
        }
    }

    for contact in calls {
        match merged.get_mut(&contact.phone) {
            Some(existing) => {
                existing.name = choose_better_name(&existing.name, &contact.name);
                for source in &contact.sources {
                    existing.add_source(source);
                }
                existing.calls = contact.calls.clone();
                existing.from_call_log = true;
            }
            None => {
                merged.insert(contact.phone.clone(), contact.clone());
            }
        }
    }

    let mut stats = MergeStats::default();
    for contact in merged.values() {
        match (contact.from_sms, contact.from_csv, contact.from_call_log) {
            (true, false, false) => stats.sms_only += 1,
            (false, true, false) => stats.csv_only += 1,
            (false, false, true) => stats.call_log_only += 1,
            (false, false, false) => {}
            _ => stats.merged += 1,
        }
    }
    stats.total = merged.len();

    info!(
        total = stats.total,
        merged = stats.merged,
        sms_only = stats.sms_only,
        csv_only = stats.csv_only,
        call_log_only = stats.call_log_only,
        "Merged contacts"
    );

    MergeOutcome {
        contacts: merged.into_values().collect(),
        stats,
    }
}
