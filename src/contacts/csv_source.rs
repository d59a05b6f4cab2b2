use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::io::Read;

use super::phone::{is_local, normalize};
use super::{column, field, Contact, ImportError, SOURCE_CSV, UNKNOWN_CONTACT};

lazy_static! {
    static ref NAME_NOISE: Regex = Regex::new(r"[^A-Za-z0-9_\s\-.]").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsvStats {
    pub total: usize,
    pub local: usize,
    pub valid: usize,
    pub invalid: usize,
}

#[derive(Debug, Default)]
pub struct CsvExtract {
    pub contacts: Vec<Contact>,
    pub stats: CsvStats,
}

/// Strip emoji and punctuation from a contact name
pub(crate) fn clean_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() || name == "Unknown" {
        return UNKNOWN_CONTACT.to_string();
    }
    let cleaned = NAME_NOISE.replace_all(name, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        UNKNOWN_CONTACT.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Parse a contacts CSV with `Phone, Name, Email, Address, Source` columns
/// (lower-case headers are accepted too).
pub fn parse_contacts_csv<R: Read>(reader: R, country_code: &str) -> Result<CsvExtract, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let phone_col = column(&headers, &["Phone", "phone"]).ok_or(ImportError::MissingColumn("Phone"))?;
    let name_col = column(&headers, &["Name", "name"]);
    let email_col = column(&headers, &["Email", "email"]);
    let address_col = column(&headers, &["Address", "address"]);
    let source_col = column(&headers, &["Source", "source"]);

    let mut extract = CsvExtract::default();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        extract.stats.total += 1;

        let raw_phone = field(&record, Some(phone_col));
        let phone = match normalize(raw_phone, country_code) {
            Some(p) => p,
            None => {
                extract.stats.invalid += 1;
                continue;
            }
        };
        if !is_local(&phone, country_code) {
            continue;
        }
        extract.stats.local += 1;

        let mut contact = Contact::new(phone, clean_name(field(&record, name_col)));
        contact.email = field(&record, email_col).to_string();
        contact.address = field(&record, address_col).to_string();
        let source = match field(&record, source_col) {
            "" => SOURCE_CSV,
            s => s,
        };
        contact.add_source(source);
        contact.from_csv = true;

        extract.contacts.push(contact);
        extract.stats.valid += 1;
    }

    Ok(extract)
}
