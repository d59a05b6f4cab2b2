use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;

lazy_static! {
    static ref PHONE: Regex = Regex::new(r"(\+?255|0)?[67]\d{8}").unwrap();
    static ref LONG_NUMBER: Regex = Regex::new(r"[0-9]{9,}").unwrap();
    static ref AMOUNT: Regex = Regex::new(r"(?i)(?:tsh|tzs|sh)\s*([0-9,]+)").unwrap();
    static ref PERSONAL_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)mambo|vipi|habari|asante|sawa|kaka|boss|mkuu").unwrap(),
        Regex::new(r"(?i)niko|nakuja|nakufata").unwrap(),
        Regex::new(r"(?i)gari|simu|charge|network").unwrap(),
        Regex::new(r"(?i)laki|pesa|malipo").unwrap(),
    ];
}

/// Banks, mobile money and messaging platforms; matched case-insensitively as substrings
const SERVICE_NAMES: &[&str] = &[
    "crdb bank",
    "crdbbank",
    "vodacom",
    "tigopesa",
    "m-pesa",
    "m-pesa card",
    "du.",
    "equitybank",
    "mixx by yas",
    "whatsapp",
    "imessage",
];

pub const UNKNOWN_CUSTOMER: &str = "Unknown Customer";

/// One row of the messages export
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub chat_session: String,
    pub date: Option<DateTime<Utc>>,
    pub service: String,
    /// `Incoming` or `Outgoing`
    pub kind: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
}

fn mentions_service(value: &str) -> bool {
    let value = value.to_lowercase();
    SERVICE_NAMES.iter().any(|s| value.contains(s))
}

/// Display names that belong to a service rather than a person
fn is_service_name(name: &str) -> bool {
    mentions_service(name) || name.to_lowercase().contains("sms")
}

/// Whether a message comes from a person rather than a service notification
pub fn is_real_customer_message(message: &Message) -> bool {
    if mentions_service(&message.sender_id) || mentions_service(&message.sender_name) {
        return false;
    }
    if LONG_NUMBER.is_match(&message.sender_id) {
        return true;
    }
    if !message.sender_name.trim().is_empty() {
        return true;
    }
    PERSONAL_PATTERNS.iter().any(|p| p.is_match(&message.text))
}

/// First mobile number in the sender id, then in the sender name
pub fn extract_phone(message: &Message) -> Option<String> {
    PHONE
        .find(&message.sender_id)
        .or_else(|| PHONE.find(&message.sender_name))
        .map(|m| m.as_str().to_string())
}

/// Digits-only customer id in international form
pub fn normalize_id(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.starts_with("255") {
        digits
    } else if digits.len() == 10 && digits.starts_with('0') {
        format!("255{}", &digits[1..])
    } else if digits.len() == 9 {
        format!("255{}", digits)
    } else {
        digits
    }
}

fn customer_name(message: &Message) -> String {
    let name = message.sender_name.trim();
    if !name.is_empty() && !is_service_name(name) {
        return name.to_string();
    }
    let session = message.chat_session.trim();
    if !session.is_empty() && !is_service_name(session) {
        return session.to_string();
    }
    UNKNOWN_CUSTOMER.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerType {
    Business,
    Personal,
    Mixed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerProfile {
    pub id: String,
    pub phone: String,
    pub name: String,
    pub message_count: u32,
    pub incoming_count: u32,
    pub outgoing_count: u32,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub business_indicators: BTreeSet<&'static str>,
    pub personal_indicators: BTreeSet<&'static str>,
    pub service_types: BTreeSet<&'static str>,
    pub payment_methods: BTreeSet<&'static str>,
    pub locations: BTreeSet<&'static str>,
    pub languages: BTreeSet<&'static str>,
    pub complaint_count: u32,
    pub purchase_count: u32,
    pub total_spent: u64,
    pub engagement_score: u32,
    pub loyalty_score: u32,
    pub customer_type: CustomerType,
}

fn any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

impl CustomerProfile {
    pub fn new(id: String, phone: String, name: String) -> Self {
        Self {
            id,
            phone,
            name,
            message_count: 0,
            incoming_count: 0,
            outgoing_count: 0,
            first_activity: None,
            last_activity: None,
            business_indicators: BTreeSet::new(),
            personal_indicators: BTreeSet::new(),
            service_types: BTreeSet::new(),
            payment_methods: BTreeSet::new(),
            locations: BTreeSet::new(),
            languages: BTreeSet::new(),
            complaint_count: 0,
            purchase_count: 0,
            total_spent: 0,
            engagement_score: 0,
            loyalty_score: 0,
            customer_type: CustomerType::Mixed,
        }
    }

    /// Start a profile from the first message that carries a phone number
    pub fn from_message(message: &Message) -> Option<Self> {
        let phone = extract_phone(message)?;
        Some(Self::new(normalize_id(&phone), phone, customer_name(message)))
    }

    pub fn record(&mut self, message: &Message) {
        self.message_count += 1;
        if let Some(at) = message.date {
            crate::contacts::widen(&mut self.first_activity, &mut self.last_activity, at);
        }
        match message.kind.trim() {
            "Incoming" => self.incoming_count += 1,
            "Outgoing" => self.outgoing_count += 1,
            _ => {}
        }
        self.analyze_text(&message.text);
    }

    fn analyze_text(&mut self, text: &str) {
        let text = text.to_lowercase();
        let text = text.as_str();

        if any(text, &["business", "company", "office", "biashara", "kampuni"]) {
            self.business_indicators.insert("business_mention");
        }
        if any(text, &["gari", "car", "vehicle"]) {
            self.business_indicators.insert("vehicle_related");
        }
        if any(text, &["laki", "million", "thousand", "pesa", "malipo"]) {
            self.business_indicators.insert("financial_discussion");
        }

        if any(text, &["mambo", "vipi", "habari", "asante", "sawa"]) {
            self.personal_indicators.insert("casual_greeting");
        }
        if any(text, &["kaka", "boss", "mkuu", "dada", "rafiki"]) {
            self.personal_indicators.insert("personal_relationship");
        }
        if any(text, &["niko", "nakuja", "nakufata", "uko wapi", "location"]) {
            self.personal_indicators.insert("location_coordination");
        }

        if any(text, &["repair", "fix", "tengeneza", "simu", "phone"]) {
            self.service_types.insert("repair");
        }
        if any(text, &["buy", "purchase", "nunua", "ununue", "ununua"]) {
            self.service_types.insert("purchase");
            self.purchase_count += 1;
        }
        if any(text, &["sell", "uza", "uzi"]) {
            self.service_types.insert("sell");
        }

        if any(text, &["complaint", "complain", "problem", "tatizo", "mbaya", "shida"]) {
            self.complaint_count += 1;
        }

        if any(text, &["m-pesa", "mpesa"]) {
            self.payment_methods.insert("m-pesa");
        }
        if any(text, &["cash", "pesa"]) {
            self.payment_methods.insert("cash");
        }
        if any(text, &["card", "kadi"]) {
            self.payment_methods.insert("card");
        }

        if text.contains("dar") {
            self.locations.insert("Dar es Salaam");
        }
        if text.contains("arusha") {
            self.locations.insert("Arusha");
        }
        if any(text, &["dubai", "uae"]) {
            self.locations.insert("Dubai");
        }

        if any(text, &["habari", "asante", "sawa", "mambo", "vipi"]) {
            self.languages.insert("Swahili");
        }
        if any(text, &["hello", "thank you", "okay"]) {
            self.languages.insert("English");
        }

        for caps in AMOUNT.captures_iter(text) {
            let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(amount) = digits.parse::<u64>() {
                self.total_spent = self.total_spent.saturating_add(amount);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: &str, sender_name: &str, text: &str) -> Message {
        Message {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            kind: "Incoming".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_senders_are_rejected() {
        assert!(!is_real_customer_message(&message("CRDB BANK", "", "Salio lako")));
        assert!(!is_real_customer_message(&message("+255712345678", "M-PESA", "")));
        assert!(!is_real_customer_message(&message("", "WhatsApp", "mambo")));
    }

    #[test]
    fn test_people_are_accepted() {
        assert!(is_real_customer_message(&message("+255712345678", "", "")));
        assert!(is_real_customer_message(&message("", "Mama Asha", "")));
        assert!(is_real_customer_message(&message("", "", "Mambo kaka, simu iko tayari?")));
        assert!(!is_real_customer_message(&message("12345", "", "ok")));
    }

    #[test]
    fn test_extract_phone_and_normalize() {
        assert_eq!(
            extract_phone(&message("chat +255712345678", "", "")).as_deref(),
            Some("+255712345678")
        );
        assert_eq!(
            extract_phone(&message("", "Juma 0754000111", "")).as_deref(),
            Some("0754000111")
        );
        assert_eq!(extract_phone(&message("12345", "Asha", "")), None);

        assert_eq!(normalize_id("+255712345678"), "255712345678");
        assert_eq!(normalize_id("0754000111"), "255754000111");
        assert_eq!(normalize_id("754000111"), "255754000111");
        assert_eq!(normalize_id("12345"), "12345");
    }

    #[test]
    fn test_name_falls_back_to_chat_session() {
        let mut m = message("+255712345678", "SMS", "");
        m.chat_session = "Fundi Juma".to_string();
        assert_eq!(customer_name(&m), "Fundi Juma");
        m.chat_session = "WhatsApp".to_string();
        assert_eq!(customer_name(&m), UNKNOWN_CUSTOMER);
    }

    #[test]
    fn test_text_analysis() {
        let m = message(
            "+255712345678",
            "Juma",
            "Habari kaka, nataka kununua simu kwa biashara. Nimetuma Tsh 150,000 kwa M-Pesa, niko Dar",
        );
        let mut profile = CustomerProfile::from_message(&m).unwrap();
        profile.record(&m);

        assert_eq!(profile.id, "255712345678");
        assert_eq!(profile.incoming_count, 1);
        assert!(profile.business_indicators.contains("business_mention"));
        assert!(profile.personal_indicators.contains("casual_greeting"));
        assert!(profile.personal_indicators.contains("personal_relationship"));
        assert!(profile.personal_indicators.contains("location_coordination"));
        assert!(profile.service_types.contains("repair"));
        assert!(profile.service_types.contains("purchase"));
        assert_eq!(profile.purchase_count, 1);
        assert!(profile.payment_methods.contains("m-pesa"));
        assert!(profile.locations.contains("Dar es Salaam"));
        assert!(profile.languages.contains("Swahili"));
        assert_eq!(profile.total_spent, 150_000);
    }

    #[test]
    fn test_complaints_counted_per_message() {
        let m = message("+255712345678", "Juma", "Simu ina shida");
        let mut profile = CustomerProfile::from_message(&m).unwrap();
        profile.record(&m);
        profile.record(&m);
        assert_eq!(profile.complaint_count, 2);
        assert_eq!(profile.message_count, 2);
    }

    #[test]
    fn test_huge_amounts_saturate() {
        let m = message(
            "+255712345678",
            "Juma",
            "Tsh 18,000,000,000,000,000,000 na Tsh 18,000,000,000,000,000,000",
        );
        let mut profile = CustomerProfile::from_message(&m).unwrap();
        profile.record(&m);
        profile.record(&m);
        assert_eq!(profile.total_spent, u64::MAX);
    }
}
