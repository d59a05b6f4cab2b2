use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::profile::{CustomerProfile, CustomerType};

/// Profiles listed per segment in the report
pub const TOP_PROFILES: usize = 10;

const HIGH_VALUE_SPEND: u64 = 100_000;

pub fn customer_type(profile: &CustomerProfile) -> CustomerType {
    let business = profile.business_indicators.len();
    let personal = profile.personal_indicators.len();
    if business > personal {
        CustomerType::Business
    } else if personal > business {
        CustomerType::Personal
    } else {
        CustomerType::Mixed
    }
}

/// 0-100: message frequency (40), recency (30), two-way conversation (30)
pub fn engagement_score(profile: &CustomerProfile, now: DateTime<Utc>) -> u32 {
    let mut score = match profile.message_count {
        n if n >= 50 => 40,
        n if n >= 20 => 30,
        n if n >= 10 => 20,
        n if n >= 5 => 10,
        _ => 0,
    };

    if let Some(last) = profile.last_activity {
        score += match (now - last).num_days() {
            d if d <= 7 => 30,
            d if d <= 30 => 20,
            d if d <= 90 => 10,
            _ => 0,
        };
    }

    let ratio = profile.incoming_count as f64 / profile.outgoing_count.max(1) as f64;
    score += if ratio >= 0.5 {
        30
    } else if ratio >= 0.3 {
        20
    } else if ratio >= 0.1 {
        10
    } else {
        0
    };

    score.min(100)
}

/// 0-100: message frequency (30), service diversity (25), relationship (25), few complaints (20)
pub fn loyalty_score(profile: &CustomerProfile) -> u32 {
    let mut score = match profile.message_count {
        n if n >= 100 => 30,
        n if n >= 50 => 25,
        n if n >= 20 => 20,
        n if n >= 10 => 15,
        n if n >= 5 => 10,
        _ => 0,
    };
    score += match profile.service_types.len() {
        0 => 0,
        1 => 15,
        2 => 20,
        _ => 25,
    };
    if profile.personal_indicators.contains("personal_relationship") {
        score += 25;
    } else if profile.personal_indicators.contains("casual_greeting") {
        score += 15;
    }
    score += match profile.complaint_count {
        0 => 20,
        1..=2 => 10,
        _ => 0,
    };
    score.min(100)
}

/// Fill in the derived fields of a profile
pub fn score(profile: &mut CustomerProfile, now: DateTime<Utc>) {
    profile.customer_type = customer_type(profile);
    profile.engagement_score = engagement_score(profile, now);
    profile.loyalty_score = loyalty_score(profile);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Active,
    Business,
    Personal,
    New,
    Loyal,
    HighValue,
    FrequentBuyers,
    Inactive,
    Complaints,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 9] = [
        SegmentKind::Active,
        SegmentKind::Business,
        SegmentKind::Personal,
        SegmentKind::New,
        SegmentKind::Loyal,
        SegmentKind::HighValue,
        SegmentKind::FrequentBuyers,
        SegmentKind::Inactive,
        SegmentKind::Complaints,
    ];

    pub fn reason(&self) -> &'static str {
        match self {
            SegmentKind::Active => "Active customers - maintain engagement with regular offers",
            SegmentKind::Business => "Business customers - offer B2B services and bulk discounts",
            SegmentKind::Personal => {
                "Personal customers - offer individual services and personal touch"
            }
            SegmentKind::New => "New customers - welcome offers and onboarding",
            SegmentKind::Loyal => "Loyal customers - retention and advocacy programs",
            SegmentKind::HighValue => "High spending customers - offer premium products/services",
            SegmentKind::FrequentBuyers => {
                "Regular customers - offer loyalty rewards and bulk discounts"
            }
            SegmentKind::Inactive => "Inactive customers - re-engagement campaigns",
            SegmentKind::Complaints => "Customers with complaints - service recovery",
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            SegmentKind::Active => "Regular promotions, loyalty rewards, new product announcements",
            SegmentKind::Business => "Bulk pricing, business packages, corporate services",
            SegmentKind::Personal => {
                "Personalized offers, individual discounts, relationship building"
            }
            SegmentKind::New => {
                "Welcome discounts, service introductions, first-time buyer offers"
            }
            SegmentKind::Loyal => "Exclusive benefits, referral programs, VIP treatment",
            SegmentKind::HighValue => {
                "VIP treatment, exclusive offers, early access to new products"
            }
            SegmentKind::FrequentBuyers => "Volume discounts, loyalty points, referral bonuses",
            SegmentKind::Inactive => "Win-back offers, special discounts, \"we miss you\" messages",
            SegmentKind::Complaints => {
                "Apology offers, service improvements, satisfaction surveys"
            }
        }
    }

    /// Whether a scored profile belongs to this segment
    pub fn includes(&self, profile: &CustomerProfile, now: DateTime<Utc>) -> bool {
        let within = |at: Option<DateTime<Utc>>, days: i64| {
            at.map(|at| at > now - Duration::days(days)).unwrap_or(false)
        };
        match self {
            SegmentKind::Active => within(profile.last_activity, 30),
            SegmentKind::Business => {
                profile.customer_type == CustomerType::Business
                    || !profile.business_indicators.is_empty()
            }
            SegmentKind::Personal => {
                profile.customer_type == CustomerType::Personal
                    || !profile.personal_indicators.is_empty()
            }
            SegmentKind::New => within(profile.first_activity, 30),
            SegmentKind::Loyal => profile.loyalty_score > 70 && profile.engagement_score > 60,
            SegmentKind::HighValue => profile.total_spent > HIGH_VALUE_SPEND,
            SegmentKind::FrequentBuyers => profile.purchase_count >= 3,
            SegmentKind::Inactive => profile
                .last_activity
                .map(|at| at < now - Duration::days(90))
                .unwrap_or(false),
            SegmentKind::Complaints => profile.complaint_count > 0,
        }
    }

    /// Order members by what matters most for the segment; stable otherwise
    fn rank(&self, members: &mut [&CustomerProfile]) {
        match self {
            SegmentKind::Active => members.sort_by(|a, b| b.engagement_score.cmp(&a.engagement_score)),
            SegmentKind::Business => members.sort_by(|a, b| {
                b.business_indicators.len().cmp(&a.business_indicators.len())
            }),
            SegmentKind::Loyal => members.sort_by(|a, b| b.loyalty_score.cmp(&a.loyalty_score)),
            SegmentKind::HighValue => members.sort_by(|a, b| b.total_spent.cmp(&a.total_spent)),
            SegmentKind::FrequentBuyers => {
                members.sort_by(|a, b| b.purchase_count.cmp(&a.purchase_count))
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub reason: &'static str,
    pub strategy: &'static str,
    pub count: usize,
    /// Best-ranked members, at most [`TOP_PROFILES`]
    pub customers: Vec<CustomerProfile>,
}

/// Build every segment from scored profiles
pub fn segments(profiles: &[CustomerProfile], now: DateTime<Utc>) -> Vec<Segment> {
    SegmentKind::ALL
        .iter()
        .map(|kind| {
            let mut members: Vec<&CustomerProfile> =
                profiles.iter().filter(|p| kind.includes(p, now)).collect();
            kind.rank(&mut members);
            Segment {
                kind: *kind,
                reason: kind.reason(),
                strategy: kind.strategy(),
                count: members.len(),
                customers: members.into_iter().take(TOP_PROFILES).cloned().collect(),
            }
        })
        .collect()
}
