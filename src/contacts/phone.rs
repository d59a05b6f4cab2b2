//! Phone number normalisation for local mobile numbers.

/// Digits after the country code in a complete mobile number
pub const LOCAL_DIGITS: usize = 9;

/// Normalise to `+<country code><local number>`.
///
/// Accepts `<cc>…`, `0…` and bare local numbers in any punctuation.
/// Anything that does not end up with a full local number is rejected.
pub fn normalize(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let local = if let Some(rest) = digits.strip_prefix(country_code) {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else if digits.len() == LOCAL_DIGITS {
        digits.as_str()
    } else {
        return None;
    };

    if local.len() != LOCAL_DIGITS {
        return None;
    }
    Some(format!("+{}{}", country_code, local))
}

/// True when the number normalises into the given country
pub fn is_local(raw: &str, country_code: &str) -> bool {
    normalize(raw, country_code)
        .map(|n| n.starts_with(&format!("+{}", country_code)))
        .unwrap_or(false)
}

/// `+255 712 345 678`; the input is returned unchanged when it does not normalise
pub fn format_for_display(raw: &str, country_code: &str) -> String {
    match normalize(raw, country_code) {
        Some(normalized) => {
            let local = &normalized[1 + country_code.len()..];
            format!(
                "+{} {} {} {}",
                country_code,
                &local[..3],
                &local[3..6],
                &local[6..]
            )
        }
        None => raw.to_string(),
    }
}

/// First three local digits, used for placeholder names
pub fn local_prefix<'a>(normalized: &'a str, country_code: &str) -> Option<&'a str> {
    normalized
        .strip_prefix('+')
        .and_then(|n| n.strip_prefix(country_code))
        .and_then(|local| local.get(..3))
}
