//! Phone number validation and candidate discovery.
//!
//! Everything here is pure: no I/O, no logging, safe to call from rayon workers.

use std::sync::OnceLock;

use regex::Regex;

/// Placeholder values older exports use for "no phone".
const SENTINELS: &[&str] = &["N/A", "NA", "", "NULL", "ERROR", "NONE", "NAN"];

/// The candidate did not normalise to a `(DDD) DDD-DDDD` number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a phone number: {candidate:?}")]
pub struct NotAPhoneNumber {
    pub candidate: String,
}

impl NotAPhoneNumber {
    fn new(candidate: &str) -> Self {
        NotAPhoneNumber {
            candidate: candidate.to_string(),
        }
    }
}

/// Normalise `candidate` to the canonical `(DDD) DDD-DDDD` form.
///
/// Only the digits count: separators, labels and a `+1`/`1` country prefix
/// are ignored. A digit count other than 10 (11 with a leading `1`) rejects
/// the candidate.
pub fn validate(candidate: &str) -> Result<String, NotAPhoneNumber> {
    let trimmed = candidate.trim();
    if SENTINELS.iter().any(|s| trimmed.eq_ignore_ascii_case(s)) {
        return Err(NotAPhoneNumber::new(candidate));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('1') => &digits[1..],
        _ => return Err(NotAPhoneNumber::new(candidate)),
    };

    Ok(format!(
        "({}) {}-{}",
        &national[0..3],
        &national[3..6],
        &national[6..10]
    ))
}

/// True when `s` already is exactly `(DDD) DDD-DDDD`.
pub fn is_canonical(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\(\d{3}\) \d{3}-\d{4}$").unwrap());
    re.is_match(s)
}

/// Pick the phone candidate for a captured listing page.
///
/// Tiers, first acceptable wins: the number revealed by the call button, the
/// `tel:` link inside the reply panel, a strictly formatted number anywhere in
/// the page, then a loosely formatted one. Loose matches must carry at least
/// one separator so bare post ids are not mistaken for phones. The returned
/// string is the raw candidate text, not the canonical form.
pub fn find_candidate(html: &str, revealed: Option<&str>) -> Option<String> {
    static TEL: OnceLock<Regex> = OnceLock::new();
    static STRICT: OnceLock<Regex> = OnceLock::new();
    static LENIENT: OnceLock<Regex> = OnceLock::new();

    if let Some(r) = revealed.map(str::trim).filter(|r| validate(r).is_ok()) {
        return Some(r.to_string());
    }

    let tel = TEL.get_or_init(|| {
        Regex::new(
            r#"(?s)class="[^"]*reply-content-phone[^"]*"[^>]*>.*?<a[^>]*href="tel:[^"]*"[^>]*>\s*([^<]+?)\s*</a>"#,
        )
        .unwrap()
    });
    if let Some(text) = tel
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|t| validate(t).is_ok())
    {
        return Some(text.to_string());
    }

    let strict = STRICT.get_or_init(|| Regex::new(r"\(\d{3}\)\s\d{3}-\d{4}").unwrap());
    if let Some(m) = strict
        .find_iter(html)
        .map(|m| m.as_str())
        .find(|m| validate(m).is_ok())
    {
        return Some(m.to_string());
    }

    let lenient =
        LENIENT.get_or_init(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
    lenient
        .find_iter(html)
        .map(|m| m.as_str())
        .filter(|m| m.contains(['(', ')', '-', ' ', '.']))
        .find(|m| validate(m).is_ok())
        .map(str::to_string)
}
