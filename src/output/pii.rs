//! PII detectors
//!
//! Matches are returned non-overlapping and in text order. Where detectors
//! overlap the more specific one wins (email, card, SSN, phone, IP).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    CardNumber,
    Ssn,
    Phone,
    IpAddress,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Email => "pii_email",
            PiiKind::CardNumber => "pii_card_number",
            PiiKind::Ssn => "pii_ssn",
            PiiKind::Phone => "pii_phone",
            PiiKind::IpAddress => "pii_ip_address",
        }
    }

    fn base_confidence(&self) -> f64 {
        match self {
            PiiKind::CardNumber => 0.95,
            PiiKind::Email | PiiKind::Ssn => 0.9,
            PiiKind::Phone => 0.7,
            PiiKind::IpAddress => 0.6,
        }
    }

    pub fn replacement(&self) -> &'static str {
        match self {
            PiiKind::Email => "[EMAIL REDACTED]",
            PiiKind::CardNumber => "[CARD REDACTED]",
            PiiKind::Ssn => "[SSN REDACTED]",
            PiiKind::Phone => "[PHONE REDACTED]",
            PiiKind::IpAddress => "[IP REDACTED]",
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PiiMatch {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap())
}

fn card_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").unwrap())
}

fn ssn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap())
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{3}\)|\b\d{3})[ .-]?\d{3}[ .-]\d{4}\b").unwrap()
    })
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b").unwrap()
    })
}

/// Luhn checksum over the ASCII digits of `s`
pub fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 2 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Printed like a payment card: 4-4-4-4 or 4-6-5 groups with one
/// separator, and a major issuer prefix
///
/// Accepted without a valid checksum, at lower confidence. Mistyped and
/// sample card numbers are still card-shaped data and are redacted;
/// plain digit runs are not, since they need the checksum.
fn is_grouped_card(s: &str) -> bool {
    let mut separators = s.chars().filter(|c| !c.is_ascii_digit());
    let Some(sep) = separators.next() else {
        return false;
    };
    if separators.any(|c| c != sep) {
        return false;
    }
    let groups: Vec<usize> = s.split(sep).map(str::len).collect();
    if groups != [4, 4, 4, 4] && groups != [4, 6, 5] {
        return false;
    }
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    ["4", "51", "52", "53", "54", "55", "22", "23", "24", "25", "26", "27", "34", "37", "6011", "65"]
        .iter()
        .any(|p| digits.starts_with(p))
}

fn card_confidence(candidate: &str) -> Option<f64> {
    if luhn_valid(candidate) {
        Some(PiiKind::CardNumber.base_confidence())
    } else if is_grouped_card(candidate) {
        Some(0.6)
    } else {
        None
    }
}

/// Card spans inside one digit-run match, as `(start, end, confidence)`
/// relative to `candidate`
///
/// The run can swallow neighbouring digits ("4111 1111 1111 1111 123"), so
/// when the whole run is rejected the longest accepted span of whole digit
/// groups is taken, leftmost first, and the scan resumes after it.
fn card_spans(candidate: &str) -> Vec<(usize, usize, f64)> {
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut run_start = None;
    for (i, c) in candidate.char_indices() {
        match (c.is_ascii_digit(), run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                groups.push((start, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        groups.push((start, candidate.len()));
    }

    let mut spans = Vec::new();
    let mut i = 0;
    while i < groups.len() {
        let found = (i..groups.len()).rev().find_map(|j| {
            let digits: usize = groups[i..=j].iter().map(|(s, e)| e - s).sum();
            if !(13..=19).contains(&digits) {
                return None;
            }
            let (start, end) = (groups[i].0, groups[j].1);
            card_confidence(&candidate[start..end]).map(|c| (j, start, end, c))
        });
        match found {
            Some((j, start, end, confidence)) => {
                spans.push((start, end, confidence));
                i = j + 1;
            }
            None => i += 1,
        }
    }
    spans
}

/// Every PII match in `text`
pub fn scan(text: &str) -> Vec<PiiMatch> {
    // Priority order
    let detectors: [(&Regex, PiiKind); 5] = [
        (email_regex(), PiiKind::Email),
        (card_regex(), PiiKind::CardNumber),
        (ssn_regex(), PiiKind::Ssn),
        (phone_regex(), PiiKind::Phone),
        (ipv4_regex(), PiiKind::IpAddress),
    ];

    let mut candidates: Vec<PiiMatch> = Vec::new();
    for (re, kind) in detectors {
        for m in re.find_iter(text) {
            if kind == PiiKind::CardNumber {
                candidates.extend(card_spans(m.as_str()).into_iter().map(|(start, end, confidence)| {
                    PiiMatch {
                        kind,
                        start: m.start() + start,
                        end: m.start() + end,
                        confidence,
                    }
                }));
            } else {
                candidates.push(PiiMatch {
                    kind,
                    start: m.start(),
                    end: m.end(),
                    confidence: kind.base_confidence(),
                });
            }
        }
    }

    let mut accepted: Vec<PiiMatch> = Vec::new();
    for candidate in candidates {
        let overlaps = accepted
            .iter()
            .any(|a| candidate.start < a.end && a.start < candidate.end);
        if !overlaps {
            accepted.push(candidate);
        }
    }
    accepted.sort_by_key(|m| m.start);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<PiiKind> {
        scan(text).into_iter().map(|m| m.kind).collect()
    }

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4111 1111 1111 1111"));
        assert!(luhn_valid("4532015112830366"));
        assert!(!luhn_valid("1234567812345678"));
        assert!(!luhn_valid("4532 1234 5678 9012"));
    }

    #[test]
    fn test_card_detection() {
        let matches = scan("card: 4111-1111-1111-1111, thanks");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, PiiKind::CardNumber);
        assert!(matches[0].confidence > 0.9);
    }

    #[test]
    fn test_grouped_card_without_checksum() {
        let matches = scan("pay with 4532 1234 5678 9012 today");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, PiiKind::CardNumber);
        assert!(matches[0].confidence >= 0.5);
    }

    #[test]
    fn test_card_followed_by_more_digits() {
        let text = "card 4111 1111 1111 1111 123 on file";
        let matches = scan(text);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, PiiKind::CardNumber);
        assert_eq!(&text[matches[0].start..matches[0].end], "4111 1111 1111 1111");
        assert!(matches[0].confidence > 0.9);
    }

    #[test]
    fn test_card_preceded_by_more_digits() {
        let text = "ref 12 4111-1111-1111-1111";
        let matches = scan(text);
        assert_eq!(matches.len(), 1);
        assert_eq!(&text[matches[0].start..matches[0].end], "4111-1111-1111-1111");
    }

    #[test]
    fn test_ungrouped_digits_without_checksum_ignored() {
        assert!(scan("order 1234567812345678").is_empty());
    }

    #[test]
    fn test_email_ssn_phone_ip() {
        assert_eq!(kinds("mail bob@example.com"), vec![PiiKind::Email]);
        assert_eq!(kinds("ssn 123-45-6789"), vec![PiiKind::Ssn]);
        assert_eq!(kinds("call (555) 123-4567"), vec![PiiKind::Phone]);
        assert_eq!(kinds("call +1 555-123-4567"), vec![PiiKind::Phone]);
        assert_eq!(kinds("host 192.168.0.12 down"), vec![PiiKind::IpAddress]);
        assert!(kinds("version 300.1.2.3").is_empty());
    }

    #[test]
    fn test_matches_ordered_and_disjoint() {
        let matches = scan("a@b.io then 10.0.0.1 then 123-45-6789");
        assert_eq!(
            matches.iter().map(|m| m.kind).collect::<Vec<_>>(),
            vec![PiiKind::Email, PiiKind::IpAddress, PiiKind::Ssn]
        );
        assert!(matches.windows(2).all(|w| w[0].end <= w[1].start));
    }

    #[test]
    fn test_placeholders_do_not_match() {
        for kind in [
            PiiKind::Email,
            PiiKind::CardNumber,
            PiiKind::Ssn,
            PiiKind::Phone,
            PiiKind::IpAddress,
        ] {
            assert!(scan(kind.replacement()).is_empty());
        }
    }
}
