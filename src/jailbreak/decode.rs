//! Decode transforms for obfuscated payloads
//!
//! Each transform yields at most a handful of candidate strings. Only
//! candidates that differ from the input and are mostly printable text are
//! returned, so random base64-looking identifiers do not produce noise.

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Minimum share of printable characters for a decoded candidate
const PRINTABLE_RATIO: f64 = 0.9;
/// Upper bound on base64 candidates taken from one text
const MAX_BASE64_CANDIDATES: usize = 8;

/// A decode transform applied to suspicious text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Base64,
    Rot13,
    UrlDecode,
}

impl std::fmt::Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transform::Base64 => write!(f, "base64"),
            Transform::Rot13 => write!(f, "rot13"),
            Transform::UrlDecode => write!(f, "url_decode"),
        }
    }
}

/// A successfully decoded variant of the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedVariant {
    pub transform: Transform,
    pub text: String,
}

fn base64_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9+/_-]{16,}={0,2}").unwrap())
}

fn percent_escape_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%[0-9A-Fa-f]{2}").unwrap())
}

/// Mostly printable, non-empty text
pub fn is_printable(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .count();
    printable as f64 / total as f64 >= PRINTABLE_RATIO
}

/// Decode base64 runs embedded in `text`
pub fn decode_base64(text: &str) -> Vec<String> {
    base64_token_regex()
        .find_iter(text)
        .take(MAX_BASE64_CANDIDATES)
        .filter_map(|m| {
            let token = m.as_str();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(token)
                .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(token))
                .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(token))
                .ok()?;
            let decoded = String::from_utf8(bytes).ok()?;
            is_printable(&decoded).then_some(decoded)
        })
        .collect()
}

/// Rotate ASCII letters by 13
pub fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
            _ => c,
        })
        .collect()
}

/// Percent-decode `text` when it contains escapes
pub fn url_decode(text: &str) -> Option<String> {
    if !percent_escape_regex().is_match(text) {
        return None;
    }
    let decoded = urlencoding::decode(text).ok()?.into_owned();
    (decoded != text && is_printable(&decoded)).then_some(decoded)
}

/// Every decoded, printable variant of `text` that differs from it
pub fn decode_variants(text: &str) -> Vec<DecodedVariant> {
    let mut variants: Vec<DecodedVariant> = decode_base64(text)
        .into_iter()
        .map(|text| DecodedVariant {
            transform: Transform::Base64,
            text,
        })
        .collect();

    let rotated = rot13(text);
    if rotated != text {
        variants.push(DecodedVariant {
            transform: Transform::Rot13,
            text: rotated,
        });
    }

    if let Some(decoded) = url_decode(text) {
        variants.push(DecodedVariant {
            transform: Transform::UrlDecode,
            text: decoded,
        });
    }

    variants
}
