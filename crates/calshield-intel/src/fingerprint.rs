//! Privacy-safe text fingerprinting.
//!
//! Two independent SHA-256 digests per text:
//!
//! - the *content hash* covers the normalized text (lowercased,
//!   whitespace-collapsed, trimmed), so trivially restyled copies of the
//!   same payload collide;
//! - the *structural hash* covers a canonical feature string describing
//!   the text's shape (length bucket, encoding markers, tag set), so
//!   reworded variants of the same attack template collide.
//!
//! Neither digest can be reversed to the original text.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use calshield_types::intel::ThreatFingerprint;

const ZERO_WIDTH_CHARS: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{2060}', '\u{180E}',
];

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([a-zA-Z][a-zA-Z0-9]*)").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://").unwrap())
}

fn pct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%[0-9A-Fa-f]{2}").unwrap())
}

fn event_handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bon[a-z]+\s*=").unwrap())
}

fn data_b64_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)data:[a-z0-9.+/-]+;base64").unwrap())
}

/// SHA-256 over the normalized text, as 64 lowercase hex chars.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize(text);
    hex_digest(normalized.as_bytes())
}

/// SHA-256 over the canonical feature string, as 64 lowercase hex chars.
pub fn structural_hash(text: &str) -> String {
    hex_digest(canonical_features(text).as_bytes())
}

/// Build a full fingerprint for a scanned text.
pub fn fingerprint(
    text: &str,
    pattern_ids: Vec<String>,
    risk_score: f64,
    organizer_domain: Option<String>,
) -> ThreatFingerprint {
    ThreatFingerprint {
        content_hash: content_hash(text),
        structural_hash: structural_hash(text),
        pattern_ids,
        risk_score,
        organizer_domain,
    }
}

/// Lowercase, collapse all whitespace runs to single spaces, trim.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The key-sorted `key:value|key:value|…` feature string.
///
/// Keys (sorted): `b64`, `encoding`, `html`, `len`, `lines`, `scripts`,
/// `urls`, `zwc`.
fn canonical_features(text: &str) -> String {
    let b64 = count_base64_runs(text, 32);
    let encoding = pct_re().find_iter(text).count();
    let html = html_tag_set(text);
    let len = length_bucket(text.chars().count());
    let lines = text.lines().count();
    let scripts = script_marker_bits(text);
    let urls = url_re().find_iter(text).count();
    let zwc = text
        .chars()
        .filter(|c| ZERO_WIDTH_CHARS.contains(c))
        .count();

    format!(
        "b64:{b64}|encoding:{encoding}|html:{html}|len:{len}|lines:{lines}|scripts:{scripts}|urls:{urls}|zwc:{zwc}"
    )
}

fn length_bucket(chars: usize) -> &'static str {
    match chars {
        0..=99 => "0-100",
        100..=499 => "100-500",
        500..=1999 => "500-2000",
        2000..=9999 => "2000-10000",
        _ => "10000+",
    }
}

fn count_base64_runs(text: &str, min_len: usize) -> usize {
    let mut runs = 0;
    let mut current = 0;
    for b in text.bytes() {
        if b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=' {
            current += 1;
        } else {
            if current >= min_len {
                runs += 1;
            }
            current = 0;
        }
    }
    if current >= min_len {
        runs += 1;
    }
    runs
}

/// Comma-joined sorted lowercase set of HTML tag names, or `none`.
fn html_tag_set(text: &str) -> String {
    let tags: BTreeSet<String> = html_tag_re()
        .captures_iter(text)
        .map(|c| c[1].to_lowercase())
        .collect();
    if tags.is_empty() {
        "none".to_string()
    } else {
        tags.into_iter().collect::<Vec<_>>().join(",")
    }
}

/// Count (0..=5) of script markers present in the text.
fn script_marker_bits(text: &str) -> usize {
    let lower = text.to_lowercase();
    let mut bits = 0;
    if lower.contains("javascript:") {
        bits += 1;
    }
    if lower.contains("vbscript:") {
        bits += 1;
    }
    if data_b64_re().is_match(text) {
        bits += 1;
    }
    if lower.contains("<script") {
        bits += 1;
    }
    if event_handler_re().is_match(text) {
        bits += 1;
    }
    bits
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
