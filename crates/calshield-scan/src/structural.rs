//! Structural detection tier.
//!
//! Scans one text field for technical attack markers: invisible characters,
//! encoded payloads, dangerous HTML, obfuscated URI schemes, homoglyph
//! words, layered encodings, and CSS hiding. Pure and synchronous; all
//! regexes are compiled once at construction.
//!
//! Severities here are base values; contextual weighting (external
//! organizer, field kind) is applied by the contextual tier only.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use regex::Regex;
use tracing::{debug, warn};

use calshield_types::scan::{
    Detection, DetectionTier, ScanContext, MAX_DETECTIONS_PER_FIELD, MAX_FIELD_CHARS,
};
use calshield_types::traits::ScanTier;

use crate::budget::RuleBudget;

/// Zero-width characters that can hide payloads from human reviewers.
const ZERO_WIDTH_CHARS: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{2060}', '\u{180E}',
];

/// Minimum contiguous base64-alphabet run worth decoding.
const MIN_BASE64_RUN: usize = 32;

/// Snippet length for matched-content previews.
const PREVIEW_LEN: usize = 60;

/// Structural tier: rules STRUCT-001 through STRUCT-009.
pub struct StructuralTier {
    html_tag_re: Regex,
    event_handler_re: Regex,
    markdown_link_re: Regex,
    pipe_to_shell_re: Regex,
    dotted_quad_re: Regex,
    double_encoding_re: Regex,
    html_entity_re: Regex,
    data_uri_re: Regex,
    decoded_indicator_re: Regex,
    css_hiding_res: Vec<Regex>,
    white_fg_re: Regex,
    white_bg_re: Regex,
}

impl Default for StructuralTier {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuralTier {
    /// Compile all rule patterns.
    pub fn new() -> Self {
        Self {
            html_tag_re: Regex::new(
                r"(?i)<\s*(script|iframe|object|embed|form|input|svg|link|meta|base)\b",
            )
            .unwrap(),
            event_handler_re: Regex::new(r#"(?i)\bon[a-z]+\s*=\s*["']"#).unwrap(),
            markdown_link_re: Regex::new(r"\[[^\]\n]*\]\(([^)\s]+)\)").unwrap(),
            pipe_to_shell_re: Regex::new(r"(?i)\|\s*(sh|bash)\b").unwrap(),
            dotted_quad_re: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(),
            double_encoding_re: Regex::new(r"%25[0-9A-Fa-f]{2}").unwrap(),
            html_entity_re: Regex::new(r"&#?[A-Za-z0-9]{1,16};").unwrap(),
            data_uri_re: Regex::new(r"(?i)data:[a-z0-9.+/-]+;base64,").unwrap(),
            decoded_indicator_re: Regex::new(
                r"(?i)\b(bash|curl|wget|chmod|python|node|exec|eval|powershell)\b|\brm\s|\bsh\b|ignore|override|system|instruction|prompt|<script|\|\s*(bash|sh)\b",
            )
            .unwrap(),
            css_hiding_res: vec![
                Regex::new(r"(?i)display\s*:\s*none").unwrap(),
                Regex::new(r#"(?i)font-size\s*:\s*0(px|pt|em|rem|%)?\s*(;|"|'|\}|$)"#).unwrap(),
                Regex::new(r#"(?i)opacity\s*:\s*0(\.0+)?\s*(;|"|'|\}|$)"#).unwrap(),
                Regex::new(r"(?i)visibility\s*:\s*hidden").unwrap(),
                Regex::new(r#"(?i)height\s*:\s*0(px|pt|em|rem|%)?\s*(;|"|'|\}|$)"#).unwrap(),
                Regex::new(r"(?i)overflow\s*:\s*hidden").unwrap(),
            ],
            white_fg_re: Regex::new(r"(?i)(?:^|[^-])color\s*:\s*(#fff(?:fff)?\b|white\b)").unwrap(),
            white_bg_re: Regex::new(r"(?i)background(?:-color)?\s*:\s*(#fff(?:fff)?\b|white\b)")
                .unwrap(),
        }
    }

    /// Run one rule under its wall-clock budget, tagging its detections
    /// when the budget was exceeded.
    fn run_rule<F>(&self, rule_id: &str, out: &mut Vec<Detection>, rule: F)
    where
        F: FnOnce(&RuleBudget, &mut Vec<Detection>),
    {
        let budget = RuleBudget::start();
        let before = out.len();
        rule(&budget, out);
        if budget.expired() {
            warn!(rule = rule_id, "structural rule exceeded its wall budget");
            for detection in out[before..].iter_mut() {
                detection
                    .metadata
                    .insert("budgetExceeded".to_string(), "true".to_string());
            }
        }
    }

    // ── STRUCT-001: zero-width characters ─────────────────────

    fn rule_zero_width(&self, text: &str, out: &mut Vec<Detection>) {
        let count = text.chars().filter(|c| ZERO_WIDTH_CHARS.contains(c)).count();
        if count == 0 {
            return;
        }
        let severity = if count >= 5 { 0.80 } else { 0.70 };
        out.push(
            Detection::new(
                DetectionTier::Structural,
                "STRUCT-001",
                "Zero-width characters",
                severity,
                format!("{count} zero-width characters"),
                0,
                0,
                0.95,
            )
            .with_meta("count", count.to_string()),
        );
    }

    // ── STRUCT-002: suspicious base64 payloads ────────────────

    fn rule_encoded_payload(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for (start, run) in base64_runs(text, MIN_BASE64_RUN) {
            if budget.expired() {
                return;
            }
            let Some(decoded) = decode_base64_lossy(run) else {
                continue;
            };
            if self.decoded_indicator_re.is_match(&decoded) {
                let preview = truncate_chars(&decoded, PREVIEW_LEN);
                out.push(
                    Detection::new(
                        DetectionTier::Structural,
                        "STRUCT-002",
                        "Encoded payload",
                        0.80,
                        truncate_chars(run, PREVIEW_LEN),
                        start,
                        run.len(),
                        0.85,
                    )
                    .with_meta("decodedPreview", preview),
                );
            }
        }
    }

    // ── STRUCT-003: dangerous HTML ────────────────────────────

    fn rule_dangerous_html(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for m in self.html_tag_re.find_iter(text) {
            if budget.expired() {
                return;
            }
            out.push(Detection::new(
                DetectionTier::Structural,
                "STRUCT-003",
                "Dangerous HTML tag",
                0.90,
                m.as_str().to_string(),
                m.start(),
                m.len(),
                0.90,
            ));
        }
        for m in self.event_handler_re.find_iter(text) {
            if budget.expired() {
                return;
            }
            out.push(Detection::new(
                DetectionTier::Structural,
                "STRUCT-003",
                "Inline event handler",
                0.85,
                m.as_str().to_string(),
                m.start(),
                m.len(),
                0.90,
            ));
        }
    }

    // ── STRUCT-004: obfuscated script URI schemes ─────────────

    fn rule_script_scheme(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for scheme in ["javascript:", "vbscript:"] {
            for (start, end) in obfuscated_scheme_matches(text, scheme) {
                if budget.expired() {
                    return;
                }
                out.push(Detection::new(
                    DetectionTier::Structural,
                    "STRUCT-004",
                    "Script URI scheme",
                    0.95,
                    truncate_chars(&text[start..end], PREVIEW_LEN),
                    start,
                    end - start,
                    0.95,
                ));
            }
        }
    }

    // ── STRUCT-005: suspicious markdown links ─────────────────

    fn rule_markdown_link(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for caps in self.markdown_link_re.captures_iter(text) {
            if budget.expired() {
                return;
            }
            let whole = caps.get(0).unwrap();
            let url = caps.get(1).unwrap().as_str();
            let url_lower = url.to_lowercase();

            let severity = if url_lower.contains("javascript:") || url_lower.contains("data:") {
                Some(0.85)
            } else if self.pipe_to_shell_re.is_match(url)
                || url.contains([';', '&', '|', '`', '$'])
                || self.dotted_quad_re.is_match(url)
            {
                Some(0.60)
            } else {
                None
            };

            if let Some(severity) = severity {
                out.push(
                    Detection::new(
                        DetectionTier::Structural,
                        "STRUCT-005",
                        "Suspicious markdown link",
                        severity,
                        truncate_chars(whole.as_str(), PREVIEW_LEN),
                        whole.start(),
                        whole.len(),
                        0.80,
                    )
                    .with_meta("url", truncate_chars(url, PREVIEW_LEN)),
                );
            }
        }
    }

    // ── STRUCT-006: mixed-script homoglyph words ──────────────

    fn rule_mixed_script(&self, text: &str, out: &mut Vec<Detection>) {
        let has_latin = text.chars().any(is_latin);
        let has_confusable = text.chars().any(is_confusable_script);
        if !(has_latin && has_confusable) {
            return;
        }

        let mixed_words = text
            .split_whitespace()
            .filter(|w| w.chars().any(is_latin) && w.chars().any(is_confusable_script))
            .count();
        if mixed_words == 0 {
            return;
        }

        let severity = if mixed_words >= 5 {
            0.85
        } else if mixed_words >= 3 {
            0.75
        } else {
            0.50
        };
        out.push(
            Detection::new(
                DetectionTier::Structural,
                "STRUCT-006",
                "Mixed-script homoglyphs",
                severity,
                format!("{mixed_words} mixed-script words"),
                0,
                0,
                0.85,
            )
            .with_meta("count", mixed_words.to_string()),
        );
    }

    // ── STRUCT-007: layered encoding ──────────────────────────

    fn rule_layered_encoding(&self, text: &str, out: &mut Vec<Detection>) {
        let double_encoded = self.double_encoding_re.find_iter(text).count();
        if double_encoded >= 3 {
            out.push(
                Detection::new(
                    DetectionTier::Structural,
                    "STRUCT-007",
                    "Double URL-encoding",
                    0.80,
                    format!("{double_encoded} double-encoded sequences"),
                    0,
                    0,
                    0.75,
                )
                .with_meta("count", double_encoded.to_string()),
            );
        }

        let entities = self.html_entity_re.find_iter(text).count();
        if entities >= 10 {
            out.push(
                Detection::new(
                    DetectionTier::Structural,
                    "STRUCT-007",
                    "HTML entity flood",
                    0.80,
                    format!("{entities} HTML entities"),
                    0,
                    0,
                    0.75,
                )
                .with_meta("count", entities.to_string()),
            );
        }
    }

    // ── STRUCT-008: base64 data URIs ──────────────────────────

    fn rule_data_uri(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for m in self.data_uri_re.find_iter(text) {
            if budget.expired() {
                return;
            }
            out.push(Detection::new(
                DetectionTier::Structural,
                "STRUCT-008",
                "Base64 data URI",
                0.85,
                m.as_str().to_string(),
                m.start(),
                m.len(),
                0.90,
            ));
        }
    }

    // ── STRUCT-009: CSS hiding ────────────────────────────────

    fn rule_css_hiding(&self, text: &str, budget: &RuleBudget, out: &mut Vec<Detection>) {
        for re in &self.css_hiding_res {
            if budget.expired() {
                return;
            }
            if let Some(m) = re.find(text) {
                out.push(Detection::new(
                    DetectionTier::Structural,
                    "STRUCT-009",
                    "CSS-hidden content",
                    0.75,
                    m.as_str().to_string(),
                    m.start(),
                    m.len(),
                    0.80,
                ));
            }
        }
        // White-on-white needs both declarations present.
        if let (Some(fg), Some(_)) = (self.white_fg_re.find(text), self.white_bg_re.find(text)) {
            out.push(Detection::new(
                DetectionTier::Structural,
                "STRUCT-009",
                "CSS-hidden content",
                0.75,
                "white-on-white text",
                fg.start(),
                fg.len(),
                0.80,
            ));
        }
    }
}

#[async_trait]
impl ScanTier for StructuralTier {
    fn name(&self) -> &'static str {
        "structural"
    }

    async fn analyze(&self, text: &str, ctx: &ScanContext) -> Vec<Detection> {
        let text = truncate_chars_ref(text, MAX_FIELD_CHARS);
        let mut detections = Vec::new();

        self.run_rule("STRUCT-001", &mut detections, |_, out| {
            self.rule_zero_width(text, out)
        });
        self.run_rule("STRUCT-002", &mut detections, |budget, out| {
            self.rule_encoded_payload(text, budget, out)
        });
        self.run_rule("STRUCT-003", &mut detections, |budget, out| {
            self.rule_dangerous_html(text, budget, out)
        });
        self.run_rule("STRUCT-004", &mut detections, |budget, out| {
            self.rule_script_scheme(text, budget, out)
        });
        self.run_rule("STRUCT-005", &mut detections, |budget, out| {
            self.rule_markdown_link(text, budget, out)
        });
        self.run_rule("STRUCT-006", &mut detections, |_, out| {
            self.rule_mixed_script(text, out)
        });
        self.run_rule("STRUCT-007", &mut detections, |_, out| {
            self.rule_layered_encoding(text, out)
        });
        self.run_rule("STRUCT-008", &mut detections, |budget, out| {
            self.rule_data_uri(text, budget, out)
        });
        self.run_rule("STRUCT-009", &mut detections, |budget, out| {
            self.rule_css_hiding(text, budget, out)
        });

        detections.sort_by(|a, b| {
            a.rule_id
                .cmp(&b.rule_id)
                .then(a.match_offset.cmp(&b.match_offset))
        });
        detections.truncate(MAX_DETECTIONS_PER_FIELD);

        if !detections.is_empty() {
            debug!(
                field = %ctx.field_name,
                count = detections.len(),
                "structural tier found markers"
            );
        }
        detections
    }
}

// ============================================================
// Helper scans
// ============================================================

fn is_latin(c: char) -> bool {
    c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&c)
}

fn is_confusable_script(c: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&c) || ('\u{0370}'..='\u{03FF}').contains(&c)
}

fn is_base64_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'+' || c == b'/' || c == b'='
}

/// Contiguous base64-alphabet runs of at least `min_len` bytes.
fn base64_runs(text: &str, min_len: usize) -> Vec<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if is_base64_char(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_base64_char(bytes[i]) {
                i += 1;
            }
            if i - start >= min_len {
                runs.push((start, &text[start..i]));
            }
        } else {
            i += 1;
        }
    }
    runs
}

/// Best-effort base64 decode to lossy UTF-8; `None` when the run does not
/// decode at all.
fn decode_base64_lossy(run: &str) -> Option<String> {
    let trimmed = run.trim_end_matches('=');
    // A length of 4k+1 can never be valid; drop the trailing byte.
    let usable = if trimmed.len() % 4 == 1 {
        &trimmed[..trimmed.len() - 1]
    } else {
        trimmed
    };
    STANDARD_NO_PAD
        .decode(usable)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Find occurrences of `scheme` (e.g. `javascript:`) where the letters may
/// be separated by whitespace. Returns byte ranges. Linear scan, no regex.
fn obfuscated_scheme_matches(text: &str, scheme: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let target: Vec<char> = scheme.chars().collect();
    let mut matches = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if let Some(end) = match_scheme_at(&chars, i, &target, text.len()) {
            matches.push((chars[i].0, end));
            // Resume after the match to avoid overlapping hits.
            while i < chars.len() && chars[i].0 < end {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    matches
}

fn match_scheme_at(
    chars: &[(usize, char)],
    start: usize,
    target: &[char],
    text_len: usize,
) -> Option<usize> {
    let mut pos = start;
    for (ti, &t) in target.iter().enumerate() {
        // Whitespace is only tolerated between letters, not before the first.
        if ti > 0 {
            while pos < chars.len() && chars[pos].1.is_whitespace() {
                pos += 1;
            }
        }
        if pos >= chars.len() || chars[pos].1.to_lowercase().next() != Some(t) {
            return None;
        }
        pos += 1;
    }
    Some(chars.get(pos).map_or(text_len, |&(b, _)| b))
}

/// Truncate to at most `max_chars` characters, on a char boundary.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    truncate_chars_ref(s, max_chars).to_string()
}

fn truncate_chars_ref(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
