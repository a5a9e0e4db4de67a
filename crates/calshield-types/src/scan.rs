/// Core scan data model: risk levels, actions, detections, and scan results.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Operational limits
// ============================================================

/// Maximum characters scanned per field; longer fields are truncated.
pub const MAX_FIELD_CHARS: usize = 50_000;
/// Maximum events accepted per batch scan; callers chunk larger batches.
pub const MAX_BATCH_EVENTS: usize = 100;
/// Maximum detections retained per field result.
pub const MAX_DETECTIONS_PER_FIELD: usize = 50;
/// Maximum recursion depth when decoding nested base64 payloads.
pub const MAX_BASE64_RECURSION: usize = 3;
/// Wall-clock budget for a single detection rule, in milliseconds.
pub const RULE_BUDGET_MS: u64 = 100;
/// Wall-clock budget for scanning a single event, in milliseconds.
pub const EVENT_BUDGET_MS: u64 = 5_000;

/// Rule id of the synthetic detection emitted when an event scan exceeds
/// its wall-clock budget.
pub const ENGINE_TIMEOUT_RULE_ID: &str = "ENGINE-TIMEOUT";

// ============================================================
// Risk levels and actions
// ============================================================

/// Overall risk classification of a field or event.
///
/// The ordering is load-bearing: quarantine filtering and threshold
/// mapping both rely on `Safe < Suspicious < Dangerous < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No detections, or score below the suspicious threshold.
    #[default]
    Safe,
    /// Worth flagging to the LLM, but content passes through unchanged.
    Suspicious,
    /// Dangerous content; matched ranges are redacted.
    Dangerous,
    /// Critical; the whole field is blocked and quarantined.
    Critical,
}

impl RiskLevel {
    /// The action corresponding to this risk level (identity mapping).
    pub fn action(self) -> SecurityAction {
        match self {
            RiskLevel::Safe => SecurityAction::Pass,
            RiskLevel::Suspicious => SecurityAction::Flag,
            RiskLevel::Dangerous => SecurityAction::Redact,
            RiskLevel::Critical => SecurityAction::Block,
        }
    }

    /// Parse a level from its lowercase name. Used by quarantine filters.
    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s.to_ascii_lowercase().as_str() {
            "safe" => Some(RiskLevel::Safe),
            "suspicious" => Some(RiskLevel::Suspicious),
            "dangerous" => Some(RiskLevel::Dangerous),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// Uppercase display name, used in annotation blocks.
    pub fn as_upper(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Suspicious => "SUSPICIOUS",
            RiskLevel::Dangerous => "DANGEROUS",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Suspicious => "suspicious",
            RiskLevel::Dangerous => "dangerous",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// What the engine does with a field or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    /// Content is clean; pass it through untouched.
    #[default]
    Pass,
    /// Content passes through, but the annotator warns the LLM.
    Flag,
    /// Matched ranges are rewritten to `[REDACTED:<rule_id>]`.
    Redact,
    /// The entire field is replaced with a block notice.
    Block,
}

impl std::fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityAction::Pass => "pass",
            SecurityAction::Flag => "flag",
            SecurityAction::Redact => "redact",
            SecurityAction::Block => "block",
        };
        write!(f, "{s}")
    }
}

// ============================================================
// Detections
// ============================================================

/// Which detector family produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionTier {
    /// Technical attack markers: invisible chars, encodings, markup.
    Structural,
    /// Semantic patterns: instruction overrides, shell syntax, role play.
    Contextual,
    /// Community fingerprint lookups.
    ThreatIntel,
    /// Synthetic detections produced by the engine itself (timeouts).
    Engine,
}

impl std::fmt::Display for DetectionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DetectionTier::Structural => "structural",
            DetectionTier::Contextual => "contextual",
            DetectionTier::ThreatIntel => "threat-intel",
            DetectionTier::Engine => "engine",
        };
        write!(f, "{s}")
    }
}

/// One finding emitted by one rule in one tier over one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Which detector family produced this.
    pub tier: DetectionTier,
    /// Stable short code, e.g. `STRUCT-003` or `CTX-001`.
    pub rule_id: String,
    /// Human-readable rule name.
    pub rule_name: String,
    /// Severity in `[0, 1]`, clamped at construction.
    pub severity: f64,
    /// Short sample of the matched content; may be synthetic
    /// ("12 zero-width characters").
    pub matched_content: String,
    /// Byte offset of the match in the scanned field; 0 for whole-field
    /// findings.
    pub match_offset: usize,
    /// Byte length of the match; 0 for whole-field findings.
    pub match_length: usize,
    /// Confidence in `[0, 1]`, clamped at construction.
    pub confidence: f64,
    /// Extra tags, e.g. decoded previews or matched verb/noun pairs.
    /// BTreeMap so serialized output is deterministic.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Detection {
    /// Create a detection, clamping severity and confidence into `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tier: DetectionTier,
        rule_id: &str,
        rule_name: &str,
        severity: f64,
        matched_content: impl Into<String>,
        match_offset: usize,
        match_length: usize,
        confidence: f64,
    ) -> Self {
        Self {
            tier,
            rule_id: rule_id.to_string(),
            rule_name: rule_name.to_string(),
            severity: severity.clamp(0.0, 1.0),
            matched_content: matched_content.into(),
            match_offset,
            match_length,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata tag.
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Scale severity by a contextual multiplier, clamping at 1.0.
    pub fn scale_severity(&mut self, factor: f64) {
        self.severity = (self.severity * factor).clamp(0.0, 1.0);
    }
}

/// Compact detection summary used by the audit log and quarantine entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSummary {
    pub rule_id: String,
    pub rule_name: String,
    pub tier: DetectionTier,
    pub severity: f64,
    pub field_name: String,
}

impl DetectionSummary {
    /// Summarize a detection for a given field.
    pub fn from_detection(d: &Detection, field_name: &str) -> Self {
        Self {
            rule_id: d.rule_id.clone(),
            rule_name: d.rule_name.clone(),
            tier: d.tier,
            severity: d.severity,
            field_name: field_name.to_string(),
        }
    }
}

// ============================================================
// Scan context
// ============================================================

/// What kind of event field is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    Title,
    Description,
    Location,
    AttendeeName,
    Attachment,
}

/// Per-field context passed to every tier.
#[derive(Debug, Clone)]
pub struct ScanContext {
    /// Field path, e.g. `description` or `attendees[2].displayName`.
    pub field_name: String,
    /// Field kind, used for contextual weighting.
    pub field_kind: FieldKind,
    /// Organizer email, if known.
    pub organizer_email: Option<String>,
    /// Domain part of the organizer email, lowercased.
    pub organizer_domain: Option<String>,
    /// True when the organizer's domain differs from the owner's.
    pub is_external_organizer: bool,
    /// The calendar owner's domain, if supplied.
    pub owner_domain: Option<String>,
}

impl ScanContext {
    /// Build a context with no organizer information (internal, untrusted
    /// weighting off). Mostly a test convenience.
    pub fn bare(field_name: &str, field_kind: FieldKind) -> Self {
        Self {
            field_name: field_name.to_string(),
            field_kind,
            organizer_email: None,
            organizer_domain: None,
            is_external_organizer: false,
            owner_domain: None,
        }
    }
}

// ============================================================
// Scan results
// ============================================================

/// Scan outcome for a single field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldScanResult {
    /// Field path, e.g. `description`.
    pub field_name: String,
    /// Character length of the original (pre-truncation) content.
    pub original_length: usize,
    /// Composite risk score in `[0, 1]`.
    pub risk_score: f64,
    /// Risk level derived from the score.
    pub risk_level: RiskLevel,
    /// Action derived from the level.
    pub action: SecurityAction,
    /// Detections that contributed to the score, capped at
    /// [`MAX_DETECTIONS_PER_FIELD`].
    pub detections: Vec<Detection>,
    /// Rewritten content, present when action is Redact or Block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_content: Option<String>,
}

/// Scan outcome for a whole event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScanResult {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_email: Option<String>,
    pub is_external_organizer: bool,
    /// Maximum of the per-field scores, or 0 with no scanned fields.
    pub overall_risk_score: f64,
    pub overall_risk_level: RiskLevel,
    pub overall_action: SecurityAction,
    /// Per-field results in field extraction order.
    pub field_results: Vec<FieldScanResult>,
    /// Wall-clock scan duration in milliseconds.
    pub scan_duration_ms: u64,
    /// When the scan ran.
    pub scanned_at: DateTime<Utc>,
}

impl EventScanResult {
    /// All detections across all fields, flattened into audit summaries.
    pub fn detection_summaries(&self) -> Vec<DetectionSummary> {
        self.field_results
            .iter()
            .flat_map(|f| {
                f.detections
                    .iter()
                    .map(|d| DetectionSummary::from_detection(d, &f.field_name))
            })
            .collect()
    }

    /// Total detection count across all fields.
    pub fn detection_count(&self) -> usize {
        self.field_results.iter().map(|f| f.detections.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Suspicious);
        assert!(RiskLevel::Suspicious < RiskLevel::Dangerous);
        assert!(RiskLevel::Dangerous < RiskLevel::Critical);
    }

    #[test]
    fn test_level_to_action_identity() {
        assert_eq!(RiskLevel::Safe.action(), SecurityAction::Pass);
        assert_eq!(RiskLevel::Suspicious.action(), SecurityAction::Flag);
        assert_eq!(RiskLevel::Dangerous.action(), SecurityAction::Redact);
        assert_eq!(RiskLevel::Critical.action(), SecurityAction::Block);
    }

    #[test]
    fn test_level_parse_roundtrip() {
        for level in [
            RiskLevel::Safe,
            RiskLevel::Suspicious,
            RiskLevel::Dangerous,
            RiskLevel::Critical,
        ] {
            assert_eq!(RiskLevel::parse(&level.to_string()), Some(level));
        }
        assert_eq!(RiskLevel::parse("DANGEROUS"), Some(RiskLevel::Dangerous));
        assert_eq!(RiskLevel::parse("bogus"), None);
    }

    #[test]
    fn test_detection_clamps_scores() {
        let d = Detection::new(
            DetectionTier::Structural,
            "STRUCT-001",
            "test",
            1.7,
            "x",
            0,
            0,
            -0.5,
        );
        assert_eq!(d.severity, 1.0);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_scale_severity_clamps() {
        let mut d = Detection::new(
            DetectionTier::Contextual,
            "CTX-001",
            "test",
            0.8,
            "x",
            0,
            0,
            0.9,
        );
        d.scale_severity(1.4);
        assert_eq!(d.severity, 1.0);
    }

    #[test]
    fn test_detection_serializes_camel_case() {
        let d = Detection::new(
            DetectionTier::ThreatIntel,
            "THREAT-001",
            "known threat",
            0.9,
            "fingerprint match",
            0,
            0,
            0.8,
        );
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"ruleId\":\"THREAT-001\""));
        assert!(json.contains("\"tier\":\"threat-intel\""));
        // Empty metadata is elided.
        assert!(!json.contains("metadata"));
    }
}
