/// Threat-intelligence data model: fingerprints, check results, and the
/// feed wire format.
///
/// Wire structs use camelCase names to match the cloud service's JSON.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Privacy-safe fingerprint of one text field.
///
/// Both hashes are lowercase 64-hex SHA-256 digests. Neither can be
/// reversed to the original text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFingerprint {
    /// Digest of the normalized text (lowercased, whitespace-collapsed).
    pub content_hash: String,
    /// Digest of the canonical feature shape of the text.
    pub structural_hash: String,
    /// Unique rule ids that fired on the text, for reporting.
    #[serde(default)]
    pub pattern_ids: Vec<String>,
    /// Overall risk score of the scan that produced this fingerprint.
    pub risk_score: f64,
    /// Organizer domain, when known. Never the full address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_domain: Option<String>,
}

/// Result of checking a fingerprint against the threat-intel store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatCheckResult {
    /// Whether the hash matches a known threat.
    pub known: bool,
    /// Confidence in `[0, 1]` that this is a real threat.
    pub confidence: f64,
    /// How many independent clients have reported this hash.
    pub report_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Threat category assigned by the service, e.g. `prompt-injection`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ThreatCheckResult {
    /// The negative result: hash not known.
    pub fn negative() -> Self {
        Self {
            known: false,
            confidence: 0.0,
            report_count: 0,
            first_seen: None,
            last_seen: None,
            category: None,
        }
    }
}

/// Which of the two digests a feed entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Content,
    Structural,
}

/// One entry in the threat feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub hash: String,
    pub hash_type: HashType,
    pub confidence: f64,
    pub report_count: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Response body of `GET {api}/feed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFeed {
    pub entries: Vec<FeedEntry>,
    pub count: usize,
    pub synced_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_wire_names() {
        let json = r#"{"known": true, "confidence": 0.85, "reportCount": 7,
                       "category": "prompt-injection"}"#;
        let result: ThreatCheckResult = serde_json::from_str(json).unwrap();
        assert!(result.known);
        assert_eq!(result.report_count, 7);
        assert_eq!(result.category.as_deref(), Some("prompt-injection"));
        assert!(result.first_seen.is_none());
    }

    #[test]
    fn test_feed_entry_hash_type() {
        let json = r#"{"hash": "ab", "hashType": "structural", "confidence": 0.7,
                       "reportCount": 3, "updatedAt": "2026-01-15T10:00:00Z"}"#;
        let entry: FeedEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.hash_type, HashType::Structural);
    }

    #[test]
    fn test_negative_result() {
        let neg = ThreatCheckResult::negative();
        assert!(!neg.known);
        assert_eq!(neg.confidence, 0.0);
        assert_eq!(neg.report_count, 0);
    }
}
