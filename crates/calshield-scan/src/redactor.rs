//! Redactor: rewrites a field's text based on its scan outcome.
//!
//! Pass and Flag leave content untouched. Redact splices
//! `[REDACTED:<rule_id>]` over every ranged detection, working from the
//! highest offset down so earlier splices do not shift later indices.
//! Block replaces the whole field with a notice pointing at the
//! quarantine viewer.

use calshield_types::scan::{Detection, SecurityAction};

/// Rewrite `text` according to the chosen action and the detections that
/// drove it. Returns `None` for Pass/Flag (content unchanged).
pub fn redact_field(text: &str, action: SecurityAction, detections: &[Detection]) -> Option<String> {
    match action {
        SecurityAction::Pass | SecurityAction::Flag => None,
        SecurityAction::Block => Some(block_notice(detections.len())),
        SecurityAction::Redact => Some(splice_redactions(text, detections)),
    }
}

/// The whole-field replacement used for blocked content.
fn block_notice(detection_count: usize) -> String {
    let plural = if detection_count == 1 { "" } else { "s" };
    format!(
        "[CONTENT BLOCKED: {detection_count} security detection{plural}. \
         The original content is preserved in quarantine and can be \
         inspected with the quarantine viewer.]"
    )
}

/// Splice `[REDACTED:<rule_id>]` over every ranged detection.
///
/// Whole-field detections (length 0) already influenced the score; they
/// leave the text intact. Overlapping ranges collapse into the first
/// (highest-offset) splice.
fn splice_redactions(text: &str, detections: &[Detection]) -> String {
    let mut ranged: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.match_length > 0 && d.match_offset + d.match_length <= text.len())
        .collect();
    ranged.sort_by(|a, b| b.match_offset.cmp(&a.match_offset));

    let mut result = text.to_string();
    // Everything at or past this byte has already been rewritten.
    let mut rewritten_from = text.len() + 1;
    for detection in ranged {
        let start = detection.match_offset;
        let end = start + detection.match_length;
        if end > rewritten_from {
            continue;
        }
        if !result.is_char_boundary(start) || !result.is_char_boundary(end) {
            continue;
        }
        result.replace_range(start..end, &format!("[REDACTED:{}]", detection.rule_id));
        rewritten_from = start;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use calshield_types::scan::DetectionTier;

    fn ranged(rule_id: &str, offset: usize, length: usize) -> Detection {
        Detection::new(
            DetectionTier::Structural,
            rule_id,
            "test",
            0.9,
            "x",
            offset,
            length,
            0.9,
        )
    }

    fn whole_field(rule_id: &str) -> Detection {
        Detection::new(DetectionTier::Structural, rule_id, "test", 0.9, "x", 0, 0, 0.9)
    }

    #[test]
    fn test_pass_and_flag_unchanged() {
        let d = [ranged("STRUCT-003", 0, 8)];
        assert!(redact_field("<script>", SecurityAction::Pass, &d).is_none());
        assert!(redact_field("<script>", SecurityAction::Flag, &d).is_none());
    }

    #[test]
    fn test_block_notice_names_count() {
        let d = [ranged("STRUCT-003", 0, 8), whole_field("STRUCT-001")];
        let notice = redact_field("<script>", SecurityAction::Block, &d).unwrap();
        assert!(notice.contains("2 security detections"));
        assert!(notice.contains("quarantine viewer"));
        assert!(!notice.contains("<script>"));
    }

    #[test]
    fn test_block_notice_singular() {
        let notice = block_notice(1);
        assert!(notice.contains("1 security detection."));
    }

    #[test]
    fn test_redact_single_range() {
        let text = "Normal text <script>alert(1)</script>";
        let d = [ranged("STRUCT-003", 12, 7)];
        let out = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(out, "Normal text [REDACTED:STRUCT-003]>alert(1)</script>");
        assert!(!out.contains("<script"));
    }

    #[test]
    fn test_redact_multiple_ranges_descending() {
        let text = "aaa BAD bbb WORSE ccc";
        let d = [ranged("CTX-001", 4, 3), ranged("CTX-003", 12, 5)];
        let out = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(out, "aaa [REDACTED:CTX-001] bbb [REDACTED:CTX-003] ccc");
    }

    #[test]
    fn test_whole_field_detection_leaves_text() {
        let text = "Meeting\u{200B} with team";
        let d = [whole_field("STRUCT-001")];
        let out = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn test_overlapping_ranges_collapse() {
        let text = "0123456789";
        // [2,8) and [4,6) overlap; the higher-offset range is spliced
        // first and the overlapping lower one is dropped.
        let d = [ranged("CTX-001", 2, 6), ranged("CTX-002", 4, 2)];
        let out = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(out, "0123[REDACTED:CTX-002]6789");
    }

    #[test]
    fn test_out_of_bounds_range_skipped() {
        let text = "short";
        let d = [ranged("CTX-001", 3, 50)];
        let out = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(out, "short");
    }

    #[test]
    fn test_redaction_idempotent_inputs() {
        let text = "call javascript:alert(1) now";
        let d = [ranged("STRUCT-004", 5, 19)];
        let once = redact_field(text, SecurityAction::Redact, &d).unwrap();
        let twice = redact_field(text, SecurityAction::Redact, &d).unwrap();
        assert_eq!(once, twice);
        assert!(!once.contains("javascript:"));
    }
}
