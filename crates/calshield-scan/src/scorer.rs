//! Risk scorer: detections in, (score, level, action) out.
//!
//! Pure function of the detection list and the configured thresholds.
//! Fixed tier weights; a convergence bonus inside each tier (more
//! detections push the tier score up, capped) and a corroboration bonus
//! across tiers (detections from independent tiers amplify each other).

use calshield_types::config::RiskThresholds;
use calshield_types::scan::{
    Detection, DetectionTier, FieldScanResult, RiskLevel, SecurityAction,
};

/// Weight of each tier in the composite score. The engine tier carries
/// synthetic detections only and contributes nothing to the composite.
fn tier_weight(tier: DetectionTier) -> f64 {
    match tier {
        DetectionTier::Structural => 0.40,
        DetectionTier::Contextual => 0.45,
        DetectionTier::ThreatIntel => 0.15,
        DetectionTier::Engine => 0.0,
    }
}

/// Maps detection lists to scores, levels, and actions.
#[derive(Debug, Clone, Copy)]
pub struct RiskScorer {
    thresholds: RiskThresholds,
}

impl RiskScorer {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self { thresholds }
    }

    /// Score one field's combined detection list.
    pub fn score_field(&self, detections: &[Detection]) -> (f64, RiskLevel, SecurityAction) {
        if detections.is_empty() {
            return (0.0, RiskLevel::Safe, SecurityAction::Pass);
        }

        let tiers = [
            DetectionTier::Structural,
            DetectionTier::Contextual,
            DetectionTier::ThreatIntel,
            DetectionTier::Engine,
        ];

        let mut composite = 0.0;
        let mut firing_tiers = 0usize;
        for tier in tiers {
            let in_tier: Vec<&Detection> =
                detections.iter().filter(|d| d.tier == tier).collect();
            if in_tier.is_empty() {
                continue;
            }
            let max_severity = in_tier
                .iter()
                .map(|d| d.severity)
                .fold(0.0_f64, f64::max);
            let convergence = (0.05 * (in_tier.len() as f64 - 1.0)).min(0.15);
            let tier_score = (max_severity + convergence).min(1.0);
            if tier_score > 0.0 {
                firing_tiers += 1;
            }
            composite += tier_score * tier_weight(tier);
        }

        if firing_tiers >= 2 {
            composite = (composite * 1.15).min(1.0);
        }
        if firing_tiers >= 3 {
            composite = (composite * 1.10).min(1.0);
        }

        let level = self.level_for(composite);
        (composite, level, level.action())
    }

    /// Score a whole event from its field results: the maximum field score.
    pub fn score_event(&self, fields: &[FieldScanResult]) -> (f64, RiskLevel, SecurityAction) {
        let score = fields
            .iter()
            .map(|f| f.risk_score)
            .fold(0.0_f64, f64::max);
        let level = self.level_for(score);
        (score, level, level.action())
    }

    /// Map a score onto the configured threshold bands.
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.thresholds.critical {
            RiskLevel::Critical
        } else if score >= self.thresholds.dangerous {
            RiskLevel::Dangerous
        } else if score >= self.thresholds.suspicious {
            RiskLevel::Suspicious
        } else {
            RiskLevel::Safe
        }
    }

    /// The configured suspicious threshold. Used by the engine to floor
    /// the synthetic timeout result at an at-least-Flag outcome.
    pub fn suspicious_threshold(&self) -> f64 {
        self.thresholds.suspicious
    }
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new(RiskThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RiskScorer {
        RiskScorer::default()
    }

    fn detection(tier: DetectionTier, severity: f64) -> Detection {
        Detection::new(tier, "TEST-001", "test", severity, "x", 0, 0, 0.9)
    }

    #[test]
    fn test_empty_is_safe() {
        let (score, level, action) = scorer().score_field(&[]);
        assert_eq!(score, 0.0);
        assert_eq!(level, RiskLevel::Safe);
        assert_eq!(action, SecurityAction::Pass);
    }

    #[test]
    fn test_single_structural_detection() {
        let d = [detection(DetectionTier::Structural, 0.90)];
        let (score, level, _) = scorer().score_field(&d);
        assert!((score - 0.90 * 0.40).abs() < 1e-9);
        assert_eq!(level, RiskLevel::Suspicious);
    }

    #[test]
    fn test_convergence_bonus_within_tier() {
        let one = [detection(DetectionTier::Contextual, 0.60)];
        let three = [
            detection(DetectionTier::Contextual, 0.60),
            detection(DetectionTier::Contextual, 0.40),
            detection(DetectionTier::Contextual, 0.30),
        ];
        let (s1, _, _) = scorer().score_field(&one);
        let (s3, _, _) = scorer().score_field(&three);
        // 0.60 vs 0.60 + 0.05*2 = 0.70, both times weight 0.45.
        assert!((s1 - 0.60 * 0.45).abs() < 1e-9);
        assert!((s3 - 0.70 * 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_convergence_bonus_caps_at_015() {
        let detections: Vec<Detection> = (0..10)
            .map(|_| detection(DetectionTier::Structural, 0.50))
            .collect();
        let (score, _, _) = scorer().score_field(&detections);
        assert!((score - (0.50 + 0.15) * 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_two_tier_corroboration() {
        let d = [
            detection(DetectionTier::Structural, 0.90),
            detection(DetectionTier::Contextual, 0.80),
        ];
        let (score, _, _) = scorer().score_field(&d);
        let expected = ((0.90 * 0.40) + (0.80 * 0.45)) * 1.15;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_three_tier_corroboration() {
        let d = [
            detection(DetectionTier::Structural, 0.90),
            detection(DetectionTier::Contextual, 0.80),
            detection(DetectionTier::ThreatIntel, 0.95),
        ];
        let (score, _, _) = scorer().score_field(&d);
        let expected = (((0.90_f64 * 0.40) + (0.80 * 0.45) + (0.95 * 0.15)) * 1.15 * 1.10).min(1.0);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_corroboration_monotone() {
        // Adding a detection from a silent tier never lowers the score.
        let base = [detection(DetectionTier::Structural, 0.90)];
        let more = [
            detection(DetectionTier::Structural, 0.90),
            detection(DetectionTier::ThreatIntel, 0.10),
        ];
        let (s_base, _, _) = scorer().score_field(&base);
        let (s_more, _, _) = scorer().score_field(&more);
        assert!(s_more >= s_base);
    }

    #[test]
    fn test_score_clamped_at_one() {
        let d = [
            detection(DetectionTier::Structural, 1.0),
            detection(DetectionTier::Structural, 1.0),
            detection(DetectionTier::Contextual, 1.0),
            detection(DetectionTier::ThreatIntel, 1.0),
        ];
        let (score, level, _) = scorer().score_field(&d);
        assert!(score <= 1.0);
        assert_eq!(level, RiskLevel::Critical);
    }

    #[test]
    fn test_threshold_boundaries() {
        let s = scorer();
        assert_eq!(s.level_for(0.29), RiskLevel::Safe);
        assert_eq!(s.level_for(0.30), RiskLevel::Suspicious);
        assert_eq!(s.level_for(0.60), RiskLevel::Dangerous);
        assert_eq!(s.level_for(0.85), RiskLevel::Critical);
        assert_eq!(s.level_for(1.0), RiskLevel::Critical);
    }

    #[test]
    fn test_engine_tier_weight_zero() {
        let d = [detection(DetectionTier::Engine, 1.0)];
        let (score, level, _) = scorer().score_field(&d);
        assert_eq!(score, 0.0);
        assert_eq!(level, RiskLevel::Safe);
    }

    #[test]
    fn test_event_score_is_field_max() {
        let fields = vec![
            field_result("summary", 0.20),
            field_result("description", 0.72),
            field_result("location", 0.10),
        ];
        let (score, level, action) = scorer().score_event(&fields);
        assert_eq!(score, 0.72);
        assert_eq!(level, RiskLevel::Dangerous);
        assert_eq!(action, SecurityAction::Redact);
    }

    #[test]
    fn test_event_score_no_fields() {
        let (score, level, _) = scorer().score_event(&[]);
        assert_eq!(score, 0.0);
        assert_eq!(level, RiskLevel::Safe);
    }

    fn field_result(name: &str, score: f64) -> FieldScanResult {
        let scorer = RiskScorer::default();
        let level = scorer.level_for(score);
        FieldScanResult {
            field_name: name.to_string(),
            original_length: 10,
            risk_score: score,
            risk_level: level,
            action: level.action(),
            detections: vec![],
            sanitized_content: None,
        }
    }
}
