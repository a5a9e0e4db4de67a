//! Scan engine orchestrator.
//!
//! `scan_event` takes one calendar event and the owner's domain, runs
//! every tier over every scannable field, scores fields and the event,
//! applies redaction, and returns the scan result together with a
//! sanitized copy of the event. Quarantine, audit, and threat reporting
//! run as fire-and-forget background tasks on dangerous outcomes.
//!
//! The engine is total: subsystem failures degrade to reduced results,
//! never to errors. Engines are stateless and safe for concurrent use on
//! independent events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use calshield_intel::{fingerprint, ThreatIntelClient, ThreatIntelTier};
use calshield_scan::redactor::redact_field;
use calshield_scan::{ContextualTier, RiskScorer, StructuralTier};
use calshield_store::{AuditLogger, QuarantineStore};
use calshield_types::config::{RiskThresholds, ShieldConfig};
use calshield_types::event::CalendarEvent;
use calshield_types::scan::{
    Detection, DetectionTier, EventScanResult, FieldKind, FieldScanResult, ScanContext,
    SecurityAction, ENGINE_TIMEOUT_RULE_ID, EVENT_BUDGET_MS, MAX_BATCH_EVENTS,
    MAX_DETECTIONS_PER_FIELD,
};
use calshield_types::traits::ScanTier;

/// Top-level scan orchestrator.
pub struct ScanEngine {
    tiers: Vec<Arc<dyn ScanTier>>,
    scorer: RiskScorer,
    event_budget: Duration,
    quarantine: Option<Arc<QuarantineStore>>,
    audit: Option<Arc<AuditLogger>>,
    intel: Option<Arc<ThreatIntelClient>>,
}

impl ScanEngine {
    /// Engine with the two synchronous tiers and no side-effect stores.
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self {
            tiers: vec![
                Arc::new(StructuralTier::new()),
                Arc::new(ContextualTier::new()),
            ],
            scorer: RiskScorer::new(thresholds),
            event_budget: Duration::from_millis(EVENT_BUDGET_MS),
            quarantine: None,
            audit: None,
            intel: None,
        }
    }

    /// Fully wired engine: all three tiers plus quarantine and audit.
    pub fn from_config(config: &ShieldConfig) -> Self {
        let intel = Arc::new(ThreatIntelClient::new(config.threat_intel.clone()));
        Self::new(config.thresholds)
            .with_threat_intel(intel)
            .with_quarantine(Arc::new(QuarantineStore::new(
                config.quarantine.dir.clone(),
                config.quarantine.ttl_secs,
            )))
            .with_audit(Arc::new(AuditLogger::new(config.audit.log_dir.clone())))
    }

    /// Add the threat-intel tier backed by `client`, and use the same
    /// client for fire-and-forget threat reports.
    pub fn with_threat_intel(mut self, client: Arc<ThreatIntelClient>) -> Self {
        self.tiers.push(Arc::new(ThreatIntelTier::new(client.clone())));
        self.intel = Some(client);
        self
    }

    /// Add an extra detection tier. The scorer must know the tier's
    /// weight; unknown tiers score zero.
    pub fn with_tier(mut self, tier: Arc<dyn ScanTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn with_quarantine(mut self, store: Arc<QuarantineStore>) -> Self {
        self.quarantine = Some(store);
        self
    }

    pub fn with_audit(mut self, logger: Arc<AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    /// Override the per-event wall budget (operational tuning and tests).
    pub fn with_event_budget(mut self, budget: Duration) -> Self {
        self.event_budget = budget;
        self
    }

    /// Scan one event. Returns the scan result and a sanitized copy of
    /// the event with dangerous field content rewritten.
    pub async fn scan_event(
        &self,
        event: &CalendarEvent,
        owner_domain: Option<&str>,
    ) -> (EventScanResult, CalendarEvent) {
        let started = Instant::now();
        let deadline = started + self.event_budget;

        let organizer_email = event.organizer_email().map(String::from);
        let organizer_domain = organizer_email.as_deref().and_then(email_domain);
        let is_external_organizer = match (owner_domain, organizer_domain.as_deref()) {
            (Some(owner), Some(organizer)) => !owner.eq_ignore_ascii_case(organizer),
            _ => false,
        };

        let fields = extract_fields(event);
        let mut field_results: Vec<FieldScanResult> = Vec::with_capacity(fields.len());
        let mut timed_out = false;

        for (field_name, field_kind, text) in &fields {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            let ctx = ScanContext {
                field_name: field_name.clone(),
                field_kind: *field_kind,
                organizer_email: organizer_email.clone(),
                organizer_domain: organizer_domain.clone(),
                is_external_organizer,
                owner_domain: owner_domain.map(String::from),
            };

            let mut detections = Vec::new();
            for tier in &self.tiers {
                detections.extend(tier.analyze(text, &ctx).await);
            }

            // Scoring and redaction see every detection; only the copy
            // stored on the field result is bounded.
            let (risk_score, risk_level, action) = self.scorer.score_field(&detections);
            let sanitized_content = redact_field(text, action, &detections);
            let detections = cap_detections(detections);

            field_results.push(FieldScanResult {
                field_name: field_name.clone(),
                original_length: text.chars().count(),
                risk_score,
                risk_level,
                action,
                detections,
                sanitized_content,
            });
        }

        if timed_out {
            warn!(
                event_id = %event.id,
                completed_fields = field_results.len(),
                "event scan exceeded its wall budget, returning partial result"
            );
            field_results.push(self.timeout_field_result(field_results.len()));
        }

        let (overall_risk_score, overall_risk_level, overall_action) =
            self.scorer.score_event(&field_results);

        let sanitized_event = build_sanitized_event(event, &field_results);

        let result = EventScanResult {
            event_id: event.id.clone(),
            calendar_id: event.calendar_id.clone(),
            organizer_email,
            is_external_organizer,
            overall_risk_score,
            overall_risk_level,
            overall_action,
            field_results,
            scan_duration_ms: started.elapsed().as_millis() as u64,
            scanned_at: Utc::now(),
        };

        debug!(
            event_id = %event.id,
            score = result.overall_risk_score,
            level = %result.overall_risk_level,
            action = %result.overall_action,
            duration_ms = result.scan_duration_ms,
            "event scanned"
        );

        self.dispatch_side_effects(event, &result);
        (result, sanitized_event)
    }

    /// Scan up to [`MAX_BATCH_EVENTS`] events; the excess is dropped with
    /// a warning (callers chunk larger batches).
    pub async fn scan_batch(
        &self,
        events: &[CalendarEvent],
        owner_domain: Option<&str>,
    ) -> Vec<(EventScanResult, CalendarEvent)> {
        if events.len() > MAX_BATCH_EVENTS {
            warn!(
                total = events.len(),
                cap = MAX_BATCH_EVENTS,
                "batch exceeds the scan cap, excess events are skipped"
            );
        }
        let mut results = Vec::new();
        for event in events.iter().take(MAX_BATCH_EVENTS) {
            results.push(self.scan_event(event, owner_domain).await);
        }
        results
    }

    /// The synthetic field result carrying the timeout detection. Its
    /// score is floored at the suspicious threshold so the event's
    /// max-score path yields an action of at least Flag.
    fn timeout_field_result(&self, completed_fields: usize) -> FieldScanResult {
        let detection = Detection::new(
            DetectionTier::Engine,
            ENGINE_TIMEOUT_RULE_ID,
            "Event scan timeout",
            1.0,
            "scan aborted by wall-clock budget",
            0,
            0,
            1.0,
        )
        .with_meta("completedFields", completed_fields.to_string());

        let score = self.scorer.suspicious_threshold();
        let level = self.scorer.level_for(score);
        FieldScanResult {
            field_name: "engine".to_string(),
            original_length: 0,
            risk_score: score,
            risk_level: level,
            action: level.action(),
            detections: vec![detection],
            sanitized_content: None,
        }
    }

    /// Quarantine, audit, and threat-report dispatch. Fire-and-forget:
    /// tasks are spawned and their failures stay internal.
    fn dispatch_side_effects(&self, event: &CalendarEvent, result: &EventScanResult) {
        if let Some(audit) = &self.audit {
            let audit = audit.clone();
            let result = result.clone();
            tokio::spawn(async move {
                audit.log_scan(&result).await;
            });
        }

        let dangerous = matches!(
            result.overall_action,
            SecurityAction::Redact | SecurityAction::Block
        );
        if !dangerous {
            return;
        }

        if let Some(quarantine) = &self.quarantine {
            let quarantine = quarantine.clone();
            let event = event.clone();
            let result = result.clone();
            tokio::spawn(async move {
                quarantine.store_event(&event, &result).await;
            });
        }

        if let Some(intel) = &self.intel {
            // Fingerprint the highest-risk field; its text is what the
            // community needs to recognize.
            let worst = result
                .field_results
                .iter()
                .max_by(|a, b| a.risk_score.total_cmp(&b.risk_score))
                .map(|f| f.field_name.clone());
            let Some(field_name) = worst else {
                return;
            };
            let Some(text) = field_text(event, &field_name) else {
                return;
            };

            let mut rule_ids: Vec<String> = result
                .detection_summaries()
                .iter()
                .map(|d| d.rule_id.clone())
                .collect();
            rule_ids.sort();
            rule_ids.dedup();

            let fp = fingerprint::fingerprint(
                &text,
                rule_ids,
                result.overall_risk_score,
                result
                    .organizer_email
                    .as_deref()
                    .and_then(email_domain),
            );
            let intel = intel.clone();
            tokio::spawn(async move {
                intel.report(&fp).await;
            });
        }
    }
}

/// Cap a field's stored detection list at [`MAX_DETECTIONS_PER_FIELD`],
/// keeping the highest-severity findings regardless of which tier emitted
/// them. A plain first-N cut in tier order could evict an entire tier's
/// contribution whenever another tier maxes out the cap. The retained
/// list is re-sorted by (rule id, offset) to stay deterministic.
fn cap_detections(mut detections: Vec<Detection>) -> Vec<Detection> {
    if detections.len() > MAX_DETECTIONS_PER_FIELD {
        detections.sort_by(|a, b| {
            b.severity
                .total_cmp(&a.severity)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then(a.match_offset.cmp(&b.match_offset))
        });
        detections.truncate(MAX_DETECTIONS_PER_FIELD);
        detections.sort_by(|a, b| {
            a.rule_id
                .cmp(&b.rule_id)
                .then(a.match_offset.cmp(&b.match_offset))
        });
    }
    detections
}

/// The domain part of an email address: everything after a single `@`,
/// lowercased. Addresses without exactly one `@` have no domain.
fn email_domain(email: &str) -> Option<String> {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
            Some(domain.to_lowercase())
        }
        _ => None,
    }
}

/// The scannable fields of an event, in extraction order.
fn extract_fields(event: &CalendarEvent) -> Vec<(String, FieldKind, String)> {
    let mut fields = Vec::new();
    if let Some(summary) = &event.summary {
        if !summary.is_empty() {
            fields.push(("summary".to_string(), FieldKind::Title, summary.clone()));
        }
    }
    if let Some(description) = &event.description {
        if !description.is_empty() {
            fields.push((
                "description".to_string(),
                FieldKind::Description,
                description.clone(),
            ));
        }
    }
    if let Some(location) = &event.location {
        if !location.is_empty() {
            fields.push(("location".to_string(), FieldKind::Location, location.clone()));
        }
    }
    for (i, attendee) in event.attendees.iter().enumerate() {
        if let Some(name) = &attendee.display_name {
            if !name.is_empty() {
                fields.push((
                    format!("attendees[{i}].displayName"),
                    FieldKind::AttendeeName,
                    name.clone(),
                ));
            }
        }
    }
    for (i, attachment) in event.attachments.iter().enumerate() {
        if let Some(title) = &attachment.title {
            if !title.is_empty() {
                fields.push((
                    format!("attachments[{i}].title"),
                    FieldKind::Attachment,
                    title.clone(),
                ));
            }
        }
    }
    fields
}

/// Look a field's original text back up on the event by field path.
fn field_text(event: &CalendarEvent, field_name: &str) -> Option<String> {
    extract_fields(event)
        .into_iter()
        .find(|(name, _, _)| name == field_name)
        .map(|(_, _, text)| text)
}

/// Shallow copy of the event with the top-level text fields overwritten
/// from redacted/blocked field results. Attendee and attachment subfields
/// are never rewritten; they influence score and annotations only.
fn build_sanitized_event(event: &CalendarEvent, fields: &[FieldScanResult]) -> CalendarEvent {
    let mut sanitized = event.clone();
    for field in fields {
        let rewritten = match (&field.action, &field.sanitized_content) {
            (SecurityAction::Redact | SecurityAction::Block, Some(content)) => content.clone(),
            _ => continue,
        };
        match field.field_name.as_str() {
            "summary" => sanitized.summary = Some(rewritten),
            "description" => sanitized.description = Some(rewritten),
            "location" => sanitized.location = Some(rewritten),
            _ => {}
        }
    }
    sanitized
}
