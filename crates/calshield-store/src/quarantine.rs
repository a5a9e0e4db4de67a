//! Quarantine store.
//!
//! When the engine blocks or redacts an event, the original field
//! contents are archived here so the user can inspect what was removed.
//! One JSON file per event under the store directory, named after the
//! sanitized event id. Entries expire after the configured TTL and are
//! pruned lazily by `get` and `list` (and explicitly by `cleanup`).
//!
//! Quarantine is supplementary: all write failures are swallowed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use calshield_types::event::CalendarEvent;
use calshield_types::scan::{DetectionSummary, EventScanResult, RiskLevel, SecurityAction};

/// One archived event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineEntry {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    pub quarantined_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_email: Option<String>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub action: SecurityAction,
    /// Field path → original content, for every text field the event had.
    pub original_fields: BTreeMap<String, String>,
    /// Compact per-detection summary.
    pub detections: Vec<DetectionSummary>,
}

impl QuarantineEntry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// File-per-event quarantine archive.
pub struct QuarantineStore {
    dir: PathBuf,
    ttl: Duration,
}

impl QuarantineStore {
    /// Create a store over `dir` with the given entry TTL.
    pub fn new(dir: PathBuf, ttl_secs: u64) -> Self {
        Self {
            dir,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Archive an event's original content alongside its scan result.
    /// Failures are logged and swallowed.
    pub async fn store_event(&self, event: &CalendarEvent, result: &EventScanResult) {
        let now = Utc::now();
        let entry = QuarantineEntry {
            event_id: event.id.clone(),
            calendar_id: event.calendar_id.clone(),
            quarantined_at: now,
            expires_at: now + self.ttl,
            organizer_email: event.organizer_email().map(String::from),
            risk_score: result.overall_risk_score,
            risk_level: result.overall_risk_level,
            action: result.overall_action,
            original_fields: original_fields(event),
            detections: result.detection_summaries(),
        };
        self.write_entry(&entry).await;
    }

    /// Fetch an entry by event id. Expired entries are deleted and treated
    /// as missing.
    pub async fn get(&self, event_id: &str) -> Option<QuarantineEntry> {
        let path = self.entry_path(event_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let entry: QuarantineEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt quarantine entry");
                return None;
            }
        };
        if entry.is_expired() {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        Some(entry)
    }

    /// List live entries at or above `min_risk_level`, newest first.
    /// Expired entries encountered during the scan are unlinked.
    pub async fn list(&self, min_risk_level: Option<RiskLevel>) -> Vec<QuarantineEntry> {
        let mut entries = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return entries;
        };
        while let Ok(Some(dirent)) = dir.next_entry().await {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<QuarantineEntry>(&bytes) else {
                continue;
            };
            if entry.is_expired() {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if let Some(min) = min_risk_level {
                if entry.risk_level < min {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at));
        entries
    }

    /// Remove every expired entry. Returns how many files were deleted.
    pub async fn cleanup(&self) -> usize {
        let mut removed = 0;
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(dirent)) = dir.next_entry().await {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let expired = match serde_json::from_slice::<QuarantineEntry>(&bytes) {
                Ok(entry) => entry.is_expired(),
                // Unreadable entries are junk; clear them too.
                Err(_) => true,
            };
            if expired && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        debug!(removed, "quarantine cleanup finished");
        removed
    }

    fn entry_path(&self, event_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(event_id)))
    }

    async fn write_entry(&self, entry: &QuarantineEntry) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(error = %e, "failed to create quarantine directory");
            return;
        }
        let path = self.entry_path(&entry.event_id);
        let json = match serde_json::to_vec_pretty(entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize quarantine entry");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!(path = %path.display(), error = %e, "failed to write quarantine entry");
        } else {
            debug!(event_id = %entry.event_id, "event quarantined");
        }
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` so event ids cannot
/// escape the store directory.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Collect every present text field of an event, keyed by field path.
fn original_fields(event: &CalendarEvent) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    if let Some(summary) = &event.summary {
        fields.insert("summary".to_string(), summary.clone());
    }
    if let Some(description) = &event.description {
        fields.insert("description".to_string(), description.clone());
    }
    if let Some(location) = &event.location {
        fields.insert("location".to_string(), location.clone());
    }
    for (i, attendee) in event.attendees.iter().enumerate() {
        if let Some(name) = &attendee.display_name {
            if !name.is_empty() {
                fields.insert(format!("attendees[{i}].displayName"), name.clone());
            }
        }
    }
    for (i, attachment) in event.attachments.iter().enumerate() {
        if let Some(title) = &attachment.title {
            if !title.is_empty() {
                fields.insert(format!("attachments[{i}].title"), title.clone());
            }
        }
    }
    fields
}
