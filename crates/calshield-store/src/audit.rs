//! Audit logger.
//!
//! Append-only JSON-per-line files, one per day:
//! `<log_dir>/audit-YYYY-MM-DD.jsonl`. One record per scanned event.
//! Appends within the process are serialized through a mutex; failures
//! never propagate to the scan path.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use calshield_types::scan::{DetectionSummary, EventScanResult, RiskLevel, SecurityAction};

/// One audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_email: Option<String>,
    pub is_external_organizer: bool,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub action: SecurityAction,
    pub detections: Vec<DetectionSummary>,
    pub scan_duration_ms: u64,
    pub scanned_field_count: usize,
}

impl AuditRecord {
    /// Flatten a scan result into an audit record.
    pub fn from_result(result: &EventScanResult) -> Self {
        Self {
            timestamp: result.scanned_at,
            event_id: result.event_id.clone(),
            calendar_id: result.calendar_id.clone(),
            organizer_email: result.organizer_email.clone(),
            is_external_organizer: result.is_external_organizer,
            risk_score: result.overall_risk_score,
            risk_level: result.overall_risk_level,
            action: result.overall_action,
            detections: result.detection_summaries(),
            scan_duration_ms: result.scan_duration_ms,
            scanned_field_count: result.field_results.len(),
        }
    }
}

/// Append-only daily JSONL audit log.
pub struct AuditLogger {
    log_dir: PathBuf,
    // Appenders within one process serialize per logger.
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one scan result to today's log file. Failures are logged
    /// and swallowed.
    pub async fn log_scan(&self, result: &EventScanResult) {
        self.append(&AuditRecord::from_result(result)).await;
    }

    /// Append a pre-built record.
    pub async fn append(&self, record: &AuditRecord) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            warn!(error = %e, "failed to create audit log directory");
            return;
        }
        let path = self.day_path(record.timestamp.date_naive());
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&line).await {
                    warn!(path = %path.display(), error = %e, "failed to append audit record");
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open audit log");
            }
        }
    }

    /// Read back one day's records, skipping unparseable lines.
    pub async fn read_day(&self, date: NaiveDate) -> Vec<AuditRecord> {
        let path = self.day_path(date);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.log_dir
            .join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }
}
