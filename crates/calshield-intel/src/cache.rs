//! File-backed threat-intel cache.
//!
//! A single JSON document holding an array of `{hash, result, cachedAt,
//! expiresAt}` entries. Loaded lazily on first use (expired entries are
//! filtered out), pruned on read, and rewritten whole on every mutation.
//! The file is owned by one process; in-process writers serialize through
//! the internal mutex.
//!
//! Cache I/O never fails the caller: a missing or corrupt file reads as
//! empty, and failed writes are logged and dropped.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use calshield_types::intel::{FeedEntry, ThreatCheckResult};

/// One persisted cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    hash: String,
    result: ThreatCheckResult,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// TTL-based key→result store persisted to one JSON file.
pub struct ThreatIntelCache {
    path: PathBuf,
    ttl: Duration,
    entries: Mutex<Option<HashMap<String, CacheEntry>>>,
}

impl ThreatIntelCache {
    /// Create a cache over `path` with the given entry TTL.
    pub fn new(path: PathBuf, ttl_secs: u64) -> Self {
        Self {
            path,
            ttl: Duration::seconds(ttl_secs as i64),
            entries: Mutex::new(None),
        }
    }

    /// Look up a hash. Expired entries are dropped (and the drop is
    /// persisted) rather than returned.
    pub async fn get(&self, hash: &str) -> Option<ThreatCheckResult> {
        let mut guard = self.entries.lock().await;
        let map = self.loaded(&mut guard).await;

        let hit = map.get(hash).map(|e| (e.result.clone(), e.expires_at));
        match hit {
            Some((result, expires_at)) if expires_at > Utc::now() => Some(result),
            Some(_) => {
                map.remove(hash);
                let snapshot: Vec<CacheEntry> = map.values().cloned().collect();
                drop(guard);
                self.persist(&snapshot).await;
                None
            }
            None => None,
        }
    }

    /// Insert or replace an entry under the configured TTL.
    pub async fn set(&self, hash: &str, result: ThreatCheckResult) {
        let now = Utc::now();
        let entry = CacheEntry {
            hash: hash.to_string(),
            result,
            cached_at: now,
            expires_at: now + self.ttl,
        };

        let mut guard = self.entries.lock().await;
        let map = self.loaded(&mut guard).await;
        map.insert(hash.to_string(), entry);
        let snapshot: Vec<CacheEntry> = map.values().cloned().collect();
        drop(guard);
        self.persist(&snapshot).await;
    }

    /// Import feed entries as known-threat cache records. Returns how many
    /// were imported.
    pub async fn import_feed(&self, feed: &[FeedEntry]) -> usize {
        if feed.is_empty() {
            return 0;
        }
        let now = Utc::now();

        let mut guard = self.entries.lock().await;
        let map = self.loaded(&mut guard).await;
        for entry in feed {
            let result = ThreatCheckResult {
                known: true,
                confidence: entry.confidence,
                report_count: entry.report_count,
                first_seen: None,
                last_seen: Some(entry.updated_at),
                category: entry.category.clone(),
            };
            map.insert(
                entry.hash.clone(),
                CacheEntry {
                    hash: entry.hash.clone(),
                    result,
                    cached_at: now,
                    expires_at: now + self.ttl,
                },
            );
        }
        let snapshot: Vec<CacheEntry> = map.values().cloned().collect();
        drop(guard);
        self.persist(&snapshot).await;
        feed.len()
    }

    /// Number of live entries. Loads the file if needed.
    pub async fn len(&self) -> usize {
        let mut guard = self.entries.lock().await;
        self.loaded(&mut guard).await.len()
    }

    /// Whether the cache currently holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ensure the map is loaded, filtering out entries that expired while
    /// the file sat on disk.
    async fn loaded<'a>(
        &self,
        guard: &'a mut tokio::sync::MutexGuard<'_, Option<HashMap<String, CacheEntry>>>,
    ) -> &'a mut HashMap<String, CacheEntry> {
        if guard.is_none() {
            let now = Utc::now();
            let map = match tokio::fs::read(&self.path).await {
                Ok(bytes) => match serde_json::from_slice::<Vec<CacheEntry>>(&bytes) {
                    Ok(entries) => entries
                        .into_iter()
                        .filter(|e| e.expires_at > now)
                        .map(|e| (e.hash.clone(), e))
                        .collect(),
                    Err(e) => {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            "threat-intel cache file is corrupt, starting empty"
                        );
                        HashMap::new()
                    }
                },
                Err(_) => HashMap::new(),
            };
            debug!(
                path = %self.path.display(),
                entries = map.len(),
                "loaded threat-intel cache"
            );
            **guard = Some(map);
        }
        guard.as_mut().unwrap()
    }

    /// Rewrite the whole cache file. Failures are logged and dropped.
    async fn persist(&self, entries: &[CacheEntry]) {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let json = match serde_json::to_vec_pretty(entries) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize threat-intel cache");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to write threat-intel cache"
            );
        }
    }
}
