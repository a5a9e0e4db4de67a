//! Threat-intelligence client.
//!
//! Wraps the file-backed cache with optional cloud lookups, anonymous
//! reporting, and feed synchronization. The client never fails the
//! caller: when the cloud is disabled or unreachable it degrades to
//! cache-only behavior and negative answers.
//!
//! Identity is an anonymous UUID v4 generated on first need and persisted
//! at `state_dir/client-id`. Nothing else about the installation leaves
//! the machine; reports carry only irreversible hashes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use calshield_types::config::ThreatIntelConfig;
use calshield_types::errors::ShieldError;
use calshield_types::intel::{ThreatCheckResult, ThreatFeed, ThreatFingerprint};
use calshield_types::traits::ThreatLookup;

use crate::cache::ThreatIntelCache;

/// Per-request timeout for check and report calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Feed downloads get a little longer.
const FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `POST {api}/report`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest<'a> {
    client_id: &'a str,
    fingerprint: &'a ThreatFingerprint,
    reported_at: DateTime<Utc>,
}

/// Cloud-backed (or cache-only) threat-intel client.
pub struct ThreatIntelClient {
    config: ThreatIntelConfig,
    cache: ThreatIntelCache,
    http: reqwest::Client,
    client_id: Mutex<Option<String>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl ThreatIntelClient {
    /// Create a client from config. The cache file and client id are
    /// touched lazily on first use.
    pub fn new(config: ThreatIntelConfig) -> Self {
        let cache = ThreatIntelCache::new(config.cache_path.clone(), config.cache_ttl_secs);
        Self {
            config,
            cache,
            http: reqwest::Client::new(),
            client_id: Mutex::new(None),
            last_sync: Mutex::new(None),
        }
    }

    /// The anonymous client id, generating and persisting one on first use.
    pub async fn client_id(&self) -> String {
        let mut guard = self.client_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return id.clone();
        }

        let path = self.config.state_dir.join("client-id");
        let id = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if Uuid::parse_str(contents.trim()).is_ok() => {
                contents.trim().to_string()
            }
            _ => {
                let id = Uuid::new_v4().to_string();
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(&path, &id).await {
                    warn!(error = %e, "failed to persist client id");
                }
                info!("generated new anonymous threat-intel client id");
                id
            }
        };
        *guard = Some(id.clone());
        id
    }

    /// Check a fingerprint: cache first, then (when enabled) the cloud.
    ///
    /// Once a cloud response has been cached, subsequent checks of the
    /// same hashes are answered entirely from the cache.
    pub async fn check(&self, fp: &ThreatFingerprint) -> ThreatCheckResult {
        let hashes = [&fp.content_hash, &fp.structural_hash];

        let mut cached = [false, false];
        for (i, hash) in hashes.iter().enumerate() {
            if let Some(result) = self.cache.get(hash).await {
                if result.known {
                    return result;
                }
                cached[i] = true;
            }
        }

        if !self.config.enabled {
            return ThreatCheckResult::negative();
        }

        for (i, hash) in hashes.iter().enumerate() {
            if cached[i] {
                continue;
            }
            match self.fetch_check(hash).await {
                Ok(result) => {
                    self.cache.set(hash, result.clone()).await;
                    if result.known {
                        return result;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "threat-intel check failed, treating as negative");
                }
            }
        }

        ThreatCheckResult::negative()
    }

    /// Report a dangerous fingerprint to the cloud. No-op when disabled;
    /// all errors are swallowed (reporting is best-effort).
    pub async fn report(&self, fp: &ThreatFingerprint) {
        if !self.config.enabled {
            return;
        }
        let client_id = self.client_id().await;
        let body = ReportRequest {
            client_id: &client_id,
            fingerprint: fp,
            reported_at: Utc::now(),
        };
        let url = format!("{}/report", self.config.api_base);
        match self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!("reported fingerprint to threat-intel service");
            }
            Ok(response) => {
                debug!(status = %response.status(), "threat-intel report rejected");
            }
            Err(e) => {
                debug!(error = %e, "threat-intel report failed");
            }
        }
    }

    /// Pull the community feed into the cache. Returns the number of
    /// imported entries; 0 when disabled, rate-limited by the sync
    /// interval, or on any error.
    pub async fn sync_feed(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let now = Utc::now();
        let since = {
            let guard = self.last_sync.lock().await;
            match *guard {
                Some(last)
                    if (now - last).num_seconds() < self.config.sync_interval_secs as i64 =>
                {
                    return 0;
                }
                Some(last) => last,
                None => now - chrono::Duration::hours(24),
            }
        };

        let url = format!(
            "{}/feed?since={}",
            self.config.api_base,
            since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        let feed: ThreatFeed = match self.fetch_json(&url, FEED_TIMEOUT).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "threat feed sync failed");
                return 0;
            }
        };

        let imported = self.cache.import_feed(&feed.entries).await;
        *self.last_sync.lock().await = Some(now);
        info!(imported, "synced threat-intel feed");
        imported
    }

    async fn fetch_check(&self, hash: &str) -> Result<ThreatCheckResult, ShieldError> {
        let url = format!("{}/check/{}", self.config.api_base, hash);
        self.fetch_json(&url, REQUEST_TIMEOUT).await
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<T, ShieldError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ShieldError::Intel(format!("request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ShieldError::Intel(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ShieldError::Intel(format!("failed to parse response from {url}: {e}")))
    }
}

#[async_trait]
impl ThreatLookup for ThreatIntelClient {
    async fn check(&self, fp: &ThreatFingerprint) -> Result<ThreatCheckResult, ShieldError> {
        Ok(ThreatIntelClient::check(self, fp).await)
    }
}
