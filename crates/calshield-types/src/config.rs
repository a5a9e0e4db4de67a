/// Configuration for the calshield engine and its stores.
///
/// All components take injected paths so tests can point them at temp
/// directories; in deployment everything lives under one per-user state
/// root (`client-id`, `logs/`, `quarantine/`, `cache/`).
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ShieldError;

/// Top-level configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ShieldConfig {
    /// Risk score thresholds.
    pub thresholds: RiskThresholds,
    /// Threat-intel client settings.
    pub threat_intel: ThreatIntelConfig,
    /// Quarantine store settings.
    pub quarantine: QuarantineConfig,
    /// Audit logger settings.
    pub audit: AuditConfig,
}

impl ShieldConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ShieldError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ShieldError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: ShieldConfig = serde_yaml::from_str(&content)
            .map_err(|e| ShieldError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config rooted at a single state directory, using defaults
    /// for everything else.
    pub fn with_state_root(root: &Path) -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            threat_intel: ThreatIntelConfig {
                state_dir: root.to_path_buf(),
                cache_path: root.join("cache").join("threat-intel.json"),
                ..Default::default()
            },
            quarantine: QuarantineConfig {
                dir: root.join("quarantine"),
                ..Default::default()
            },
            audit: AuditConfig {
                log_dir: root.join("logs"),
            },
        }
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ShieldError> {
        self.thresholds.validate()?;
        if self.threat_intel.enabled && self.threat_intel.api_base.is_empty() {
            return Err(ShieldError::Config(
                "threat_intel.api_base must be set when the cloud is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Score bands mapping composite scores to risk levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Scores at or above this are Suspicious.
    pub suspicious: f64,
    /// Scores at or above this are Dangerous.
    pub dangerous: f64,
    /// Scores at or above this are Critical.
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            suspicious: 0.30,
            dangerous: 0.60,
            critical: 0.85,
        }
    }
}

impl RiskThresholds {
    /// Enforce `0 <= suspicious < dangerous < critical <= 1`.
    pub fn validate(&self) -> Result<(), ShieldError> {
        let ordered = 0.0 <= self.suspicious
            && self.suspicious < self.dangerous
            && self.dangerous < self.critical
            && self.critical <= 1.0;
        if !ordered {
            return Err(ShieldError::Config(format!(
                "thresholds must satisfy 0 <= suspicious < dangerous < critical <= 1, \
                 got {}/{}/{}",
                self.suspicious, self.dangerous, self.critical
            )));
        }
        Ok(())
    }
}

/// Threat-intel client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatIntelConfig {
    /// Cloud API base, including the version prefix
    /// (e.g. `https://intel.example.com/api/v1`).
    pub api_base: String,
    /// Whether cloud lookups, reports, and feed syncs are performed at
    /// all. When false the client is cache-only.
    pub enabled: bool,
    /// Minimum seconds between feed syncs.
    pub sync_interval_secs: u64,
    /// Directory holding the persisted anonymous client id.
    pub state_dir: PathBuf,
    /// Path of the cache file.
    pub cache_path: PathBuf,
    /// Cache entry time-to-live in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for ThreatIntelConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            enabled: false,
            sync_interval_secs: 3_600,
            state_dir: PathBuf::from("."),
            cache_path: PathBuf::from("threat-intel.json"),
            cache_ttl_secs: 24 * 3_600,
        }
    }
}

/// Quarantine store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Directory holding one JSON file per quarantined event.
    pub dir: PathBuf,
    /// Entry time-to-live in seconds.
    pub ttl_secs: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("quarantine"),
            ttl_secs: 7 * 24 * 3_600,
        }
    }
}

/// Audit logger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for the daily `audit-YYYY-MM-DD.jsonl` files.
    pub log_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_thresholds() {
        let t = RiskThresholds::default();
        assert_eq!(t.suspicious, 0.30);
        assert_eq!(t.dangerous, 0.60);
        assert_eq!(t.critical, 0.85);
        t.validate().unwrap();
    }

    #[test]
    fn test_threshold_validation_rejects_inverted() {
        let t = RiskThresholds {
            suspicious: 0.7,
            dangerous: 0.6,
            critical: 0.9,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_threshold_validation_rejects_out_of_range() {
        let t = RiskThresholds {
            suspicious: 0.3,
            dangerous: 0.6,
            critical: 1.2,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_enabled_cloud_requires_api_base() {
        let config = ShieldConfig {
            threat_intel: ThreatIntelConfig {
                enabled: true,
                api_base: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_root_layout() {
        let config = ShieldConfig::with_state_root(Path::new("/var/lib/calshield"));
        assert!(config
            .threat_intel
            .cache_path
            .ends_with("cache/threat-intel.json"));
        assert!(config.quarantine.dir.ends_with("quarantine"));
        assert!(config.audit.log_dir.ends_with("logs"));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "thresholds:\n  suspicious: 0.25\n  dangerous: 0.55\n  critical: 0.80\n"
        )
        .unwrap();
        let config = ShieldConfig::load(file.path()).unwrap();
        assert_eq!(config.thresholds.suspicious, 0.25);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.quarantine.ttl_secs, 7 * 24 * 3_600);
    }

    #[test]
    fn test_load_rejects_invalid_thresholds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "thresholds:\n  suspicious: 0.9\n  dangerous: 0.5\n  critical: 0.95\n"
        )
        .unwrap();
        assert!(ShieldConfig::load(file.path()).is_err());
    }
}
