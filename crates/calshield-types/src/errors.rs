/// Unified error type for the calshield workspace.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal errors should be converted into the appropriate variant. Note
/// that most subsystems deliberately absorb their own failures (the engine
/// is total over well-formed input); these variants exist for the seams
/// where an error is genuinely the caller's business, such as config
/// loading and the threat-intel client internals.
#[derive(Debug, thiserror::Error)]
pub enum ShieldError {
    /// Error from a scan tier (pattern compilation, rule evaluation).
    #[error("scan error: {0}")]
    Scan(String),

    /// Error from the threat-intel client or cache.
    #[error("threat intel error: {0}")]
    Intel(String),

    /// Error from the quarantine store.
    #[error("quarantine error: {0}")]
    Quarantine(String),

    /// Error from the audit logger.
    #[error("audit error: {0}")]
    Audit(String),

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(String),

    /// Timeout waiting on a subsystem.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ShieldError {
    fn from(err: serde_json::Error) -> Self {
        ShieldError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ShieldError {
    fn from(err: serde_yaml::Error) -> Self {
        ShieldError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ShieldError {
    fn from(err: std::io::Error) -> Self {
        ShieldError::Io(err.to_string())
    }
}
