/// Trait contracts between the calshield subsystems.
///
/// The engine codes against these interfaces, not against concrete tier or
/// client types. Adding a future detection tier means implementing
/// [`ScanTier`] and giving the scorer a weight for it.
use async_trait::async_trait;

use crate::errors::ShieldError;
use crate::intel::{ThreatCheckResult, ThreatFingerprint};
use crate::scan::{Detection, ScanContext};

/// One detection tier: scans a single text field and emits findings.
///
/// Tiers are infallible by contract: a tier that hits an internal error
/// returns whatever detections it has produced so far. The structural and
/// contextual tiers never suspend; the threat-intel tier may await cache
/// or network I/O.
#[async_trait]
pub trait ScanTier: Send + Sync {
    /// Stable tier name, used in logs and scorer weight lookups.
    fn name(&self) -> &'static str;

    /// Scan one field. Never fails; an empty vec means "nothing found".
    async fn analyze(&self, text: &str, ctx: &ScanContext) -> Vec<Detection>;
}

/// Looks up a fingerprint against the threat-intel store.
///
/// Implemented by the threat-intel client; mocked in tier tests. A failed
/// lookup is an error here, and the tier above is responsible for
/// degrading it to "no detections".
#[async_trait]
pub trait ThreatLookup: Send + Sync {
    /// Check both hashes of a fingerprint. Cache-first; a negative result
    /// means neither hash is known.
    async fn check(&self, fp: &ThreatFingerprint) -> Result<ThreatCheckResult, ShieldError>;
}
