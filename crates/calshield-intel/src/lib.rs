//! Threat-intelligence subsystem.
//!
//! - [`fingerprint`]: two independent SHA-256 digests of a text (exact
//!   content and structural shape), neither reversible.
//! - [`ThreatIntelCache`]: bounded file-backed hash→result store with TTL.
//! - [`ThreatIntelClient`]: cache-first lookups, fire-and-forget reports,
//!   periodic feed syncs. Fully degrades to cache-only when the cloud is
//!   disabled or unreachable.
//! - [`ThreatIntelTier`]: the detection tier that turns a known
//!   fingerprint into a `THREAT-001` detection.
pub mod cache;
pub mod client;
pub mod fingerprint;
pub mod tier;

pub use cache::ThreatIntelCache;
pub use client::ThreatIntelClient;
pub use fingerprint::{content_hash, fingerprint, structural_hash};
pub use tier::ThreatIntelTier;
