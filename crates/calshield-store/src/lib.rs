//! File-backed stores for the calshield engine.
//!
//! - [`QuarantineStore`]: TTL'd archive of the original field contents of
//!   blocked and redacted events, one JSON file per event.
//! - [`AuditLogger`]: append-only JSON-per-line log of every scan result,
//!   one file per day.
//!
//! Both stores are supplementary: every write failure is swallowed and
//! the scan result is unaffected.
pub mod audit;
pub mod quarantine;

pub use audit::{AuditLogger, AuditRecord};
pub use quarantine::{QuarantineEntry, QuarantineStore};
