//! Synchronous scanning components of the calshield pipeline.
//!
//! - [`StructuralTier`]: technical attack markers (invisible characters,
//!   encoded payloads, dangerous markup, URI schemes, homoglyphs,
//!   CSS-hidden content).
//! - [`ContextualTier`]: proximity-aware semantic patterns (instruction
//!   overrides, shell syntax, fake tool calls, role assumption, urgency).
//! - [`RiskScorer`]: detections → composite score → level → action.
//! - [`redactor`]: rewrites dangerous field content.
//!
//! All of this is pure CPU work; nothing here suspends.
mod budget;

pub mod contextual;
pub mod redactor;
pub mod scorer;
pub mod structural;

pub use contextual::ContextualTier;
pub use scorer::RiskScorer;
pub use structural::StructuralTier;
