#![forbid(unsafe_code)]
//! vmerge-match: duplicate detection for vendor identities.
//!
//! Two passes over the canonical population: a deterministic pass on shared
//! verified identifiers, then normalized name similarity. Candidates are
//! enqueued for stewardship; nothing here merges or edits a vendor.
//!
//! # Conventions
//!
//! - **Errors**: store-facing entry points return `anyhow::Result` with context.
//! - **Logging**: `tracing` macros; per-pair scoring is logged at `debug`.

pub mod matcher;
pub mod normalize;
pub mod scan;
pub mod similarity;

pub use matcher::{
    DeterministicKeyStrategy, MatchContext, MatchOutcome, MatchStrategy, Matcher, Population,
    SimilarityStrategy,
};
pub use scan::{ScanReport, scan_all, scan_vendor};
