//! vmerge-core library.
//!
//! Vendor identity store, canonical resolver, stewardship queue, and the
//! merge orchestrator that consolidates duplicate vendors without losing
//! history.
//!
//! # Conventions
//!
//! - **Errors**: engine operations return [`error::Result`] with a
//!   [`error::MergeError`]; file and config plumbing uses `anyhow::Result`.
//! - **Logging**: `tracing` macros; audit events go through [`audit::AuditSink`].
//! - **Mutations**: every merge entry point takes an explicit [`auth::AuthToken`].

#![forbid(unsafe_code)]

pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod lineage;
pub mod lock;
pub mod merge;
pub mod model;
pub mod queue;
pub mod resolver;
pub mod store;

pub use error::{ErrorCode, MergeError, Result};
pub use merge::{MergeOrchestrator, MergeOutcome, MergeRequest};
pub use model::{CandidateId, MergeId, VendorId};
