//! Recovery sweep for merge events a crash left in flight.
//!
//! No phase can leave dependents half-repointed, so any in-flight event is
//! safe to either resume from its current state or roll back. Queue entries
//! left `approved` without a running event go back to `pending`.

use super::MergeOrchestrator;
use crate::error::Result;
use crate::lineage;
use crate::lock::{LockError, SweepLock};
use crate::model::merge::IN_FLIGHT_STATUSES;
use crate::model::{CandidateId, MergeId, now_us};
use crate::queue;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// What to do with each abandoned event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Drive the event on to `completed`.
    #[default]
    Resume,
    /// Move the event to `rolled_back` and release its locks.
    RollBack,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub examined: usize,
    pub completed: Vec<MergeId>,
    pub rolled_back: Vec<MergeId>,
    /// Events whose resume failed; each was rolled back by the orchestrator.
    pub failed: Vec<(MergeId, String)>,
    /// Approved queue entries returned to `pending`.
    pub released: Vec<CandidateId>,
}

/// Resume or roll back every in-flight event untouched for `older_than`,
/// then release orphaned approvals.
///
/// # Errors
///
/// Returns an error if the in-flight events cannot be listed. Per-event
/// failures are collected in the report.
pub fn sweep(
    conn: &Connection,
    orchestrator: &MergeOrchestrator,
    policy: RecoveryPolicy,
    older_than: Duration,
) -> Result<RecoveryReport> {
    let age = i64::try_from(older_than.as_micros()).unwrap_or(i64::MAX);
    let cutoff = now_us().saturating_sub(age);
    let abandoned = lineage::events_in_status(conn, &IN_FLIGHT_STATUSES, cutoff)?;

    let mut report = RecoveryReport {
        examined: abandoned.len(),
        ..RecoveryReport::default()
    };
    for event in abandoned {
        let merge_id = event.merge_id;
        tracing::info!(%merge_id, status = %event.status, ?policy, "recovering merge");
        let resumable = event.status != crate::model::merge::MergeStatus::Proposed;
        match (policy, resumable) {
            (RecoveryPolicy::Resume, true) => match orchestrator.run(conn, merge_id) {
                Ok(_) => report.completed.push(merge_id),
                Err(err) => report.failed.push((merge_id, err.to_string())),
            },
            _ => match orchestrator.roll_back(conn, merge_id, "recovery sweep") {
                Ok(_) => report.rolled_back.push(merge_id),
                Err(err) => report.failed.push((merge_id, err.to_string())),
            },
        }
    }

    report.released = queue::release_orphaned(conn, cutoff)?;

    if report.examined > 0 || !report.released.is_empty() {
        tracing::info!(
            examined = report.examined,
            completed = report.completed.len(),
            rolled_back = report.rolled_back.len(),
            failed = report.failed.len(),
            released = report.released.len(),
            "recovery sweep finished"
        );
    }
    Ok(report)
}

/// [`sweep`] under the store's advisory sweep lock.
///
/// # Errors
///
/// Returns an error if another sweeper holds the lock past `lock_timeout`,
/// or if the sweep itself fails.
pub fn sweep_store(
    store_path: &Path,
    conn: &Connection,
    orchestrator: &MergeOrchestrator,
    policy: RecoveryPolicy,
    older_than: Duration,
    lock_timeout: Duration,
) -> anyhow::Result<RecoveryReport> {
    let lock = SweepLock::acquire(store_path, lock_timeout).map_err(|err| match err {
        LockError::Timeout { .. } => anyhow::anyhow!("another recovery sweep is running: {err}"),
        LockError::IoError(_) => anyhow::anyhow!("acquire sweep lock: {err}"),
    })?;
    let report = sweep(conn, orchestrator, policy, older_than)?;
    lock.release();
    Ok(report)
}
