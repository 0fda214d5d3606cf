//! Stewardship queue: candidate pairs awaiting disposition.
//!
//! ```text
//! pending -> approved   (with the merge proposal; back to pending if it rolls back)
//! pending -> rejected   (idempotent)
//! pending -> expired    (untouched past the SLA window)
//! rejected | expired -> pending   (reopen, counted in reopen_count)
//! ```
//!
//! At most one open (`pending` or `approved`) entry exists per pair, enforced
//! by a partial unique index.

use crate::auth::AuthToken;
use crate::db;
use crate::error::{ConflictError, Result, ValidationError};
use crate::lineage;
use crate::merge::{MergeOrchestrator, MergeOutcome, MergeRequest};
use crate::model::candidate::{
    CANDIDATE_COLUMNS, CandidateStatus, MatchCandidate, MergeCandidate, ordered_pair,
};
use crate::model::merge::{FieldOverride, MergeMethod};
use crate::model::{CandidateId, MergeId, VendorId, now_us};
use rusqlite::{Connection, OptionalExtension as _, params};
use std::time::Duration;

/// Outcome of [`enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Inserted(MergeCandidate),
    /// An open entry already existed for the pair and was returned as is.
    Existing(MergeCandidate),
}

impl Enqueued {
    #[must_use]
    pub const fn candidate(&self) -> &MergeCandidate {
        match self {
            Self::Inserted(c) | Self::Existing(c) => c,
        }
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Reviewer choices for [`approve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApproveOptions {
    /// Defaults to `vendor_id_a`. Must be one of the pair.
    pub survivor: Option<VendorId>,
    /// Defaults from the match basis.
    pub method: Option<MergeMethod>,
    pub reason: Option<String>,
    pub overrides: Vec<FieldOverride>,
}

/// Query for [`list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFilter {
    pub status: Option<CandidateStatus>,
    /// Entries where this vendor is either side of the pair.
    pub vendor_id: Option<VendorId>,
    pub limit: Option<usize>,
}

fn invalid_transition(from: CandidateStatus, to: CandidateStatus) -> crate::error::MergeError {
    ValidationError::InvalidTransition {
        entity: "candidate",
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

/// Fetch a queue entry.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(conn: &Connection, candidate_id: CandidateId) -> Result<Option<MergeCandidate>> {
    let sql = format!("SELECT {CANDIDATE_COLUMNS} FROM vendor_merge_candidate WHERE candidate_id = ?1");
    Ok(conn
        .query_row(&sql, [candidate_id], MergeCandidate::from_row)
        .optional()?)
}

/// Fetch a queue entry, treating absence as a validation error.
///
/// # Errors
///
/// Returns [`ValidationError::CandidateNotFound`] if there is no such entry.
pub fn require(conn: &Connection, candidate_id: CandidateId) -> Result<MergeCandidate> {
    get(conn, candidate_id)?.ok_or_else(|| ValidationError::CandidateNotFound(candidate_id).into())
}

fn open_for_pair(
    conn: &Connection,
    a: VendorId,
    b: VendorId,
) -> Result<Option<MergeCandidate>> {
    let sql = format!(
        "SELECT {CANDIDATE_COLUMNS} FROM vendor_merge_candidate
         WHERE vendor_id_a = ?1 AND vendor_id_b = ?2 AND status IN ('pending', 'approved')"
    );
    Ok(conn
        .query_row(&sql, params![a, b], MergeCandidate::from_row)
        .optional()?)
}

/// Insert a matcher result, or return the open entry for the same pair.
///
/// # Errors
///
/// Returns a validation error for a self-pair, or a storage error.
pub fn enqueue(conn: &Connection, candidate: &MatchCandidate) -> Result<Enqueued> {
    let (a, b) = candidate.pair();
    if a == b {
        return Err(ValidationError::SelfMerge(a).into());
    }
    if a > b {
        return Err(ValidationError::InvalidInput(format!("pair {a}, {b} is not ordered")).into());
    }

    db::immediate(conn, |tx| {
        if let Some(existing) = open_for_pair(tx, a, b)? {
            return Ok(Enqueued::Existing(existing));
        }
        let now = now_us();
        tx.execute(
            "INSERT INTO vendor_merge_candidate (
                vendor_id_a, vendor_id_b, match_basis, confidence_score, auto_eligible,
                status, detected_at_us, updated_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![
                a,
                b,
                candidate.match_basis,
                candidate.confidence_score,
                candidate.auto_eligible,
                now,
            ],
        )?;
        let inserted = require(tx, CandidateId(tx.last_insert_rowid()))?;
        tracing::info!(
            candidate_id = %inserted.candidate_id,
            vendor_a = %a,
            vendor_b = %b,
            basis = %candidate.match_basis,
            score = candidate.confidence_score,
            auto_eligible = candidate.auto_eligible,
            "candidate enqueued"
        );
        Ok(Enqueued::Inserted(inserted))
    })
}

/// List queue entries, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(conn: &Connection, filter: &CandidateFilter) -> Result<Vec<MergeCandidate>> {
    let limit = filter
        .limit
        .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
    let sql = format!(
        "SELECT {CANDIDATE_COLUMNS} FROM vendor_merge_candidate
         WHERE (?1 IS NULL OR status = ?1)
           AND (?2 IS NULL OR vendor_id_a = ?2 OR vendor_id_b = ?2)
         ORDER BY candidate_id DESC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![filter.status, filter.vendor_id, limit],
        MergeCandidate::from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Approve a pending entry and run the merge synchronously.
///
/// The entry moves to `approved` in the same transaction that proposes the
/// merge, so it is never approved without an event the recovery sweep can see.
///
/// # Errors
///
/// Returns `Unauthorized` before anything changes, `MergeInProgress` if the
/// entry is already approved and its merge is still running,
/// `InvalidTransition` for any other non-pending entry, `SurvivorNotInPair`
/// for a foreign survivor, or the merge error. A merge that rolls back
/// returns the entry to `pending`.
pub fn approve(
    conn: &Connection,
    orchestrator: &MergeOrchestrator,
    token: &AuthToken,
    candidate_id: CandidateId,
    options: &ApproveOptions,
) -> Result<MergeOutcome> {
    orchestrator.authorize(token)?;

    let candidate = require(conn, candidate_id)?;
    ensure_claimable(conn, &candidate)?;
    if let Some(survivor) = options.survivor {
        if survivor != candidate.vendor_id_a && survivor != candidate.vendor_id_b {
            return Err(ValidationError::SurvivorNotInPair {
                candidate_id,
                survivor,
            }
            .into());
        }
    }

    let survivor = options.survivor.unwrap_or(candidate.vendor_id_a);
    let absorbed = if survivor == candidate.vendor_id_a {
        candidate.vendor_id_b
    } else {
        candidate.vendor_id_a
    };
    let request = MergeRequest {
        survivor,
        absorbed,
        reason: options
            .reason
            .clone()
            .unwrap_or_else(|| format!("approved candidate {candidate_id}")),
        method: options
            .method
            .unwrap_or_else(|| MergeMethod::from(candidate.match_basis)),
        confidence_score: Some(candidate.confidence_score),
        originating_candidate_id: Some(candidate_id),
        overrides: options.overrides.clone(),
    };

    tracing::info!(%candidate_id, %survivor, %absorbed, actor = %token.actor, "approving candidate");
    orchestrator.execute_direct(conn, token, &request)
}

/// Refuse entries that cannot move to `approved`.
fn ensure_claimable(conn: &Connection, candidate: &MergeCandidate) -> Result<()> {
    match candidate.status {
        CandidateStatus::Pending => Ok(()),
        CandidateStatus::Approved if candidate.merge_id.is_none() => {
            match lineage::open_event_for_candidate(conn, candidate.candidate_id)? {
                Some(merge_id) => Err(ConflictError::MergeInProgress {
                    vendor_id: candidate.vendor_id_a,
                    merge_id,
                }
                .into()),
                None => Err(invalid_transition(candidate.status, CandidateStatus::Approved)),
            }
        }
        other => Err(invalid_transition(other, CandidateStatus::Approved)),
    }
}

/// Mark the originating entry of a merge being proposed in `conn`'s
/// transaction as `approved`.
pub(crate) fn claim(
    conn: &Connection,
    candidate_id: CandidateId,
    pair: (VendorId, VendorId),
    actor: &str,
    note: &str,
) -> Result<()> {
    let candidate = require(conn, candidate_id)?;
    ensure_claimable(conn, &candidate)?;
    if ordered_pair(pair.0, pair.1) != (candidate.vendor_id_a, candidate.vendor_id_b) {
        return Err(ValidationError::InvalidInput(format!(
            "merge of {} and {} does not match candidate {candidate_id}",
            pair.0, pair.1
        ))
        .into());
    }
    let now = now_us();
    conn.execute(
        "UPDATE vendor_merge_candidate
         SET status = 'approved', decided_by = ?2, decided_at_us = ?3, updated_at_us = ?3,
             decision_note = ?4
         WHERE candidate_id = ?1 AND status = 'pending'",
        params![candidate_id, actor, now, note],
    )?;
    tracing::info!(%candidate_id, actor, "candidate approved");
    Ok(())
}

/// Reject an entry. Rejecting a rejected entry returns it unchanged.
///
/// # Errors
///
/// Returns `InvalidTransition` unless the entry is pending or rejected.
pub fn reject(
    conn: &Connection,
    candidate_id: CandidateId,
    actor: &str,
    reason: Option<&str>,
) -> Result<MergeCandidate> {
    db::immediate(conn, |tx| {
        let candidate = require(tx, candidate_id)?;
        match candidate.status {
            CandidateStatus::Rejected => return Ok(candidate),
            CandidateStatus::Pending => {}
            other => return Err(invalid_transition(other, CandidateStatus::Rejected)),
        }
        let now = now_us();
        tx.execute(
            "UPDATE vendor_merge_candidate
             SET status = 'rejected', decided_by = ?2, decided_at_us = ?3, updated_at_us = ?3,
                 decision_note = ?4
             WHERE candidate_id = ?1",
            params![candidate_id, actor, now, reason],
        )?;
        tracing::info!(%candidate_id, actor, "candidate rejected");
        require(tx, candidate_id)
    })
}

/// Return a rejected or expired entry to `pending`.
///
/// # Errors
///
/// Returns `InvalidTransition` from any other status, or
/// `DuplicateCandidate` if the pair was re-detected in the meantime.
pub fn reopen(conn: &Connection, candidate_id: CandidateId, actor: &str) -> Result<MergeCandidate> {
    db::immediate(conn, |tx| {
        let candidate = require(tx, candidate_id)?;
        if !matches!(
            candidate.status,
            CandidateStatus::Rejected | CandidateStatus::Expired
        ) {
            return Err(invalid_transition(candidate.status, CandidateStatus::Pending));
        }
        if let Some(existing) = open_for_pair(tx, candidate.vendor_id_a, candidate.vendor_id_b)? {
            return Err(ConflictError::DuplicateCandidate {
                existing: existing.candidate_id,
            }
            .into());
        }
        tx.execute(
            "UPDATE vendor_merge_candidate
             SET status = 'pending', decided_by = ?2, decided_at_us = NULL, decision_note = NULL,
                 reopen_count = reopen_count + 1, updated_at_us = ?3
             WHERE candidate_id = ?1",
            params![candidate_id, actor, now_us()],
        )?;
        tracing::info!(%candidate_id, actor, "candidate reopened");
        require(tx, candidate_id)
    })
}

/// Expire pending entries untouched for longer than `sla`.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn expire_stale(conn: &Connection, now_us: i64, sla: Duration) -> Result<Vec<CandidateId>> {
    let window = i64::try_from(sla.as_micros()).unwrap_or(i64::MAX);
    let cutoff = now_us.saturating_sub(window);
    db::immediate(conn, |tx| {
        let mut stmt = tx.prepare(
            "UPDATE vendor_merge_candidate
             SET status = 'expired', updated_at_us = ?2, decision_note = 'expired past SLA'
             WHERE status = 'pending' AND updated_at_us < ?1
             RETURNING candidate_id",
        )?;
        let rows = stmt.query_map(params![cutoff, now_us], |row| row.get(0))?;
        let mut expired = rows.collect::<rusqlite::Result<Vec<CandidateId>>>()?;
        expired.sort_unstable();
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "candidates expired");
        }
        Ok(expired)
    })
}

/// Return an approved entry whose merge did not complete to `pending`.
pub(crate) fn release_candidate(conn: &Connection, candidate_id: CandidateId) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE vendor_merge_candidate
         SET status = 'pending', updated_at_us = ?2
         WHERE candidate_id = ?1 AND status = 'approved' AND merge_id IS NULL",
        params![candidate_id, now_us()],
    )?;
    Ok(changed == 1)
}

/// Close out the originating entry of a completed merge.
pub(crate) fn consume(conn: &Connection, candidate_id: CandidateId, merge_id: MergeId) -> Result<()> {
    conn.execute(
        "UPDATE vendor_merge_candidate
         SET status = 'approved', merge_id = ?2, updated_at_us = ?3
         WHERE candidate_id = ?1 AND status IN ('pending', 'approved') AND merge_id IS NULL",
        params![candidate_id, merge_id, now_us()],
    )?;
    Ok(())
}

/// Expire pending entries naming a vendor that `merge_id` just absorbed.
pub(crate) fn supersede_pairs_of(
    conn: &Connection,
    absorbed: VendorId,
    merge_id: MergeId,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE vendor_merge_candidate
         SET status = 'expired', updated_at_us = ?3, decision_note = 'superseded by ' || ?2
         WHERE status = 'pending' AND (vendor_id_a = ?1 OR vendor_id_b = ?1)",
        params![absorbed, merge_id.to_string(), now_us()],
    )?)
}

/// Close an entry whose pair can no longer merge.
pub(crate) fn retire(conn: &Connection, candidate_id: CandidateId, note: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE vendor_merge_candidate
         SET status = 'expired', updated_at_us = ?2, decision_note = ?3
         WHERE candidate_id = ?1 AND status IN ('pending', 'approved') AND merge_id IS NULL",
        params![candidate_id, now_us(), note],
    )?;
    Ok(changed == 1)
}

/// Return `approved` entries that have no merge event still running to
/// `pending`. Only entries untouched since `updated_before_us` are considered.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn release_orphaned(conn: &Connection, updated_before_us: i64) -> Result<Vec<CandidateId>> {
    db::immediate(conn, |tx| {
        let mut stmt = tx.prepare(
            "UPDATE vendor_merge_candidate
             SET status = 'pending', updated_at_us = ?2
             WHERE status = 'approved' AND merge_id IS NULL AND updated_at_us <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM vendor_merge_event e
                   WHERE e.originating_candidate_id = vendor_merge_candidate.candidate_id
                     AND e.status NOT IN ('completed', 'rolled_back', 'cancelled'))
             RETURNING candidate_id",
        )?;
        let rows = stmt.query_map(params![updated_before_us, now_us()], |row| row.get(0))?;
        let mut released = rows.collect::<rusqlite::Result<Vec<CandidateId>>>()?;
        released.sort_unstable();
        if !released.is_empty() {
            tracing::warn!(count = released.len(), "orphaned approvals returned to pending");
        }
        Ok(released)
    })
}
