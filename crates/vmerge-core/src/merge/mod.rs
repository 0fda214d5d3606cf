//! Merge orchestrator: the state machine that consolidates an absorbed vendor
//! into its survivor.
//!
//! Each phase runs in its own `BEGIN IMMEDIATE` transaction so a crash leaves
//! the event in a resumable state:
//!
//! 1. `proposed -> validated` (locks taken)
//! 2. `validated -> snapshot_captured`
//! 3. `snapshot_captured -> survivorship_resolved`
//! 4. `survivorship_resolved -> repointed -> completed`
//!
//! Only phase 4 touches vendor, key and dependent rows, and it is a single
//! transaction. A failure there is rolled back and the event is marked
//! `repoint_failed -> rolled_back` in a separate transaction.

pub mod locks;
pub mod recovery;
pub mod repoint;
pub mod survivorship;

use crate::audit::{AuditBuffer, AuditEvent, AuditSink, TracingAuditSink, TransitionEvent};
use crate::auth::{AuthToken, Authorizer, StaticAuthorizer};
use crate::config::EngineConfig;
use crate::db;
use crate::error::{ConflictError, MergeError, Result, ValidationError};
use crate::lineage::{self, NewEvent};
use crate::model::merge::{
    FieldOverride, MemberRole, MergeEvent, MergeMember, MergeMethod, MergeSnapshot, MergeStatus,
    SnapshotRecord, SurvivorshipDecision,
};
use crate::model::vendor::VendorKey;
use crate::model::{CandidateId, MergeId, VendorId, now_us};
use crate::{queue, store};
use rand::Rng as _;
use repoint::RepointReport;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use survivorship::SurvivorshipPolicy;
use tracing::instrument;

/// A request to merge `absorbed` into `survivor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub survivor: VendorId,
    pub absorbed: VendorId,
    pub reason: String,
    pub method: MergeMethod,
    pub confidence_score: Option<f64>,
    pub originating_candidate_id: Option<CandidateId>,
    #[serde(default)]
    pub overrides: Vec<FieldOverride>,
}

impl MergeRequest {
    /// Admin-initiated merge outside the queue.
    pub fn manual(survivor: VendorId, absorbed: VendorId, reason: impl Into<String>) -> Self {
        Self {
            survivor,
            absorbed,
            reason: reason.into(),
            method: MergeMethod::Manual,
            confidence_score: None,
            originating_candidate_id: None,
            overrides: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Vec<FieldOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.survivor == self.absorbed {
            return Err(ValidationError::SelfMerge(self.survivor).into());
        }
        if self.reason.trim().is_empty() {
            return Err(ValidationError::InvalidInput("merge reason must not be blank".into()).into());
        }
        if let Some(score) = self.confidence_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(ValidationError::InvalidInput(format!(
                    "confidence score {score} is outside [0, 1]"
                ))
                .into());
            }
        }
        survivorship::validate_overrides(&self.overrides)
    }
}

/// Result of a completed merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub merge_id: MergeId,
    pub survivor: VendorId,
    pub absorbed: VendorId,
    pub status: MergeStatus,
    pub snapshot_ids: Vec<i64>,
    pub decisions: Vec<SurvivorshipDecision>,
    pub repoint: RepointReport,
    pub completed_at_us: Option<i64>,
}

enum Proposal {
    Validated(MergeId),
    Refused(ConflictError),
}

/// Drives merge events through the state machine.
pub struct MergeOrchestrator {
    config: EngineConfig,
    policy: SurvivorshipPolicy,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for MergeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOrchestrator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl MergeOrchestrator {
    pub fn new(
        config: EngineConfig,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let policy = SurvivorshipPolicy::from(&config.survivorship);
        Self {
            config,
            policy,
            authorizer,
            audit,
        }
    }

    /// Orchestrator with the allow-list authorizer from `[authorization]`
    /// and audit events written to `tracing`.
    #[must_use]
    pub fn from_config(config: EngineConfig) -> Self {
        let authorizer = StaticAuthorizer::new(config.authorization.merge_actors.clone());
        Self::new(config, Arc::new(authorizer), Arc::new(TracingAuditSink))
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn policy(&self) -> &SurvivorshipPolicy {
        &self.policy
    }

    /// Authorize the caller of a mutating entry point.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::Unauthorized`] if the actor may not merge.
    pub fn authorize(&self, token: &AuthToken) -> Result<()> {
        self.authorizer.authorize_merge(token)
    }

    /// Admin-forced merge through the full state machine.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing phase. After validation, any
    /// failure has already been rolled back when this returns.
    pub fn execute_direct(
        &self,
        conn: &Connection,
        token: &AuthToken,
        request: &MergeRequest,
    ) -> Result<MergeOutcome> {
        let merge_id = self.propose(conn, token, request)?;
        self.run(conn, merge_id)
    }

    /// Create an event, take the vendor locks, and stop at `validated`.
    ///
    /// A vendor that is already merged or locked by another merge moves the
    /// event to `validation_failed -> rolled_back` and returns the conflict.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` or a validation error before anything is
    /// written, or the conflict that failed validation.
    #[instrument(skip_all, fields(survivor = %request.survivor, absorbed = %request.absorbed))]
    pub fn propose(
        &self,
        conn: &Connection,
        token: &AuthToken,
        request: &MergeRequest,
    ) -> Result<MergeId> {
        self.authorize(token)?;
        request.validate()?;

        let (proposal, audit) = self.with_retry("propose", || {
            db::immediate(conn, |tx| Self::propose_in(tx, &token.actor, request))
        })?;
        audit.flush(self.audit.as_ref());

        match proposal {
            Proposal::Validated(merge_id) => Ok(merge_id),
            Proposal::Refused(conflict) => Err(conflict.into()),
        }
    }

    fn propose_in(
        tx: &Connection,
        actor: &str,
        request: &MergeRequest,
    ) -> Result<(Proposal, AuditBuffer)> {
        let survivor = store::require_vendor(tx, request.survivor)?;
        let absorbed = store::require_vendor(tx, request.absorbed)?;
        if let Some(candidate_id) = request.originating_candidate_id {
            queue::claim(
                tx,
                candidate_id,
                (request.survivor, request.absorbed),
                actor,
                &request.reason,
            )?;
        }

        let merge_id = lineage::insert_event(
            tx,
            &NewEvent {
                survivor: request.survivor,
                absorbed: request.absorbed,
                reason: &request.reason,
                method: request.method,
                confidence_score: request.confidence_score,
                originating_candidate_id: request.originating_candidate_id,
                actor,
                overrides: &request.overrides,
            },
        )?;
        let event = lineage::require_event(tx, merge_id)?;
        let mut audit = AuditBuffer::default();
        audit.transition(transition_audit(&event, MergeStatus::Proposed, None));

        let mut participants = [&survivor, &absorbed];
        participants.sort_by_key(|v| v.vendor_id);
        let already_merged = participants.iter().find_map(|v| {
            v.merged_into_vendor_id
                .map(|merged_into| ConflictError::VendorAlreadyMerged {
                    vendor_id: v.vendor_id,
                    merged_into,
                })
        });
        let conflict = match already_merged {
            Some(conflict) => Some(conflict),
            None => locks::first_conflict(tx, merge_id, [survivor.vendor_id, absorbed.vendor_id])?,
        };

        if let Some(conflict) = conflict {
            let reason = conflict.to_string();
            tracing::warn!(%merge_id, %reason, "merge validation failed");
            lineage::transition(
                tx,
                merge_id,
                MergeStatus::Proposed,
                MergeStatus::ValidationFailed,
                Some(&reason),
            )?;
            lineage::transition(
                tx,
                merge_id,
                MergeStatus::ValidationFailed,
                MergeStatus::RolledBack,
                None,
            )?;
            if let Some(candidate_id) = request.originating_candidate_id {
                if let ConflictError::VendorAlreadyMerged { merged_into, .. } = &conflict {
                    queue::retire(tx, candidate_id, &format!("superseded: {reason}"))?;
                    tracing::info!(%candidate_id, %merged_into, "candidate superseded");
                } else {
                    queue::release_candidate(tx, candidate_id)?;
                }
            }
            audit.transition(transition_audit(
                &event,
                MergeStatus::ValidationFailed,
                Some(reason),
            ));
            audit.transition(transition_audit(&event, MergeStatus::RolledBack, None));
            return Ok((Proposal::Refused(conflict), audit));
        }

        locks::acquire(tx, merge_id, [survivor.vendor_id, absorbed.vendor_id])?;
        lineage::transition(
            tx,
            merge_id,
            MergeStatus::Proposed,
            MergeStatus::Validated,
            None,
        )?;
        audit.transition(transition_audit(&event, MergeStatus::Validated, None));
        Ok((Proposal::Validated(merge_id), audit))
    }

    /// Continue an event from `validated`, `snapshot_captured` or
    /// `survivorship_resolved` through to `completed`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for events in any other status, or when
    /// another runner advanced the event first; that event is left to its
    /// runner. Other phase failures are rolled back and returned with the
    /// merge id, both vendor ids and the failing state.
    #[instrument(skip(self, conn))]
    pub fn run(&self, conn: &Connection, merge_id: MergeId) -> Result<MergeOutcome> {
        let mut event = lineage::require_event(conn, merge_id)?;
        loop {
            let step = match event.status {
                MergeStatus::Validated => self.with_retry("snapshot", || {
                    db::immediate(conn, |tx| capture_in(tx, merge_id))
                }),
                MergeStatus::SnapshotCaptured => self.with_retry("survivorship", || {
                    db::immediate(conn, |tx| self.decide_in(tx, merge_id))
                }),
                MergeStatus::SurvivorshipResolved => return self.finish(conn, &event),
                other => {
                    return Err(ValidationError::InvalidTransition {
                        entity: "merge event",
                        from: other.to_string(),
                        to: MergeStatus::Completed.to_string(),
                    }
                    .into());
                }
            };

            match step {
                Ok((next, audit)) => {
                    audit.flush(self.audit.as_ref());
                    event = next;
                }
                Err(err) if is_lost_race(&err) => {
                    tracing::warn!(%merge_id, error = %err, "merge advanced by another runner");
                    return Err(err);
                }
                Err(err) => return Err(self.abort(conn, &event, err)),
            }
        }
    }

    fn decide_in(&self, tx: &Connection, merge_id: MergeId) -> Result<(MergeEvent, AuditBuffer)> {
        let event = lineage::require_event(tx, merge_id)?;
        expect_status(
            &event,
            MergeStatus::SnapshotCaptured,
            MergeStatus::SurvivorshipResolved,
        )?;
        let snapshots = lineage::snapshots(tx, merge_id)?;
        let (survivor, absorbed) = snapshot_pair(&event, &snapshots)?;

        let decisions = survivorship::resolve(
            &self.policy,
            &survivor.record.vendor,
            &absorbed.record.vendor,
            &event.overrides,
        );
        for decision in &decisions {
            lineage::write_decision(tx, merge_id, decision)?;
        }

        lineage::transition(
            tx,
            merge_id,
            MergeStatus::SnapshotCaptured,
            MergeStatus::SurvivorshipResolved,
            None,
        )?;
        let mut audit = AuditBuffer::default();
        let mut note = transition_audit(
            &event,
            MergeStatus::SurvivorshipResolved,
            Some(format!("{} decisions", decisions.len())),
        );
        note.snapshot_ids = vec![survivor.snapshot_id, absorbed.snapshot_id];
        audit.transition(note);
        Ok((lineage::require_event(tx, merge_id)?, audit))
    }

    fn finish(&self, conn: &Connection, event: &MergeEvent) -> Result<MergeOutcome> {
        let merge_id = event.merge_id;
        let applied = self.with_retry("repoint", || {
            db::immediate(conn, |tx| self.apply_in(tx, merge_id))
        });
        match applied {
            Ok((outcome, audit)) => {
                audit.flush(self.audit.as_ref());
                tracing::info!(
                    %merge_id,
                    survivor = %outcome.survivor,
                    absorbed = %outcome.absorbed,
                    keys = outcome.repoint.keys,
                    dependent_rows = outcome.repoint.dependent_rows(),
                    "merge completed"
                );
                Ok(outcome)
            }
            Err(err) if is_lost_race(&err) => {
                tracing::warn!(%merge_id, error = %err, "merge advanced by another runner");
                Err(err)
            }
            Err(err) => Err(self.abort(conn, event, err)),
        }
    }

    fn apply_in(&self, tx: &Connection, merge_id: MergeId) -> Result<(MergeOutcome, AuditBuffer)> {
        let event = lineage::require_event(tx, merge_id)?;
        expect_status(&event, MergeStatus::SurvivorshipResolved, MergeStatus::Repointed)?;

        let dependents = &self.config.repoint.dependents;
        repoint::check_configuration(tx, dependents, Some(merge_id))?;

        let snapshots = lineage::snapshots(tx, merge_id)?;
        let (survivor_snapshot, absorbed_snapshot) = snapshot_pair(&event, &snapshots)?;
        let survivor = store::require_vendor(tx, event.survivor_vendor_id)?;
        let absorbed = store::require_vendor(tx, event.absorbed_vendor_id)?;
        for (current, snapshot) in [(&survivor, survivor_snapshot), (&absorbed, absorbed_snapshot)] {
            if !current.is_canonical()
                || current.updated_at_us != snapshot.record.vendor.updated_at_us
            {
                return Err(failed(
                    &event,
                    format!("stale snapshot: {} changed after capture", current.vendor_id),
                ));
            }
        }

        let decisions = lineage::decisions(tx, merge_id)?;
        let resolved = survivorship::apply(&survivor, &decisions)?;
        if resolved != survivor {
            store::write_fields(tx, &resolved)?;
        }

        let now = now_us();
        let pointer_set = tx.execute(
            "UPDATE vendor
             SET merged_into_vendor_id = ?2, merged_at_us = ?3, merged_by = ?4,
                 merge_reason = ?5, updated_at_us = ?6
             WHERE vendor_id = ?1 AND merged_into_vendor_id IS NULL",
            params![
                absorbed.vendor_id,
                survivor.vendor_id,
                now,
                event.actor,
                event.merge_reason,
                store::next_version(absorbed.updated_at_us),
            ],
        )?;
        if pointer_set != 1 {
            return Err(failed(
                &event,
                format!("{} is no longer canonical", absorbed.vendor_id),
            ));
        }

        let repoint = RepointReport {
            keys: repoint::repoint_keys(tx, absorbed.vendor_id, survivor.vendor_id)?,
            claims: repoint::repoint_claims(tx, absorbed.vendor_id, survivor.vendor_id)?,
            dependents: repoint::repoint_dependents(
                tx,
                dependents,
                self.config.repoint.chunk_size,
                absorbed.vendor_id,
                survivor.vendor_id,
            )?,
        };
        lineage::transition(
            tx,
            merge_id,
            MergeStatus::SurvivorshipResolved,
            MergeStatus::Repointed,
            None,
        )?;

        if let Some(candidate_id) = event.originating_candidate_id {
            queue::consume(tx, candidate_id, merge_id)?;
        }
        queue::supersede_pairs_of(tx, absorbed.vendor_id, merge_id)?;
        lineage::transition(
            tx,
            merge_id,
            MergeStatus::Repointed,
            MergeStatus::Completed,
            None,
        )?;
        locks::release(tx, merge_id)?;

        let snapshot_ids = vec![survivor_snapshot.snapshot_id, absorbed_snapshot.snapshot_id];
        let mut audit = AuditBuffer::default();
        for (action, detail) in [
            (
                MergeStatus::Repointed,
                Some(format!(
                    "{} keys, {} claims, {} dependent rows",
                    repoint.keys,
                    repoint.claims,
                    repoint.dependent_rows()
                )),
            ),
            (MergeStatus::Completed, None),
        ] {
            let mut note = transition_audit(&event, action, detail);
            note.snapshot_ids.clone_from(&snapshot_ids);
            audit.transition(note);
        }
        audit.push(AuditEvent::CanonicalIdentityChanged {
            merge_id,
            survivor: survivor.vendor_id,
            absorbed: absorbed.vendor_id,
            at_us: now_us(),
        });

        let completed = lineage::require_event(tx, merge_id)?;
        Ok((
            MergeOutcome {
                merge_id,
                survivor: survivor.vendor_id,
                absorbed: absorbed.vendor_id,
                status: completed.status,
                snapshot_ids,
                decisions,
                repoint,
                completed_at_us: completed.completed_at_us,
            },
            audit,
        ))
    }

    /// Roll back a failed phase and attach merge context to its error.
    fn abort(&self, conn: &Connection, event: &MergeEvent, err: MergeError) -> MergeError {
        let reason = err.to_string();
        let rolled = self.with_retry("rollback", || {
            db::immediate(conn, |tx| roll_back_in(tx, event.merge_id, &reason))
        });
        match rolled {
            Ok((_, audit)) => {
                audit.flush(self.audit.as_ref());
                tracing::warn!(merge_id = %event.merge_id, state = %event.status, %reason, "merge rolled back");
            }
            Err(rollback_err) => {
                tracing::warn!(
                    merge_id = %event.merge_id,
                    error = %rollback_err,
                    "could not record rollback; event left for the recovery sweep"
                );
            }
        }
        with_context(err, event)
    }

    /// Roll back a non-terminal event and release its locks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the event is already terminal.
    pub fn roll_back(&self, conn: &Connection, merge_id: MergeId, reason: &str) -> Result<MergeEvent> {
        let (event, audit) = self.with_retry("rollback", || {
            db::immediate(conn, |tx| roll_back_in(tx, merge_id, reason))
        })?;
        audit.flush(self.audit.as_ref());
        tracing::warn!(%merge_id, reason, "merge rolled back");
        Ok(event)
    }

    /// Cancel an event that has not reached `snapshot_captured`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` once snapshots have been taken.
    pub fn cancel(&self, conn: &Connection, merge_id: MergeId, actor: &str) -> Result<MergeEvent> {
        let (event, audit) = self.with_retry("cancel", || {
            db::immediate(conn, |tx| {
                let event = lineage::require_event(tx, merge_id)?;
                if !event.status.can_cancel() {
                    return Err(ValidationError::InvalidTransition {
                        entity: "merge event",
                        from: event.status.to_string(),
                        to: MergeStatus::Cancelled.to_string(),
                    }
                    .into());
                }
                lineage::transition(tx, merge_id, event.status, MergeStatus::Cancelled, None)?;
                locks::release(tx, merge_id)?;
                if let Some(candidate_id) = event.originating_candidate_id {
                    queue::release_candidate(tx, candidate_id)?;
                }
                let mut note = transition_audit(&event, MergeStatus::Cancelled, None);
                note.actor = actor.to_string();
                let mut audit = AuditBuffer::default();
                audit.transition(note);
                Ok((lineage::require_event(tx, merge_id)?, audit))
            })
        })?;
        audit.flush(self.audit.as_ref());
        tracing::info!(%merge_id, actor, "merge cancelled");
        Ok(event)
    }

    /// Re-run survivorship over a merge's stored snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if the event or its snapshots cannot be read.
    pub fn replay_survivorship(
        &self,
        conn: &Connection,
        merge_id: MergeId,
    ) -> Result<Vec<SurvivorshipDecision>> {
        let event = lineage::require_event(conn, merge_id)?;
        let snapshots = lineage::snapshots(conn, merge_id)?;
        let (survivor, absorbed) = snapshot_pair(&event, &snapshots)?;
        Ok(survivorship::resolve(
            &self.policy,
            &survivor.record.vendor,
            &absorbed.record.vendor,
            &event.overrides,
        ))
    }

    fn with_retry<T>(&self, phase: &'static str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let max_attempts = self.config.orchestrator.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        tracing::warn!(phase, attempts = attempt, "store still contended, giving up");
                        return Err(ConflictError::LockContention { attempts: attempt }.into());
                    }
                    let delay = backoff(self.config.orchestrator.backoff_base_ms, attempt);
                    tracing::debug!(phase, attempt, ?delay, "store busy, backing off");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

/// Exponential backoff with up to one base interval of random jitter.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base_ms.saturating_mul(1_u64 << exponent);
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base_ms)
    };
    Duration::from_millis(delay.saturating_add(jitter))
}

/// Refuse a phase whose starting status another runner already moved past.
fn expect_status(event: &MergeEvent, expected: MergeStatus, to: MergeStatus) -> Result<()> {
    if event.status == expected {
        return Ok(());
    }
    Err(ValidationError::InvalidTransition {
        entity: "merge event",
        from: event.status.to_string(),
        to: to.to_string(),
    }
    .into())
}

/// Phases only raise `InvalidTransition` when the stored status moved under them.
const fn is_lost_race(err: &MergeError) -> bool {
    matches!(
        err,
        MergeError::Validation(ValidationError::InvalidTransition { .. })
    )
}

fn capture_in(tx: &Connection, merge_id: MergeId) -> Result<(MergeEvent, AuditBuffer)> {
    let event = lineage::require_event(tx, merge_id)?;
    expect_status(&event, MergeStatus::Validated, MergeStatus::SnapshotCaptured)?;
    let mut snapshot_ids = Vec::with_capacity(2);
    for (vendor_id, role) in [
        (event.survivor_vendor_id, MemberRole::Survivor),
        (event.absorbed_vendor_id, MemberRole::Absorbed),
    ] {
        let vendor = store::require_vendor(tx, vendor_id)?;
        let keys = store::keys_for(tx, vendor_id)?;
        let claims = store::claims_for(tx, vendor_id)?;
        lineage::write_member(
            tx,
            &MergeMember {
                merge_id,
                vendor_id,
                role,
                pre_merge_keys: keys.iter().map(VendorKey::key_ref).collect(),
            },
        )?;
        let snapshot =
            lineage::write_snapshot(tx, merge_id, role, SnapshotRecord { vendor, keys, claims })?;
        snapshot_ids.push(snapshot.snapshot_id);
    }

    lineage::transition(
        tx,
        merge_id,
        MergeStatus::Validated,
        MergeStatus::SnapshotCaptured,
        None,
    )?;
    let mut audit = AuditBuffer::default();
    let mut note = transition_audit(&event, MergeStatus::SnapshotCaptured, None);
    note.snapshot_ids = snapshot_ids;
    audit.transition(note);
    Ok((lineage::require_event(tx, merge_id)?, audit))
}

fn roll_back_in(tx: &Connection, merge_id: MergeId, reason: &str) -> Result<(MergeEvent, AuditBuffer)> {
    let event = lineage::require_event(tx, merge_id)?;
    let path: &[MergeStatus] = match event.status {
        MergeStatus::Proposed => &[MergeStatus::ValidationFailed, MergeStatus::RolledBack],
        MergeStatus::Validated | MergeStatus::ValidationFailed | MergeStatus::RepointFailed => {
            &[MergeStatus::RolledBack]
        }
        MergeStatus::SnapshotCaptured
        | MergeStatus::SurvivorshipResolved
        | MergeStatus::Repointed => &[MergeStatus::RepointFailed, MergeStatus::RolledBack],
        MergeStatus::Completed | MergeStatus::RolledBack | MergeStatus::Cancelled => {
            return Err(ValidationError::InvalidTransition {
                entity: "merge event",
                from: event.status.to_string(),
                to: MergeStatus::RolledBack.to_string(),
            }
            .into());
        }
    };

    let mut audit = AuditBuffer::default();
    let mut from = event.status;
    for &to in path {
        lineage::transition(tx, merge_id, from, to, Some(reason))?;
        let detail = (to != MergeStatus::RolledBack).then(|| reason.to_string());
        audit.transition(transition_audit(&event, to, detail));
        from = to;
    }
    locks::release(tx, merge_id)?;
    if let Some(candidate_id) = event.originating_candidate_id {
        queue::release_candidate(tx, candidate_id)?;
    }
    Ok((lineage::require_event(tx, merge_id)?, audit))
}

fn transition_audit(
    event: &MergeEvent,
    action: MergeStatus,
    detail: Option<String>,
) -> TransitionEvent {
    TransitionEvent {
        detail,
        ..AuditEvent::transition(
            action,
            Some(event.merge_id),
            &event.actor,
            event.survivor_vendor_id,
            event.absorbed_vendor_id,
        )
    }
}

fn snapshot_pair<'s>(
    event: &MergeEvent,
    snapshots: &'s [MergeSnapshot],
) -> Result<(&'s MergeSnapshot, &'s MergeSnapshot)> {
    let find = |vendor_id: VendorId| snapshots.iter().find(|s| s.vendor_id == vendor_id);
    match (find(event.survivor_vendor_id), find(event.absorbed_vendor_id)) {
        (Some(survivor), Some(absorbed)) => Ok((survivor, absorbed)),
        _ => Err(failed(event, "snapshot missing for a participant".into())),
    }
}

fn failed(event: &MergeEvent, reason: String) -> MergeError {
    MergeError::RepointFailed {
        merge_id: event.merge_id,
        survivor: event.survivor_vendor_id,
        absorbed: event.absorbed_vendor_id,
        state: event.status,
        reason,
    }
}

fn with_context(err: MergeError, event: &MergeEvent) -> MergeError {
    match err {
        MergeError::RepointConfigurationGap { table, column, .. } => {
            MergeError::RepointConfigurationGap {
                merge_id: Some(event.merge_id),
                table,
                column,
            }
        }
        err @ (MergeError::Storage(_)
        | MergeError::Serialization(_)
        | MergeError::Validation(_)) => failed(event, err.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::db::open_in_memory;
    use crate::error::ErrorCode;
    use crate::model::vendor::{KeyRef, NewKey, NewVendor, VerificationStatus};

    fn orchestrator(sink: Arc<MemoryAuditSink>) -> MergeOrchestrator {
        let mut config = EngineConfig::default();
        config.survivorship.source_priority = vec!["peoplesoft".into(), "zycus".into()];
        MergeOrchestrator::new(config, Arc::new(StaticAuthorizer::new(["steward"])), sink)
    }

    fn vendor(conn: &Connection, name: &str, source: &str) -> VendorId {
        store::insert_vendor(
            conn,
            &NewVendor {
                legal_name: name.into(),
                source_system: source.into(),
                owner_org_id: Some("org-7".into()),
                ..NewVendor::default()
            },
        )
        .expect("vendor")
        .vendor_id
    }

    fn key(conn: &Connection, vendor_id: VendorId, system: &str, value: &str) {
        store::register_key(
            conn,
            vendor_id,
            &NewKey {
                key: KeyRef::new(system, value),
                is_primary_source: true,
                verification_status: VerificationStatus::Verified,
            },
        )
        .expect("key");
    }

    #[test]
    fn direct_merge_walks_every_state() {
        let conn = open_in_memory().expect("store");
        let sink = Arc::new(MemoryAuditSink::new());
        let engine = orchestrator(Arc::clone(&sink));
        let a = vendor(&conn, "Acme Corporation", "peoplesoft");
        let b = vendor(&conn, "ACME Corp", "zycus");
        key(&conn, b, "zycus", "ZY-200");

        let outcome = engine
            .execute_direct(&conn, &AuthToken::new("steward"), &MergeRequest::manual(a, b, "duplicate"))
            .expect("merge");

        assert_eq!(outcome.status, MergeStatus::Completed);
        assert_eq!(outcome.repoint.keys, 1);
        assert_eq!(outcome.snapshot_ids.len(), 2);
        assert_eq!(
            sink.actions_for(outcome.merge_id),
            vec![
                MergeStatus::Proposed,
                MergeStatus::Validated,
                MergeStatus::SnapshotCaptured,
                MergeStatus::SurvivorshipResolved,
                MergeStatus::Repointed,
                MergeStatus::Completed,
            ]
        );
        assert!(sink.events().iter().any(|e| matches!(
            e,
            AuditEvent::CanonicalIdentityChanged { absorbed, .. } if *absorbed == b
        )));

        let absorbed = store::require_vendor(&conn, b).expect("absorbed");
        assert_eq!(absorbed.merged_into_vendor_id, Some(a));
        assert_eq!(absorbed.merged_by.as_deref(), Some("steward"));
        assert!(locks::locked_vendors(&conn).expect("locks").is_empty());

        let survivor = store::require_vendor(&conn, a).expect("survivor");
        assert_eq!(survivor.legal_name, "Acme Corporation");
    }

    #[test]
    fn unauthorized_actor_changes_nothing() {
        let conn = open_in_memory().expect("store");
        let sink = Arc::new(MemoryAuditSink::new());
        let engine = orchestrator(Arc::clone(&sink));
        let a = vendor(&conn, "Acme", "peoplesoft");
        let b = vendor(&conn, "Acme", "zycus");

        let err = engine
            .execute_direct(&conn, &AuthToken::new("intern"), &MergeRequest::manual(a, b, "dup"))
            .expect_err("denied");
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(sink.events().is_empty());
        assert!(lineage::history_for_vendor(&conn, a).expect("history").is_empty());
    }

    #[test]
    fn self_merge_and_missing_vendor_are_validation_errors() {
        let conn = open_in_memory().expect("store");
        let engine = orchestrator(Arc::new(MemoryAuditSink::new()));
        let a = vendor(&conn, "Acme", "peoplesoft");
        let token = AuthToken::new("steward");

        let err = engine
            .execute_direct(&conn, &token, &MergeRequest::manual(a, a, "dup"))
            .expect_err("self");
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = engine
            .execute_direct(&conn, &token, &MergeRequest::manual(a, VendorId(404), "dup"))
            .expect_err("missing");
        assert_eq!(err.code(), ErrorCode::VendorNotFound);
        assert!(lineage::history_for_vendor(&conn, a).expect("history").is_empty());
    }

    #[test]
    fn locked_vendor_fails_validation_and_rolls_back() {
        let conn = open_in_memory().expect("store");
        let sink = Arc::new(MemoryAuditSink::new());
        let engine = orchestrator(Arc::clone(&sink));
        let token = AuthToken::new("steward");
        let a = vendor(&conn, "Acme", "peoplesoft");
        let b = vendor(&conn, "Acme Inc", "zycus");
        let c = vendor(&conn, "Acme LLC", "zycus");

        let held = engine
            .propose(&conn, &token, &MergeRequest::manual(a, b, "dup"))
            .expect("first proposal");
        let err = engine
            .propose(&conn, &token, &MergeRequest::manual(c, b, "dup"))
            .expect_err("overlap");
        assert_eq!(err.code(), ErrorCode::MergeInProgress);

        let refused = lineage::history_for_vendor(&conn, c).expect("history");
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].status, MergeStatus::RolledBack);
        assert_eq!(refused[0].failed_state, Some(MergeStatus::Proposed));
        assert_eq!(locks::holder(&conn, b).expect("holder"), Some(held));
    }

    #[test]
    fn cancel_only_before_snapshots() {
        let conn = open_in_memory().expect("store");
        let engine = orchestrator(Arc::new(MemoryAuditSink::new()));
        let token = AuthToken::new("steward");
        let a = vendor(&conn, "Acme", "peoplesoft");
        let b = vendor(&conn, "Acme Inc", "zycus");

        let merge_id = engine
            .propose(&conn, &token, &MergeRequest::manual(a, b, "dup"))
            .expect("proposal");
        let cancelled = engine.cancel(&conn, merge_id, "steward").expect("cancel");
        assert_eq!(cancelled.status, MergeStatus::Cancelled);
        assert!(locks::locked_vendors(&conn).expect("locks").is_empty());

        let err = engine.run(&conn, merge_id).expect_err("cancelled is terminal");
        assert_eq!(err.code(), ErrorCode::InvalidTransition);

        let outcome = engine
            .execute_direct(&conn, &token, &MergeRequest::manual(a, b, "dup"))
            .expect("merge");
        let err = engine.cancel(&conn, outcome.merge_id, "steward").expect_err("completed");
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[test]
    fn second_runner_leaves_the_merge_to_the_first() {
        let conn = open_in_memory().expect("store");
        let engine = orchestrator(Arc::new(MemoryAuditSink::new()));
        let a = vendor(&conn, "Acme", "peoplesoft");
        let b = vendor(&conn, "Acme Inc", "zycus");
        let merge_id = engine
            .propose(&conn, &AuthToken::new("steward"), &MergeRequest::manual(a, b, "dup"))
            .expect("proposal");

        db::immediate(&conn, |tx| capture_in(tx, merge_id)).expect("first capture");
        let err = db::immediate(&conn, |tx| capture_in(tx, merge_id)).expect_err("second capture");
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert!(is_lost_race(&err));
        assert_eq!(lineage::members(&conn, merge_id).expect("members").len(), 2);
        assert_eq!(lineage::snapshots(&conn, merge_id).expect("snapshots").len(), 2);

        let outcome = engine.run(&conn, merge_id).expect("first runner finishes");
        assert_eq!(outcome.status, MergeStatus::Completed);

        let err = db::immediate(&conn, |tx| engine.decide_in(tx, merge_id)).expect_err("late decide");
        assert!(is_lost_race(&err));
        let event = lineage::require_event(&conn, merge_id).expect("event");
        assert_eq!(event.status, MergeStatus::Completed);
        assert_eq!(event.failure_reason, None);
    }

    #[test]
    fn edit_after_snapshot_fails_closed() {
        let conn = open_in_memory().expect("store");
        let sink = Arc::new(MemoryAuditSink::new());
        let engine = orchestrator(Arc::clone(&sink));
        let token = AuthToken::new("steward");
        let a = vendor(&conn, "Acme", "peoplesoft");
        let b = vendor(&conn, "Acme Inc", "zycus");

        let merge_id = engine
            .propose(&conn, &token, &MergeRequest::manual(a, b, "dup"))
            .expect("proposal");
        db::immediate(&conn, |tx| capture_in(tx, merge_id)).expect("capture");
        store::update_vendor_fields(
            &conn,
            b,
            &crate::model::vendor::VendorFieldUpdate {
                risk_tier: Some(Some("high".into())),
                ..Default::default()
            },
        )
        .expect("edit");

        let err = engine.run(&conn, merge_id).expect_err("stale");
        assert_eq!(err.code(), ErrorCode::RepointFailed);
        assert!(err.to_string().contains("stale snapshot"));

        let event = lineage::require_event(&conn, merge_id).expect("event");
        assert_eq!(event.status, MergeStatus::RolledBack);
        assert_eq!(event.failed_state, Some(MergeStatus::SurvivorshipResolved));
        assert!(store::require_vendor(&conn, b).expect("b").is_canonical());
        assert_eq!(lineage::snapshots(&conn, merge_id).expect("snapshots").len(), 2);
        assert_eq!(
            sink.actions_for(merge_id).last().copied(),
            Some(MergeStatus::RolledBack)
        );
    }

    #[test]
    fn backoff_grows_with_attempts() {
        assert_eq!(backoff(0, 3), Duration::ZERO);
        let first = backoff(10, 1);
        let third = backoff(10, 3);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));
    }
}
