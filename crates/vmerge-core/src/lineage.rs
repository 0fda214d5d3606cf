//! Append-only merge lineage: events, members, snapshots, decisions.
//!
//! Members, snapshots and decisions are insert-only; the schema triggers
//! reject updates and deletes. Event rows move through the state machine
//! until they reach a terminal status and are immutable afterwards.

use crate::error::{Result, ValidationError};
use crate::model::merge::{
    FieldOverride, MemberRole, MergeEvent, MergeMember, MergeMethod, MergeSnapshot, MergeStatus,
    SnapshotRecord, SurvivorshipDecision,
};
use crate::model::vendor::KeyRef;
use crate::model::{CandidateId, MergeId, VendorId, now_us};
use rusqlite::{Connection, OptionalExtension as _, Row, params};

const EVENT_COLUMNS: &str = "merge_id, survivor_vendor_id, absorbed_vendor_id, status, \
     merge_reason, merge_method, confidence_score, originating_candidate_id, actor, \
     overrides_json, failed_state, failure_reason, started_at_us, updated_at_us, completed_at_us";

const SNAPSHOT_COLUMNS: &str =
    "snapshot_id, merge_id, vendor_id, role, snapshot_json, digest, captured_at_us";

/// Header fields of a new merge event.
#[derive(Debug, Clone)]
pub(crate) struct NewEvent<'a> {
    pub survivor: VendorId,
    pub absorbed: VendorId,
    pub reason: &'a str,
    pub method: MergeMethod,
    pub confidence_score: Option<f64>,
    pub originating_candidate_id: Option<CandidateId>,
    pub actor: &'a str,
    pub overrides: &'a [FieldOverride],
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<MergeEvent> {
    let overrides_json: String = row.get(9)?;
    let overrides = serde_json::from_str(&overrides_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(MergeEvent {
        merge_id: row.get(0)?,
        survivor_vendor_id: row.get(1)?,
        absorbed_vendor_id: row.get(2)?,
        status: row.get(3)?,
        merge_reason: row.get(4)?,
        merge_method: row.get(5)?,
        confidence_score: row.get(6)?,
        originating_candidate_id: row.get(7)?,
        actor: row.get(8)?,
        overrides,
        failed_state: row.get(10)?,
        failure_reason: row.get(11)?,
        started_at_us: row.get(12)?,
        updated_at_us: row.get(13)?,
        completed_at_us: row.get(14)?,
    })
}

/// Insert a merge event in `proposed`.
pub(crate) fn insert_event(conn: &Connection, new: &NewEvent<'_>) -> Result<MergeId> {
    let now = now_us();
    conn.execute(
        "INSERT INTO vendor_merge_event (
            survivor_vendor_id, absorbed_vendor_id, status, merge_reason, merge_method,
            confidence_score, originating_candidate_id, actor, overrides_json,
            started_at_us, updated_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            new.survivor,
            new.absorbed,
            MergeStatus::Proposed,
            new.reason,
            new.method,
            new.confidence_score,
            new.originating_candidate_id,
            new.actor,
            serde_json::to_string(new.overrides)?,
            now,
        ],
    )?;
    Ok(MergeId(conn.last_insert_rowid()))
}

/// Move an event along the state machine.
///
/// The update is conditional on the current status so a concurrent writer
/// that already moved the event makes this call fail instead of overwrite.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidTransition`] if `from -> to` is not a
/// legal edge or the stored status is no longer `from`.
pub(crate) fn transition(
    conn: &Connection,
    merge_id: MergeId,
    from: MergeStatus,
    to: MergeStatus,
    failure_reason: Option<&str>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(invalid_transition(from, to));
    }

    let now = now_us();
    let failed_state = match (from, to) {
        (_, MergeStatus::ValidationFailed | MergeStatus::RepointFailed) => Some(from),
        (MergeStatus::ValidationFailed | MergeStatus::RepointFailed, _) => None,
        (_, MergeStatus::RolledBack) => Some(from),
        _ => None,
    };
    let completed_at = (to == MergeStatus::Completed).then_some(now);
    let changed = conn.execute(
        "UPDATE vendor_merge_event
         SET status = ?3,
             updated_at_us = ?4,
             failed_state = COALESCE(?5, failed_state),
             failure_reason = COALESCE(?6, failure_reason),
             completed_at_us = COALESCE(?7, completed_at_us)
         WHERE merge_id = ?1 AND status = ?2",
        params![merge_id, from, to, now, failed_state, failure_reason, completed_at],
    )?;

    if changed == 0 {
        let current = require_event(conn, merge_id)?.status;
        return Err(invalid_transition(current, to));
    }

    tracing::info!(%merge_id, from = %from, to = %to, "merge transition");
    Ok(())
}

fn invalid_transition(from: MergeStatus, to: MergeStatus) -> crate::error::MergeError {
    ValidationError::InvalidTransition {
        entity: "merge event",
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

pub(crate) fn write_member(conn: &Connection, member: &MergeMember) -> Result<()> {
    conn.execute(
        "INSERT INTO vendor_merge_member (merge_id, vendor_id, role, pre_merge_keys_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            member.merge_id,
            member.vendor_id,
            member.role,
            serde_json::to_string(&member.pre_merge_keys)?,
        ],
    )?;
    Ok(())
}

/// Hex blake3 digest of a stored snapshot document.
#[must_use]
pub fn snapshot_digest(json: &str) -> String {
    blake3::hash(json.as_bytes()).to_hex().to_string()
}

/// Write the pre-mutation snapshot of one participant.
pub(crate) fn write_snapshot(
    conn: &Connection,
    merge_id: MergeId,
    role: MemberRole,
    record: SnapshotRecord,
) -> Result<MergeSnapshot> {
    let json = serde_json::to_string(&record)?;
    let digest = snapshot_digest(&json);
    let captured_at_us = now_us();
    let vendor_id = record.vendor.vendor_id;
    conn.execute(
        "INSERT INTO vendor_merge_snapshot (
            merge_id, vendor_id, role, snapshot_json, digest, captured_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![merge_id, vendor_id, role, json, digest, captured_at_us],
    )?;
    Ok(MergeSnapshot {
        snapshot_id: conn.last_insert_rowid(),
        merge_id,
        vendor_id,
        role,
        record,
        digest,
        captured_at_us,
    })
}

pub(crate) fn write_decision(
    conn: &Connection,
    merge_id: MergeId,
    decision: &SurvivorshipDecision,
) -> Result<()> {
    conn.execute(
        "INSERT INTO vendor_survivorship_decision (
            merge_id, field_name, chosen_vendor_id, chosen_value, survivor_value,
            absorbed_value, decision_method, note, decided_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            merge_id,
            decision.field,
            decision.chosen_vendor_id,
            decision.chosen_value,
            decision.survivor_value,
            decision.absorbed_value,
            decision.decision_method,
            decision.note,
            now_us(),
        ],
    )?;
    Ok(())
}

/// Fetch a merge event header.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is unreadable.
pub fn event(conn: &Connection, merge_id: MergeId) -> Result<Option<MergeEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM vendor_merge_event WHERE merge_id = ?1");
    Ok(conn.query_row(&sql, [merge_id], event_from_row).optional()?)
}

/// Fetch a merge event, treating absence as a validation error.
///
/// # Errors
///
/// Returns [`ValidationError::MergeNotFound`] if no such event exists.
pub fn require_event(conn: &Connection, merge_id: MergeId) -> Result<MergeEvent> {
    event(conn, merge_id)?.ok_or_else(|| ValidationError::MergeNotFound(merge_id).into())
}

/// The non-terminal event a queue entry is driving, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn open_event_for_candidate(
    conn: &Connection,
    candidate_id: CandidateId,
) -> Result<Option<MergeId>> {
    Ok(conn
        .query_row(
            "SELECT merge_id FROM vendor_merge_event
             WHERE originating_candidate_id = ?1
               AND status NOT IN ('completed', 'rolled_back', 'cancelled')
             ORDER BY merge_id DESC LIMIT 1",
            [candidate_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Members of a merge, survivor first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is unreadable.
pub fn members(conn: &Connection, merge_id: MergeId) -> Result<Vec<MergeMember>> {
    let mut stmt = conn.prepare(
        "SELECT merge_id, vendor_id, role, pre_merge_keys_json
         FROM vendor_merge_member
         WHERE merge_id = ?1
         ORDER BY role = 'absorbed', vendor_id",
    )?;
    let rows = stmt.query_map([merge_id], |row| {
        let keys_json: String = row.get(3)?;
        Ok((
            row.get::<_, MergeId>(0)?,
            row.get::<_, VendorId>(1)?,
            row.get::<_, MemberRole>(2)?,
            keys_json,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (merge_id, vendor_id, role, keys_json) = row?;
        let pre_merge_keys: Vec<KeyRef> = serde_json::from_str(&keys_json)?;
        out.push(MergeMember {
            merge_id,
            vendor_id,
            role,
            pre_merge_keys,
        });
    }
    Ok(out)
}

/// Snapshots of a merge, survivor first.
///
/// # Errors
///
/// Returns an error if the query fails or a document cannot be parsed.
pub fn snapshots(conn: &Connection, merge_id: MergeId) -> Result<Vec<MergeSnapshot>> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM vendor_merge_snapshot
         WHERE merge_id = ?1
         ORDER BY role = 'absorbed', vendor_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([merge_id], |row| {
        let json: String = row.get(4)?;
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, MergeId>(1)?,
            row.get::<_, VendorId>(2)?,
            row.get::<_, MemberRole>(3)?,
            json,
            row.get::<_, String>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (snapshot_id, merge_id, vendor_id, role, json, digest, captured_at_us) = row?;
        out.push(MergeSnapshot {
            snapshot_id,
            merge_id,
            vendor_id,
            role,
            record: serde_json::from_str(&json)?,
            digest,
            captured_at_us,
        });
    }
    Ok(out)
}

/// Check a stored snapshot document against its recorded digest.
///
/// Returns `None` if the snapshot does not exist.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn verify_snapshot(conn: &Connection, snapshot_id: i64) -> Result<Option<bool>> {
    let stored: Option<(String, String)> = conn
        .query_row(
            "SELECT snapshot_json, digest FROM vendor_merge_snapshot WHERE snapshot_id = ?1",
            [snapshot_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(stored.map(|(json, digest)| snapshot_digest(&json) == digest))
}

/// Survivorship decisions of a merge in field order.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is unreadable.
pub fn decisions(conn: &Connection, merge_id: MergeId) -> Result<Vec<SurvivorshipDecision>> {
    let mut stmt = conn.prepare(
        "SELECT field_name, chosen_vendor_id, chosen_value, survivor_value, absorbed_value,
                decision_method, note
         FROM vendor_survivorship_decision
         WHERE merge_id = ?1
         ORDER BY decision_id",
    )?;
    let rows = stmt.query_map([merge_id], |row| {
        Ok(SurvivorshipDecision {
            field: row.get(0)?,
            chosen_vendor_id: row.get(1)?,
            chosen_value: row.get(2)?,
            survivor_value: row.get(3)?,
            absorbed_value: row.get(4)?,
            decision_method: row.get(5)?,
            note: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every merge event a vendor took part in, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is unreadable.
pub fn history_for_vendor(conn: &Connection, vendor_id: VendorId) -> Result<Vec<MergeEvent>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM vendor_merge_event
         WHERE survivor_vendor_id = ?1 OR absorbed_vendor_id = ?1
         ORDER BY merge_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([vendor_id], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Events in any of `statuses` not touched since `updated_before_us`.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is unreadable.
pub fn events_in_status(
    conn: &Connection,
    statuses: &[MergeStatus],
    updated_before_us: i64,
) -> Result<Vec<MergeEvent>> {
    let placeholders = (0..statuses.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM vendor_merge_event
         WHERE updated_at_us <= ?1 AND status IN ({placeholders})
         ORDER BY merge_id"
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(statuses.len() + 1);
    values.push(&updated_before_us);
    for status in statuses {
        values.push(status);
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(values.as_slice(), event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
