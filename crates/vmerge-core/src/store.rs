//! Identity store: vendor rows and their external-identifier mappings.
//!
//! The store never rewrites a key's `(source_system, source_key)` and never
//! moves a key from one vendor to another. Only the merge orchestrator
//! repoints keys, and only from an absorbed vendor to its survivor.

use crate::error::{ConflictError, Result, ValidationError};
use crate::model::vendor::{
    KEY_COLUMNS, KeyClaim, KeyRef, NewKey, NewVendor, VENDOR_COLUMNS, VendorFieldUpdate,
    VendorIdentity, VendorKey, VerificationStatus,
};
use crate::model::{VendorId, now_us};
use rusqlite::{Connection, OptionalExtension as _, params};
use std::collections::HashMap;

/// Outcome of [`register_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRegistration {
    /// New current mapping created.
    Inserted(VendorKey),
    /// Mapping already pointed at this vendor; `last_seen_at_us` refreshed.
    Refreshed(VendorKey),
    /// Key is owned by another vendor; the assertion was kept as a claim.
    Claimed { owner: VendorId, claim: KeyClaim },
}

/// Insert a vendor on first sighting or manual entry.
///
/// # Errors
///
/// Returns a validation error for a blank `source_system`, or a storage error.
pub fn insert_vendor(conn: &Connection, new: &NewVendor) -> Result<VendorIdentity> {
    if new.source_system.trim().is_empty() {
        return Err(ValidationError::InvalidInput("source_system must not be blank".into()).into());
    }

    let now = now_us();
    conn.execute(
        "INSERT INTO vendor (
            legal_name, display_name, lifecycle_state, risk_tier, owner_org_id,
            source_system, source_record_id, created_at_us, updated_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            new.legal_name,
            new.display_name,
            new.lifecycle_state,
            new.risk_tier,
            new.owner_org_id,
            new.source_system,
            new.source_record_id,
            now,
        ],
    )?;
    let vendor_id = VendorId(conn.last_insert_rowid());
    tracing::debug!(%vendor_id, source = %new.source_system, "vendor inserted");
    require_vendor(conn, vendor_id)
}

/// Fetch a vendor row by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_vendor(conn: &Connection, vendor_id: VendorId) -> Result<Option<VendorIdentity>> {
    let sql = format!("SELECT {VENDOR_COLUMNS} FROM vendor WHERE vendor_id = ?1");
    Ok(conn
        .query_row(&sql, [vendor_id], VendorIdentity::from_row)
        .optional()?)
}

/// Fetch a vendor row, treating absence as a validation error.
///
/// # Errors
///
/// Returns [`ValidationError::VendorNotFound`] if the vendor does not exist.
pub fn require_vendor(conn: &Connection, vendor_id: VendorId) -> Result<VendorIdentity> {
    get_vendor(conn, vendor_id)?.ok_or_else(|| ValidationError::VendorNotFound(vendor_id).into())
}

/// Apply an ordinary field edit to a canonical vendor.
///
/// # Errors
///
/// Returns a conflict if the vendor has been absorbed, a validation error if
/// it does not exist, or a storage error.
pub fn update_vendor_fields(
    conn: &Connection,
    vendor_id: VendorId,
    update: &VendorFieldUpdate,
) -> Result<VendorIdentity> {
    let mut vendor = require_vendor(conn, vendor_id)?;
    if let Some(merged_into) = vendor.merged_into_vendor_id {
        return Err(ConflictError::VendorAlreadyMerged {
            vendor_id,
            merged_into,
        }
        .into());
    }

    if let Some(legal_name) = &update.legal_name {
        vendor.legal_name.clone_from(legal_name);
    }
    if let Some(display_name) = &update.display_name {
        vendor.display_name.clone_from(display_name);
    }
    if let Some(lifecycle_state) = update.lifecycle_state {
        vendor.lifecycle_state = lifecycle_state;
    }
    if let Some(risk_tier) = &update.risk_tier {
        vendor.risk_tier.clone_from(risk_tier);
    }
    if let Some(owner_org_id) = &update.owner_org_id {
        vendor.owner_org_id.clone_from(owner_org_id);
    }

    write_fields(conn, &vendor)?;
    require_vendor(conn, vendor_id)
}

/// Persist the survivorship-managed fields of `vendor` and bump its version.
pub(crate) fn write_fields(conn: &Connection, vendor: &VendorIdentity) -> Result<()> {
    conn.execute(
        "UPDATE vendor
         SET legal_name = ?2, display_name = ?3, lifecycle_state = ?4, risk_tier = ?5,
             owner_org_id = ?6, updated_at_us = ?7
         WHERE vendor_id = ?1",
        params![
            vendor.vendor_id,
            vendor.legal_name,
            vendor.display_name,
            vendor.lifecycle_state,
            vendor.risk_tier,
            vendor.owner_org_id,
            next_version(vendor.updated_at_us),
        ],
    )?;
    Ok(())
}

/// `updated_at_us` doubles as a row version, so it must strictly increase.
pub(crate) fn next_version(previous: i64) -> i64 {
    now_us().max(previous.saturating_add(1))
}

/// Register an external identifier for a canonical vendor.
///
/// # Errors
///
/// Returns a validation error for blank key parts or a missing vendor, a
/// conflict if the vendor has been absorbed, or a storage error.
pub fn register_key(conn: &Connection, vendor_id: VendorId, new: &NewKey) -> Result<KeyRegistration> {
    if new.key.source_system.trim().is_empty() || new.key.source_key.trim().is_empty() {
        return Err(ValidationError::InvalidInput(
            "source_system and source_key must not be blank".into(),
        )
        .into());
    }

    let vendor = require_vendor(conn, vendor_id)?;
    if let Some(merged_into) = vendor.merged_into_vendor_id {
        return Err(ConflictError::VendorAlreadyMerged {
            vendor_id,
            merged_into,
        }
        .into());
    }

    let now = now_us();
    match lookup_key(conn, &new.key)? {
        None => {
            conn.execute(
                "INSERT INTO vendor_key (
                    source_system, source_key, vendor_id, original_vendor_id,
                    is_primary_source, verification_status, first_seen_at_us, last_seen_at_us
                ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?6)",
                params![
                    new.key.source_system,
                    new.key.source_key,
                    vendor_id,
                    new.is_primary_source,
                    new.verification_status,
                    now,
                ],
            )?;
            let key = lookup_key(conn, &new.key)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tracing::debug!(%vendor_id, key = %new.key, "vendor key registered");
            Ok(KeyRegistration::Inserted(key))
        }
        Some(existing) if existing.vendor_id == vendor_id => {
            conn.execute(
                "UPDATE vendor_key SET last_seen_at_us = ?3
                 WHERE source_system = ?1 AND source_key = ?2",
                params![new.key.source_system, new.key.source_key, now],
            )?;
            let key = lookup_key(conn, &new.key)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            Ok(KeyRegistration::Refreshed(key))
        }
        Some(existing) => {
            conn.execute(
                "INSERT INTO vendor_key_claim (
                    vendor_id, source_system, source_key, verification_status, observed_at_us
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (vendor_id, source_system, source_key)
                DO UPDATE SET observed_at_us = excluded.observed_at_us,
                              verification_status = excluded.verification_status",
                params![
                    vendor_id,
                    new.key.source_system,
                    new.key.source_key,
                    new.verification_status,
                    now,
                ],
            )?;
            let claim = claims_for(conn, vendor_id)?
                .into_iter()
                .find(|claim| claim.key_ref() == new.key)
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tracing::info!(
                %vendor_id,
                owner = %existing.vendor_id,
                key = %new.key,
                "key already owned by another vendor; recorded as claim"
            );
            Ok(KeyRegistration::Claimed {
                owner: existing.vendor_id,
                claim,
            })
        }
    }
}

/// Change the verification status of a current mapping.
///
/// # Errors
///
/// Returns a validation error if the key is unknown, or a storage error.
pub fn set_key_verification(
    conn: &Connection,
    key: &KeyRef,
    status: VerificationStatus,
) -> Result<VendorKey> {
    let changed = conn.execute(
        "UPDATE vendor_key SET verification_status = ?3
         WHERE source_system = ?1 AND source_key = ?2",
        params![key.source_system, key.source_key, status],
    )?;
    if changed == 0 {
        return Err(ValidationError::InvalidInput(format!("unknown vendor key {key}")).into());
    }
    lookup_key(conn, key)?
        .ok_or_else(|| ValidationError::InvalidInput(format!("unknown vendor key {key}")).into())
}

/// Look up the current owner mapping of a key.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn lookup_key(conn: &Connection, key: &KeyRef) -> Result<Option<VendorKey>> {
    let sql = format!(
        "SELECT {KEY_COLUMNS} FROM vendor_key WHERE source_system = ?1 AND source_key = ?2"
    );
    Ok(conn
        .query_row(
            &sql,
            params![key.source_system, key.source_key],
            VendorKey::from_row,
        )
        .optional()?)
}

/// Current keys owned by a vendor, ordered by key.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn keys_for(conn: &Connection, vendor_id: VendorId) -> Result<Vec<VendorKey>> {
    let sql = format!(
        "SELECT {KEY_COLUMNS} FROM vendor_key WHERE vendor_id = ?1
         ORDER BY source_system, source_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([vendor_id], VendorKey::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

const CLAIM_COLUMNS: &str =
    "claim_id, vendor_id, source_system, source_key, verification_status, observed_at_us";

fn claim_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyClaim> {
    Ok(KeyClaim {
        claim_id: row.get(0)?,
        vendor_id: row.get(1)?,
        source_system: row.get(2)?,
        source_key: row.get(3)?,
        verification_status: row.get(4)?,
        observed_at_us: row.get(5)?,
    })
}

/// Claims asserted by a vendor, ordered by key.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn claims_for(conn: &Connection, vendor_id: VendorId) -> Result<Vec<KeyClaim>> {
    let sql = format!(
        "SELECT {CLAIM_COLUMNS} FROM vendor_key_claim WHERE vendor_id = ?1
         ORDER BY source_system, source_key"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([vendor_id], claim_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Change the verification status of a claim.
///
/// # Errors
///
/// Returns a validation error if the claim is unknown, or a storage error.
pub fn set_claim_verification(
    conn: &Connection,
    claim_id: i64,
    status: VerificationStatus,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE vendor_key_claim SET verification_status = ?2 WHERE claim_id = ?1",
        params![claim_id, status],
    )?;
    if changed == 0 {
        return Err(ValidationError::InvalidInput(format!("unknown claim {claim_id}")).into());
    }
    Ok(())
}

/// Every canonical vendor, ordered by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_canonical(conn: &Connection) -> Result<Vec<VendorIdentity>> {
    let sql = format!(
        "SELECT {VENDOR_COLUMNS} FROM vendor WHERE merged_into_vendor_id IS NULL
         ORDER BY vendor_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], VendorIdentity::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Keys of every canonical vendor, grouped by owner.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn canonical_keys(conn: &Connection) -> Result<HashMap<VendorId, Vec<VendorKey>>> {
    let sql = format!(
        "SELECT {} FROM vendor_key k
         JOIN vendor v ON v.vendor_id = k.vendor_id
         WHERE v.merged_into_vendor_id IS NULL
         ORDER BY k.vendor_id, k.source_system, k.source_key",
        prefixed_columns(KEY_COLUMNS, "k")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], VendorKey::from_row)?;
    let mut grouped: HashMap<VendorId, Vec<VendorKey>> = HashMap::new();
    for key in rows {
        let key = key?;
        grouped.entry(key.vendor_id).or_default().push(key);
    }
    Ok(grouped)
}

/// Claims of every canonical vendor, grouped by claimant.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn canonical_claims(conn: &Connection) -> Result<HashMap<VendorId, Vec<KeyClaim>>> {
    let sql = format!(
        "SELECT {} FROM vendor_key_claim c
         JOIN vendor v ON v.vendor_id = c.vendor_id
         WHERE v.merged_into_vendor_id IS NULL
         ORDER BY c.vendor_id, c.source_system, c.source_key",
        prefixed_columns(CLAIM_COLUMNS, "c")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], claim_from_row)?;
    let mut grouped: HashMap<VendorId, Vec<KeyClaim>> = HashMap::new();
    for claim in rows {
        let claim = claim?;
        grouped.entry(claim.vendor_id).or_default().push(claim);
    }
    Ok(grouped)
}

fn prefixed_columns(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
