//! Moving keys, claims and dependent rows from an absorbed vendor to its
//! survivor, and the fail-closed check that every dependent is enumerated.

use crate::config::DependentRef;
use crate::db::schema::ENGINE_TABLES;
use crate::error::{MergeError, Result, ValidationError};
use crate::model::{MergeId, VendorId};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::collections::BTreeSet;

/// A table column that references a vendor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VendorReference {
    pub table: String,
    pub column: String,
}

/// Rows moved by one repoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepointReport {
    pub keys: usize,
    pub claims: usize,
    /// `(table, rows)` in configuration order.
    pub dependents: Vec<(String, usize)>,
}

impl RepointReport {
    #[must_use]
    pub fn dependent_rows(&self) -> usize {
        self.dependents.iter().map(|(_, rows)| rows).sum()
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn columns_of(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every non-engine column that references `vendor(vendor_id)` through a
/// foreign key, or is named `vendor_id`.
///
/// # Errors
///
/// Returns an error if the schema cannot be inspected.
pub fn discover_references(conn: &Connection) -> Result<BTreeSet<VendorReference>> {
    let mut found = BTreeSet::new();
    for table in user_tables(conn)? {
        if ENGINE_TABLES.contains(&table.as_str()) {
            continue;
        }

        let mut stmt =
            conn.prepare("SELECT \"table\", \"from\" FROM pragma_foreign_key_list(?1)")?;
        let fks = stmt.query_map([&table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for fk in fks {
            let (target, column) = fk?;
            if target.eq_ignore_ascii_case("vendor") {
                found.insert(VendorReference {
                    table: table.clone(),
                    column,
                });
            }
        }

        for column in columns_of(conn, &table)? {
            if column.eq_ignore_ascii_case("vendor_id") {
                found.insert(VendorReference {
                    table: table.clone(),
                    column,
                });
            }
        }
    }
    Ok(found)
}

/// Fail closed unless the configured dependents cover every vendor
/// reference in the schema and name only real columns.
///
/// # Errors
///
/// Returns [`MergeError::RepointConfigurationGap`] for the first uncovered
/// or nonexistent reference.
pub fn check_configuration(
    conn: &Connection,
    dependents: &[DependentRef],
    merge_id: Option<MergeId>,
) -> Result<()> {
    let gap = |table: &str, column: &str| {
        tracing::error!(
            merge_id = ?merge_id,
            table,
            column,
            "dependent vendor reference is not enumerated for repointing"
        );
        MergeError::RepointConfigurationGap {
            merge_id,
            table: table.to_string(),
            column: column.to_string(),
        }
    };

    let configured: BTreeSet<(String, String)> = dependents
        .iter()
        .map(|d| (d.table.to_ascii_lowercase(), d.column.to_ascii_lowercase()))
        .collect();

    for dependent in dependents {
        if !is_identifier(&dependent.table) || !is_identifier(&dependent.column) {
            return Err(gap(&dependent.table, &dependent.column));
        }
        let columns = columns_of(conn, &dependent.table)?;
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(&dependent.column)) {
            return Err(gap(&dependent.table, &dependent.column));
        }
    }

    for reference in discover_references(conn)? {
        let key = (
            reference.table.to_ascii_lowercase(),
            reference.column.to_ascii_lowercase(),
        );
        if !configured.contains(&key) {
            return Err(gap(&reference.table, &reference.column));
        }
    }
    Ok(())
}

/// Repoint every current key mapping of `absorbed`. `original_vendor_id`
/// and the key values are left as they are.
pub(crate) fn repoint_keys(
    conn: &Connection,
    absorbed: VendorId,
    survivor: VendorId,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE vendor_key SET vendor_id = ?2 WHERE vendor_id = ?1",
        params![absorbed, survivor],
    )?)
}

/// Repoint claims of `absorbed`. A claim the survivor already holds stays
/// with the absorbed vendor as history.
pub(crate) fn repoint_claims(
    conn: &Connection,
    absorbed: VendorId,
    survivor: VendorId,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE OR IGNORE vendor_key_claim SET vendor_id = ?2 WHERE vendor_id = ?1",
        params![absorbed, survivor],
    )?)
}

/// Repoint each dependent in chunks of `chunk_size` rows. Runs inside the
/// caller's transaction, so either every chunk lands or none does.
pub(crate) fn repoint_dependents(
    conn: &Connection,
    dependents: &[DependentRef],
    chunk_size: usize,
    absorbed: VendorId,
    survivor: VendorId,
) -> Result<Vec<(String, usize)>> {
    if chunk_size == 0 {
        return Err(ValidationError::InvalidInput("repoint.chunk_size must be positive".into()).into());
    }
    let limit = i64::try_from(chunk_size).unwrap_or(i64::MAX);

    let mut moved = Vec::with_capacity(dependents.len());
    for dependent in dependents {
        let sql = format!(
            "UPDATE \"{table}\" SET \"{column}\" = ?1
             WHERE rowid IN (
                 SELECT rowid FROM \"{table}\" WHERE \"{column}\" = ?2 LIMIT ?3
             )",
            table = dependent.table,
            column = dependent.column,
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut total = 0;
        loop {
            let changed = stmt.execute(params![survivor, absorbed, limit])?;
            total += changed;
            if changed == 0 {
                break;
            }
            tracing::debug!(table = %dependent.table, changed, total, "repointed chunk");
        }
        moved.push((dependent.table.clone(), total));
    }
    Ok(moved)
}
