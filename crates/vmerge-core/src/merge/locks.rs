//! Per-vendor merge serialization through `vendor_merge_lock` rows.

use crate::error::{ConflictError, Result};
use crate::model::{MergeId, VendorId, now_us};
use rusqlite::{Connection, OptionalExtension as _, params};

/// Merge currently holding `vendor_id`, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn holder(conn: &Connection, vendor_id: VendorId) -> Result<Option<MergeId>> {
    Ok(conn
        .query_row(
            "SELECT merge_id FROM vendor_merge_lock WHERE vendor_id = ?1",
            [vendor_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Every locked vendor with its holding merge, by vendor id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn locked_vendors(conn: &Connection) -> Result<Vec<(VendorId, MergeId)>> {
    let mut stmt =
        conn.prepare("SELECT vendor_id, merge_id FROM vendor_merge_lock ORDER BY vendor_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// First vendor of `vendors` held by a merge other than `merge_id`.
pub(crate) fn first_conflict(
    conn: &Connection,
    merge_id: MergeId,
    vendors: [VendorId; 2],
) -> Result<Option<ConflictError>> {
    for vendor_id in sorted(vendors) {
        if let Some(held_by) = holder(conn, vendor_id)? {
            if held_by != merge_id {
                return Ok(Some(ConflictError::MergeInProgress {
                    vendor_id,
                    merge_id: held_by,
                }));
            }
        }
    }
    Ok(None)
}

/// Take both vendor locks in ascending vendor id order.
///
/// # Errors
///
/// Returns [`ConflictError::MergeInProgress`] if another merge holds either.
pub(crate) fn acquire(conn: &Connection, merge_id: MergeId, vendors: [VendorId; 2]) -> Result<()> {
    if let Some(conflict) = first_conflict(conn, merge_id, vendors)? {
        return Err(conflict.into());
    }
    let now = now_us();
    for vendor_id in sorted(vendors) {
        conn.execute(
            "INSERT OR IGNORE INTO vendor_merge_lock (vendor_id, merge_id, acquired_at_us)
             VALUES (?1, ?2, ?3)",
            params![vendor_id, merge_id, now],
        )?;
    }
    Ok(())
}

/// Drop every lock held by `merge_id`. Returns the number released.
pub(crate) fn release(conn: &Connection, merge_id: MergeId) -> Result<usize> {
    Ok(conn.execute("DELETE FROM vendor_merge_lock WHERE merge_id = ?1", [merge_id])?)
}

fn sorted(mut vendors: [VendorId; 2]) -> [VendorId; 2] {
    vendors.sort_unstable();
    vendors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::lineage::{NewEvent, insert_event};
    use crate::model::merge::MergeMethod;
    use crate::model::vendor::NewVendor;
    use crate::store;

    fn vendor(conn: &Connection, name: &str) -> VendorId {
        store::insert_vendor(
            conn,
            &NewVendor {
                legal_name: name.into(),
                source_system: "manual".into(),
                ..NewVendor::default()
            },
        )
        .expect("vendor")
        .vendor_id
    }

    fn event(conn: &Connection, survivor: VendorId, absorbed: VendorId) -> MergeId {
        insert_event(
            conn,
            &NewEvent {
                survivor,
                absorbed,
                reason: "test",
                method: MergeMethod::Manual,
                confidence_score: None,
                originating_candidate_id: None,
                actor: "steward",
                overrides: &[],
            },
        )
        .expect("event")
    }

    #[test]
    fn overlapping_merge_is_refused_until_release() {
        let conn = open_in_memory().expect("store");
        let a = vendor(&conn, "A");
        let b = vendor(&conn, "B");
        let c = vendor(&conn, "C");

        let first = event(&conn, b, a);
        acquire(&conn, first, [b, a]).expect("first lock");
        assert_eq!(holder(&conn, a).expect("holder"), Some(first));
        assert_eq!(locked_vendors(&conn).expect("locked").len(), 2);

        let second = event(&conn, c, b);
        let err = acquire(&conn, second, [c, b]).expect_err("overlap");
        assert!(matches!(
            err,
            crate::error::MergeError::Conflict(ConflictError::MergeInProgress { vendor_id, merge_id })
                if vendor_id == b && merge_id == first
        ));
        assert_eq!(holder(&conn, c).expect("holder"), None, "no partial lock");

        assert_eq!(release(&conn, first).expect("release"), 2);
        acquire(&conn, second, [c, b]).expect("second lock");
    }

    #[test]
    fn reacquiring_own_locks_is_a_no_op() {
        let conn = open_in_memory().expect("store");
        let a = vendor(&conn, "A");
        let b = vendor(&conn, "B");
        let merge_id = event(&conn, a, b);
        acquire(&conn, merge_id, [a, b]).expect("lock");
        acquire(&conn, merge_id, [b, a]).expect("relock");
        assert_eq!(release(&conn, merge_id).expect("release"), 2);
    }
}
