//! Store-backed scans: load the population, match, enqueue.

use crate::matcher::{Matcher, Population, default_workers};
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, instrument};
use vmerge_core::config::MatchConfig;
use vmerge_core::model::candidate::{MatchBasis, MatchCandidate};
use vmerge_core::model::{CandidateId, VendorId};
use vmerge_core::queue::{self, Enqueued};
use vmerge_core::store;

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    /// Subjects compared against the population.
    pub scanned: usize,
    /// Candidates emitted by the matcher.
    pub emitted: usize,
    /// Of those, candidates found by the deterministic key pass.
    pub exact: usize,
    /// Queue entries created by this scan.
    pub enqueued: Vec<CandidateId>,
    /// Open queue entries that already covered an emitted pair.
    pub existing: Vec<CandidateId>,
}

impl ScanReport {
    fn record(&mut self, candidate: &MatchCandidate, entry: &Enqueued) {
        self.emitted += 1;
        if candidate.match_basis == MatchBasis::ExactKey {
            self.exact += 1;
        }
        let id = entry.candidate().candidate_id;
        if entry.is_new() {
            self.enqueued.push(id);
        } else {
            self.existing.push(id);
        }
    }
}

/// Match one vendor against the canonical population.
///
/// An absorbed vendor scans nothing.
///
/// # Errors
///
/// Returns an error if the vendor does not exist or a store call fails.
#[instrument(skip(conn, config))]
pub fn scan_vendor(conn: &Connection, vendor_id: VendorId, config: &MatchConfig) -> Result<ScanReport> {
    let subject = store::require_vendor(conn, vendor_id)
        .with_context(|| format!("failed to load vendor {vendor_id}"))?;
    let population = Population::load(conn).context("failed to load vendor population")?;
    let matcher = Matcher::new(config.clone());

    let mut report = ScanReport::default();
    if subject.merged_into_vendor_id.is_some() {
        info!(%vendor_id, "vendor is absorbed; nothing to scan");
        return Ok(report);
    }
    report.scanned = 1;
    let candidates = matcher.find_candidates(&subject, &population);
    enqueue_all(conn, &candidates, &mut report)?;
    info!(
        %vendor_id,
        emitted = report.emitted,
        enqueued = report.enqueued.len(),
        "vendor scan finished"
    );
    Ok(report)
}

/// Match every canonical vendor against every other.
///
/// # Errors
///
/// Returns an error if a store call fails.
#[instrument(skip(conn, config))]
pub fn scan_all(conn: &Connection, config: &MatchConfig) -> Result<ScanReport> {
    let population = Population::load(conn).context("failed to load vendor population")?;
    let matcher = Matcher::new(config.clone());
    let candidates =
        matcher.find_candidates_batch(population.vendors(), &population, default_workers());

    let mut report = ScanReport {
        scanned: population.vendors().len(),
        ..ScanReport::default()
    };
    enqueue_all(conn, &candidates, &mut report)?;
    info!(
        scanned = report.scanned,
        emitted = report.emitted,
        enqueued = report.enqueued.len(),
        "full scan finished"
    );
    Ok(report)
}

fn enqueue_all(
    conn: &Connection,
    candidates: &[MatchCandidate],
    report: &mut ScanReport,
) -> Result<()> {
    for candidate in candidates {
        let (a, b) = candidate.pair();
        let entry = queue::enqueue(conn, candidate)
            .with_context(|| format!("failed to enqueue pair {a}, {b}"))?;
        report.record(candidate, &entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmerge_core::db::open_in_memory;
    use vmerge_core::model::vendor::NewVendor;

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

    #[test]
    fn scan_vendor_enqueues_once() {
        let conn = open_in_memory().expect("store");
        let a = vendor(&conn, "Acme Holdings LLC");
        vendor(&conn, "ACME Holdings Inc");
        vendor(&conn, "Zephyr Logistics");

        let first = scan_vendor(&conn, a, &MatchConfig::default()).expect("scan");
        assert_eq!(first.scanned, 1);
        assert_eq!(first.emitted, 1);
        assert_eq!(first.enqueued.len(), 1);

        let second = scan_vendor(&conn, a, &MatchConfig::default()).expect("rescan");
        assert!(second.enqueued.is_empty());
        assert_eq!(second.existing, first.enqueued);
    }

    #[test]
    fn scan_all_reports_each_pair_once() {
        let conn = open_in_memory().expect("store");
        vendor(&conn, "Acme Holdings");
        vendor(&conn, "Acme Holdings Inc");
        vendor(&conn, "Acme Holdings LLC");

        let report = scan_all(&conn, &MatchConfig::default()).expect("scan");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.emitted, 3);
        assert_eq!(report.enqueued.len(), 3);
    }

    #[test]
    fn scan_unknown_vendor_is_an_error() {
        let conn = open_in_memory().expect("store");
        let err = scan_vendor(&conn, VendorId(404), &MatchConfig::default())
            .expect_err("missing vendor");
        assert!(err.to_string().contains("v-404"));
    }
}
