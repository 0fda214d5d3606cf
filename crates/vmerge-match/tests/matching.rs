//! End-to-end matching against a real store: scan, enqueue, approve.

use proptest::prelude::*;
use rusqlite::Connection;
use std::sync::Arc;
use vmerge_core::audit::MemoryAuditSink;
use vmerge_core::auth::{AuthToken, StaticAuthorizer};
use vmerge_core::config::{EngineConfig, MatchConfig};
use vmerge_core::db::open_in_memory;
use vmerge_core::lineage;
use vmerge_core::model::VendorId;
use vmerge_core::model::candidate::{CandidateStatus, MatchBasis};
use vmerge_core::model::merge::MergeStatus;
use vmerge_core::model::vendor::{KeyRef, NewKey, NewVendor, VerificationStatus};
use vmerge_core::queue::{self, ApproveOptions, CandidateFilter};
use vmerge_core::resolver::Resolver;
use vmerge_core::{MergeOrchestrator, store};
use vmerge_match::normalize::normalize_name;
use vmerge_match::similarity::{NameProfile, vendor_similarity};
use vmerge_match::{Matcher, Population, scan_all, scan_vendor};

fn vendor(conn: &Connection, name: &str, source: &str, org: Option<&str>) -> VendorId {
    store::insert_vendor(
        conn,
        &NewVendor {
            legal_name: name.into(),
            source_system: source.into(),
            owner_org_id: org.map(Into::into),
            ..NewVendor::default()
        },
    )
    .expect("insert vendor")
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
    .expect("register key");
}

fn orchestrator() -> MergeOrchestrator {
    MergeOrchestrator::new(
        EngineConfig::default(),
        Arc::new(StaticAuthorizer::new(["steward"])),
        Arc::new(MemoryAuditSink::new()),
    )
}

#[test]
fn similar_vendors_across_sources_merge_through_the_queue() {
    let conn = open_in_memory().expect("store");
    let a = vendor(&conn, "Globex Industrial Supplies", "peoplesoft", Some("org-7"));
    key(&conn, a, "peoplesoft", "PS-100");
    let b = vendor(&conn, "Globex Industrial Supply, Inc.", "zycus", Some("org-7"));
    key(&conn, b, "zycus", "ZY-200");

    let report = scan_vendor(&conn, a, &MatchConfig::default()).expect("scan");
    assert_eq!(report.emitted, 1);
    assert_eq!(report.exact, 0);
    assert_eq!(report.enqueued.len(), 1);

    let candidate = queue::require(&conn, report.enqueued[0]).expect("candidate");
    assert_eq!(candidate.match_basis, MatchBasis::Similarity);
    assert_eq!((candidate.vendor_id_a, candidate.vendor_id_b), (a, b));

    let outcome = queue::approve(
        &conn,
        &orchestrator(),
        &AuthToken::new("steward"),
        candidate.candidate_id,
        &ApproveOptions {
            survivor: Some(a),
            ..ApproveOptions::default()
        },
    )
    .expect("approve");
    assert_eq!(outcome.status, MergeStatus::Completed);

    let survivor = store::require_vendor(&conn, a).expect("survivor");
    let absorbed = store::require_vendor(&conn, b).expect("absorbed");
    assert!(survivor.merged_into_vendor_id.is_none());
    assert_eq!(absorbed.merged_into_vendor_id, Some(a));

    let mut resolver = Resolver::new(&conn, 32);
    assert_eq!(
        resolver
            .resolve_key(&KeyRef::new("zycus", "ZY-200"))
            .expect("resolve key"),
        Some(a)
    );

    let snapshots = lineage::snapshots(&conn, outcome.merge_id).expect("snapshots");
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots.iter().filter(|s| s.vendor_id == a).count(), 1);
    assert_eq!(snapshots.iter().filter(|s| s.vendor_id == b).count(), 1);

    // The absorbed vendor is gone from the population; a rescan finds nothing.
    let rescan = scan_vendor(&conn, a, &MatchConfig::default()).expect("rescan");
    assert_eq!(rescan.emitted, 0);
}

#[test]
fn verified_claim_produces_exact_candidate() {
    let conn = open_in_memory().expect("store");
    let a = vendor(&conn, "Initech", "peoplesoft", None);
    key(&conn, a, "peoplesoft", "PS-1");
    let b = vendor(&conn, "Initrode Global", "zycus", None);
    // Same key asserted by b becomes a claim on a's mapping.
    key(&conn, b, "peoplesoft", "PS-1");

    let report = scan_all(&conn, &MatchConfig::default()).expect("scan");
    assert_eq!(report.emitted, 1);
    assert_eq!(report.exact, 1);

    let entries = queue::list(
        &conn,
        &CandidateFilter {
            status: Some(CandidateStatus::Pending),
            ..CandidateFilter::default()
        },
    )
    .expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].match_basis, MatchBasis::ExactKey);
    assert!(entries[0].auto_eligible);
    assert!((entries[0].confidence_score - 1.0).abs() < f64::EPSILON);
}

#[test]
fn auto_eligible_pairs_still_wait_in_the_queue() {
    let conn = open_in_memory().expect("store");
    let a = vendor(&conn, "Acme Holdings LLC", "peoplesoft", Some("org-1"));
    let b = vendor(&conn, "ACME Holdings, Inc.", "zycus", Some("org-1"));

    let report = scan_all(&conn, &MatchConfig::default()).expect("scan");
    assert_eq!(report.enqueued.len(), 1);
    let entry = queue::require(&conn, report.enqueued[0]).expect("entry");
    assert!(entry.auto_eligible);
    assert_eq!(entry.status, CandidateStatus::Pending);

    for id in [a, b] {
        let vendor = store::require_vendor(&conn, id).expect("vendor");
        assert!(vendor.merged_into_vendor_id.is_none());
    }
}

#[test]
fn rescanning_is_idempotent() {
    let conn = open_in_memory().expect("store");
    vendor(&conn, "Acme Holdings", "peoplesoft", None);
    vendor(&conn, "Acme Holdings Inc", "zycus", None);

    let first = scan_all(&conn, &MatchConfig::default()).expect("first scan");
    let second = scan_all(&conn, &MatchConfig::default()).expect("second scan");
    assert_eq!(first.enqueued.len(), 1);
    assert!(second.enqueued.is_empty());
    assert_eq!(second.existing, first.enqueued);

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM vendor_merge_candidate", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn matcher_never_writes() {
    let conn = open_in_memory().expect("store");
    let a = vendor(&conn, "Acme Holdings", "peoplesoft", None);
    vendor(&conn, "Acme Holdings Inc", "zycus", None);
    let before = store::list_canonical(&conn).expect("vendors");

    let population = Population::load(&conn).expect("population");
    let matcher = Matcher::new(MatchConfig::default());
    let subject = population.get(a).expect("subject").clone();
    assert_eq!(matcher.find_candidates(&subject, &population).len(), 1);

    assert_eq!(store::list_canonical(&conn).expect("vendors"), before);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM vendor_merge_candidate", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 0);
}

proptest! {
    #[test]
    fn normalization_is_idempotent(raw in "[A-Za-z&.,' -]{0,40}") {
        if let Some(first) = normalize_name(&raw) {
            let second = normalize_name(first.as_str()).expect("normalized names stay non-empty");
            prop_assert_eq!(second.as_str(), first.as_str());
        }
    }

    #[test]
    fn similarity_is_symmetric_and_bounded(
        left in "[A-Za-z ]{1,24}",
        right in "[A-Za-z ]{1,24}",
        same_org in any::<bool>(),
    ) {
        let config = MatchConfig::default();
        let org_b = if same_org { "org-1" } else { "org-2" };
        let make = |name: &str, org: &str| NameProfile {
            legal: normalize_name(name),
            display: None,
            owner_org_id: Some(org.to_owned()),
        };
        let a = make(&left, "org-1");
        let b = make(&right, org_b);
        match (vendor_similarity(&a, &b, &config), vendor_similarity(&b, &a, &config)) {
            (Some(ab), Some(ba)) => {
                prop_assert!((ab.total - ba.total).abs() < 1e-9);
                prop_assert!((0.0..=1.0).contains(&ab.total));
                prop_assert_eq!(ab.same_org, same_org);
            }
            (None, None) => prop_assert!(!a.has_name() || !b.has_name()),
            _ => prop_assert!(false, "similarity must be symmetric in availability"),
        }
    }
}
