//! Concurrent merges on a file-backed store, one connection per thread.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use tempfile::TempDir;
use vmerge_core::audit::MemoryAuditSink;
use vmerge_core::auth::{AuthToken, StaticAuthorizer};
use vmerge_core::config::EngineConfig;
use vmerge_core::db::open_store;
use vmerge_core::merge::locks;
use vmerge_core::model::candidate::{CandidateStatus, MatchBasis, MatchCandidate};
use vmerge_core::model::merge::MergeStatus;
use vmerge_core::model::vendor::NewVendor;
use vmerge_core::queue::{self, ApproveOptions};
use vmerge_core::{MergeOrchestrator, MergeOutcome, MergeRequest, Result, VendorId, store};

fn temp_store() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("vmerge.sqlite3");
    open_store(&path).expect("initialize store");
    (dir, path)
}

fn engine() -> MergeOrchestrator {
    MergeOrchestrator::new(
        EngineConfig::default(),
        Arc::new(StaticAuthorizer::new(["steward"])),
        Arc::new(MemoryAuditSink::new()),
    )
}

fn vendors(path: &Path, names: &[&str]) -> Vec<VendorId> {
    let conn = open_store(path).expect("open store");
    names
        .iter()
        .map(|name| {
            store::insert_vendor(
                &conn,
                &NewVendor {
                    legal_name: (*name).into(),
                    source_system: "manual".into(),
                    ..NewVendor::default()
                },
            )
            .expect("insert vendor")
            .vendor_id
        })
        .collect()
}

fn completed_events(path: &Path) -> i64 {
    let conn = open_store(path).expect("open store");
    conn.query_row(
        "SELECT COUNT(*) FROM vendor_merge_event WHERE status = 'completed'",
        [],
        |row| row.get(0),
    )
    .expect("count")
}

/// Run each request on its own thread and connection, released together.
fn race(path: &Path, engine: &MergeOrchestrator, requests: &[MergeRequest]) -> Vec<Result<MergeOutcome>> {
    let barrier = Barrier::new(requests.len());
    std::thread::scope(|scope| {
        let handles: Vec<_> = requests
            .iter()
            .map(|request| {
                let barrier = &barrier;
                scope.spawn(move || {
                    let conn = open_store(path).expect("thread connection");
                    barrier.wait();
                    engine.execute_direct(&conn, &AuthToken::new("steward"), request)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("merge thread"))
            .collect()
    })
}

#[test]
fn same_pair_merges_exactly_once() {
    let (_dir, path) = temp_store();
    let ids = vendors(&path, &["Acme", "Acme Inc"]);
    let (a, b) = (ids[0], ids[1]);
    let engine = engine();

    let results = race(
        &path,
        &engine,
        &[
            MergeRequest::manual(a, b, "first"),
            MergeRequest::manual(a, b, "second"),
        ],
    );

    let completed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(completed, 1, "{results:?}");
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(err.is_conflict(), "loser must see a conflict, got {err}");
    }
    assert_eq!(completed_events(&path), 1);

    let conn = open_store(&path).expect("open store");
    assert_eq!(store::require_vendor(&conn, b).expect("b").merged_into_vendor_id, Some(a));
    assert!(locks::locked_vendors(&conn).expect("locks").is_empty());
}

#[test]
fn overlapping_absorbed_vendor_is_merged_once() {
    let (_dir, path) = temp_store();
    let ids = vendors(&path, &["Acme", "Acme Inc", "Acme LLC"]);
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let engine = engine();

    let results = race(
        &path,
        &engine,
        &[
            MergeRequest::manual(a, b, "into a"),
            MergeRequest::manual(c, b, "into c"),
        ],
    );

    let outcomes: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(outcomes.len(), 1, "{results:?}");
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| e.is_conflict()));

    let conn = open_store(&path).expect("open store");
    let winner = outcomes[0].survivor;
    assert_eq!(store::require_vendor(&conn, b).expect("b").merged_into_vendor_id, Some(winner));
    assert_eq!(completed_events(&path), 1);
}

#[test]
fn concurrent_approvals_of_overlapping_candidates() {
    let (_dir, path) = temp_store();
    let ids = vendors(&path, &["Acme", "Acme Inc", "Acme LLC"]);
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let engine = engine();

    let conn = open_store(&path).expect("open store");
    let first = queue::enqueue(&conn, &MatchCandidate::new(a, b, MatchBasis::Similarity, 0.9, false))
        .expect("enqueue")
        .candidate()
        .candidate_id;
    let second = queue::enqueue(&conn, &MatchCandidate::new(b, c, MatchBasis::Similarity, 0.9, false))
        .expect("enqueue")
        .candidate()
        .candidate_id;
    drop(conn);

    let barrier = Barrier::new(2);
    let results: Vec<Result<MergeOutcome>> = std::thread::scope(|scope| {
        let handles: Vec<_> = [(first, b), (second, b)]
            .into_iter()
            .map(|(candidate_id, absorbed)| {
                let (barrier, engine, path) = (&barrier, &engine, &path);
                scope.spawn(move || {
                    let conn = open_store(path).expect("thread connection");
                    let survivor = if candidate_id == first { a } else { c };
                    barrier.wait();
                    let outcome = queue::approve(
                        &conn,
                        engine,
                        &AuthToken::new("steward"),
                        candidate_id,
                        &ApproveOptions {
                            survivor: Some(survivor),
                            ..ApproveOptions::default()
                        },
                    );
                    if let Ok(outcome) = &outcome {
                        assert_eq!(outcome.absorbed, absorbed);
                    }
                    outcome
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("approve thread"))
            .collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{results:?}");
    assert_eq!(completed_events(&path), 1);
    let conn = open_store(&path).expect("open store");
    assert!(!store::require_vendor(&conn, b).expect("b").is_canonical());

    let statuses: Vec<_> = [first, second]
        .into_iter()
        .map(|id| queue::require(&conn, id).expect("candidate").status)
        .collect();
    assert!(statuses.contains(&CandidateStatus::Approved), "{statuses:?}");
    assert!(statuses.contains(&CandidateStatus::Expired), "{statuses:?}");
    assert!(queue::release_orphaned(&conn, i64::MAX).expect("release").is_empty());
}

#[test]
fn approving_a_pair_after_its_vendor_was_absorbed_closes_it() {
    let (_dir, path) = temp_store();
    let ids = vendors(&path, &["Acme", "Acme Inc", "Acme LLC"]);
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let engine = engine();
    let token = AuthToken::new("steward");

    let conn = open_store(&path).expect("open store");
    let late = queue::enqueue(&conn, &MatchCandidate::new(b, c, MatchBasis::Similarity, 0.9, false))
        .expect("enqueue")
        .candidate()
        .candidate_id;
    engine
        .execute_direct(&conn, &token, &MergeRequest::manual(a, b, "dup"))
        .expect("merge a and b");
    queue::reopen(&conn, late, "steward").expect("reopen");

    let err = queue::approve(&conn, &engine, &token, late, &ApproveOptions::default())
        .expect_err("b is absorbed");
    assert!(err.is_conflict(), "{err}");
    assert_eq!(
        queue::require(&conn, late).expect("candidate").status,
        CandidateStatus::Expired
    );
}

#[test]
fn disjoint_pairs_all_complete() {
    let (_dir, path) = temp_store();
    let ids = vendors(
        &path,
        &["A1", "A2", "B1", "B2", "C1", "C2", "D1", "D2"],
    );
    let engine = engine();
    let requests: Vec<_> = ids
        .chunks(2)
        .map(|pair| MergeRequest::manual(pair[0], pair[1], "duplicate"))
        .collect();

    let results = race(&path, &engine, &requests);
    for result in &results {
        let outcome = result.as_ref().expect("disjoint merge");
        assert_eq!(outcome.status, MergeStatus::Completed);
    }
    assert_eq!(completed_events(&path), 4);
}
