//! Canonical SQLite schema for the vendor identity store.
//!
//! - `vendor` holds every identity ever seen; `merged_into_vendor_id` forms a
//!   forest of single-parent chains whose roots are the survivors
//! - `vendor_key` maps `(source_system, source_key)` to its current owner and
//!   `vendor_key_claim` keeps assertions of keys already owned elsewhere
//! - `vendor_merge_candidate` is the stewardship queue
//! - `vendor_merge_event` and its member, snapshot and decision tables are the
//!   append-only merge lineage
//! - `vendor_merge_lock` serializes merges per vendor
//!
//! Write-once and never-delete rules are enforced with triggers so that no
//! caller, including the surrounding application, can rewrite history.

/// Migration v1: identity, queue, lineage, and lock tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, created_at_us)
VALUES (1, 1, CAST((julianday('now') - 2440587.5) * 86400000000 AS INTEGER));

CREATE TABLE IF NOT EXISTS vendor (
    vendor_id INTEGER PRIMARY KEY AUTOINCREMENT,
    legal_name TEXT NOT NULL,
    display_name TEXT,
    lifecycle_state TEXT NOT NULL DEFAULT 'draft'
        CHECK (lifecycle_state IN ('draft', 'active', 'retired')),
    risk_tier TEXT,
    owner_org_id TEXT,
    source_system TEXT NOT NULL CHECK (length(trim(source_system)) > 0),
    source_record_id TEXT,
    merged_into_vendor_id INTEGER REFERENCES vendor(vendor_id),
    merged_at_us INTEGER,
    merged_by TEXT,
    merge_reason TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (merged_into_vendor_id IS NULL OR merged_into_vendor_id <> vendor_id)
);

CREATE TRIGGER IF NOT EXISTS vendor_never_deleted
BEFORE DELETE ON vendor
BEGIN
    SELECT RAISE(ABORT, 'vendor rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS vendor_merge_pointer_is_final
BEFORE UPDATE OF merged_into_vendor_id ON vendor
WHEN old.merged_into_vendor_id IS NOT NULL
BEGIN
    SELECT RAISE(ABORT, 'merged_into_vendor_id is set once');
END;

CREATE TABLE IF NOT EXISTS vendor_key (
    source_system TEXT NOT NULL CHECK (length(trim(source_system)) > 0),
    source_key TEXT NOT NULL CHECK (length(trim(source_key)) > 0),
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    original_vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    is_primary_source INTEGER NOT NULL DEFAULT 0 CHECK (is_primary_source IN (0, 1)),
    verification_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (verification_status IN ('pending', 'verified', 'rejected')),
    first_seen_at_us INTEGER NOT NULL,
    last_seen_at_us INTEGER NOT NULL,
    PRIMARY KEY (source_system, source_key)
);

CREATE TRIGGER IF NOT EXISTS vendor_key_never_deleted
BEFORE DELETE ON vendor_key
BEGIN
    SELECT RAISE(ABORT, 'vendor keys are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS vendor_key_identity_is_fixed
BEFORE UPDATE OF source_system, source_key, original_vendor_id ON vendor_key
BEGIN
    SELECT RAISE(ABORT, 'vendor key identity is immutable');
END;

CREATE TABLE IF NOT EXISTS vendor_key_claim (
    claim_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    source_system TEXT NOT NULL,
    source_key TEXT NOT NULL,
    verification_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (verification_status IN ('pending', 'verified', 'rejected')),
    observed_at_us INTEGER NOT NULL,
    UNIQUE (vendor_id, source_system, source_key)
);

CREATE TABLE IF NOT EXISTS vendor_merge_event (
    merge_id INTEGER PRIMARY KEY AUTOINCREMENT,
    survivor_vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    absorbed_vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    status TEXT NOT NULL CHECK (status IN (
        'proposed', 'validated', 'snapshot_captured', 'survivorship_resolved',
        'repointed', 'completed', 'validation_failed', 'repoint_failed',
        'rolled_back', 'cancelled'
    )),
    merge_reason TEXT NOT NULL,
    merge_method TEXT NOT NULL CHECK (merge_method IN ('manual', 'deterministic', 'similarity')),
    confidence_score REAL CHECK (confidence_score IS NULL OR confidence_score BETWEEN 0.0 AND 1.0),
    originating_candidate_id INTEGER,
    actor TEXT NOT NULL,
    overrides_json TEXT NOT NULL DEFAULT '[]',
    failed_state TEXT,
    failure_reason TEXT,
    started_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    completed_at_us INTEGER,
    CHECK (survivor_vendor_id <> absorbed_vendor_id)
);

CREATE TRIGGER IF NOT EXISTS vendor_merge_event_terminal_is_final
BEFORE UPDATE ON vendor_merge_event
WHEN old.status IN ('completed', 'rolled_back', 'cancelled')
BEGIN
    SELECT RAISE(ABORT, 'terminal merge events are immutable');
END;

CREATE TRIGGER IF NOT EXISTS vendor_merge_event_never_deleted
BEFORE DELETE ON vendor_merge_event
BEGIN
    SELECT RAISE(ABORT, 'merge events are never deleted');
END;

CREATE TABLE IF NOT EXISTS vendor_merge_member (
    merge_id INTEGER NOT NULL REFERENCES vendor_merge_event(merge_id),
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    role TEXT NOT NULL CHECK (role IN ('survivor', 'absorbed')),
    pre_merge_keys_json TEXT NOT NULL,
    PRIMARY KEY (merge_id, vendor_id)
);

CREATE TABLE IF NOT EXISTS vendor_merge_snapshot (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    merge_id INTEGER NOT NULL REFERENCES vendor_merge_event(merge_id),
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    role TEXT NOT NULL CHECK (role IN ('survivor', 'absorbed')),
    snapshot_json TEXT NOT NULL,
    digest TEXT NOT NULL,
    captured_at_us INTEGER NOT NULL,
    UNIQUE (merge_id, vendor_id)
);

CREATE TABLE IF NOT EXISTS vendor_survivorship_decision (
    decision_id INTEGER PRIMARY KEY AUTOINCREMENT,
    merge_id INTEGER NOT NULL REFERENCES vendor_merge_event(merge_id),
    field_name TEXT NOT NULL,
    chosen_vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    chosen_value TEXT,
    survivor_value TEXT,
    absorbed_value TEXT,
    decision_method TEXT NOT NULL CHECK (decision_method IN (
        'source_priority', 'most_recent', 'survivor_default', 'non_empty', 'manual'
    )),
    note TEXT,
    decided_at_us INTEGER NOT NULL,
    UNIQUE (merge_id, field_name)
);

CREATE TRIGGER IF NOT EXISTS vendor_merge_member_write_once
BEFORE UPDATE ON vendor_merge_member
BEGIN
    SELECT RAISE(ABORT, 'merge members are write-once');
END;

CREATE TRIGGER IF NOT EXISTS vendor_merge_member_never_deleted
BEFORE DELETE ON vendor_merge_member
BEGIN
    SELECT RAISE(ABORT, 'merge members are write-once');
END;

CREATE TRIGGER IF NOT EXISTS vendor_merge_snapshot_write_once
BEFORE UPDATE ON vendor_merge_snapshot
BEGIN
    SELECT RAISE(ABORT, 'merge snapshots are write-once');
END;

CREATE TRIGGER IF NOT EXISTS vendor_merge_snapshot_never_deleted
BEFORE DELETE ON vendor_merge_snapshot
BEGIN
    SELECT RAISE(ABORT, 'merge snapshots are write-once');
END;

CREATE TRIGGER IF NOT EXISTS vendor_survivorship_decision_write_once
BEFORE UPDATE ON vendor_survivorship_decision
BEGIN
    SELECT RAISE(ABORT, 'survivorship decisions are write-once');
END;

CREATE TRIGGER IF NOT EXISTS vendor_survivorship_decision_never_deleted
BEFORE DELETE ON vendor_survivorship_decision
BEGIN
    SELECT RAISE(ABORT, 'survivorship decisions are write-once');
END;

CREATE TABLE IF NOT EXISTS vendor_merge_candidate (
    candidate_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id_a INTEGER NOT NULL REFERENCES vendor(vendor_id),
    vendor_id_b INTEGER NOT NULL REFERENCES vendor(vendor_id),
    match_basis TEXT NOT NULL CHECK (match_basis IN ('exact_key', 'similarity')),
    confidence_score REAL NOT NULL CHECK (confidence_score BETWEEN 0.0 AND 1.0),
    auto_eligible INTEGER NOT NULL DEFAULT 0 CHECK (auto_eligible IN (0, 1)),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'approved', 'rejected', 'expired')),
    detected_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    decided_by TEXT,
    decided_at_us INTEGER,
    decision_note TEXT,
    reopen_count INTEGER NOT NULL DEFAULT 0,
    merge_id INTEGER REFERENCES vendor_merge_event(merge_id),
    CHECK (vendor_id_a < vendor_id_b)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_candidate_open_pair
    ON vendor_merge_candidate(vendor_id_a, vendor_id_b)
    WHERE status IN ('pending', 'approved');

CREATE TABLE IF NOT EXISTS vendor_merge_lock (
    vendor_id INTEGER PRIMARY KEY REFERENCES vendor(vendor_id),
    merge_id INTEGER NOT NULL REFERENCES vendor_merge_event(merge_id),
    acquired_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vendor_merged_into
    ON vendor(merged_into_vendor_id);

CREATE INDEX IF NOT EXISTS idx_vendor_owner_org
    ON vendor(owner_org_id);

CREATE INDEX IF NOT EXISTS idx_vendor_key_vendor
    ON vendor_key(vendor_id);

CREATE INDEX IF NOT EXISTS idx_vendor_key_claim_key
    ON vendor_key_claim(source_system, source_key);

CREATE INDEX IF NOT EXISTS idx_candidate_status_updated
    ON vendor_merge_candidate(status, updated_at_us);

CREATE INDEX IF NOT EXISTS idx_merge_event_status
    ON vendor_merge_event(status, updated_at_us);

CREATE INDEX IF NOT EXISTS idx_merge_event_survivor
    ON vendor_merge_event(survivor_vendor_id);

CREATE INDEX IF NOT EXISTS idx_merge_event_absorbed
    ON vendor_merge_event(absorbed_vendor_id);
";

/// Migration v2: dependent tables of the surrounding vendor-master app.
///
/// These are not engine-owned. They are created here so a fresh store has
/// the standard layout that the default repoint configuration enumerates.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS vendor_offering (
    offering_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    name TEXT NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS vendor_contract (
    contract_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    title TEXT NOT NULL,
    starts_on TEXT,
    ends_on TEXT
);

CREATE TABLE IF NOT EXISTS vendor_demo (
    demo_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    title TEXT NOT NULL,
    scheduled_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS vendor_contact (
    contact_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    name TEXT NOT NULL,
    email TEXT
);

CREATE TABLE IF NOT EXISTS vendor_owner_assignment (
    assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    owner_user_id TEXT NOT NULL,
    owner_role TEXT NOT NULL DEFAULT 'business_owner'
);

CREATE TABLE IF NOT EXISTS vendor_project_link (
    link_id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor_id INTEGER NOT NULL REFERENCES vendor(vendor_id),
    project_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vendor_offering_vendor ON vendor_offering(vendor_id);
CREATE INDEX IF NOT EXISTS idx_vendor_contract_vendor ON vendor_contract(vendor_id);
CREATE INDEX IF NOT EXISTS idx_vendor_demo_vendor ON vendor_demo(vendor_id);
CREATE INDEX IF NOT EXISTS idx_vendor_contact_vendor ON vendor_contact(vendor_id);
CREATE INDEX IF NOT EXISTS idx_vendor_owner_assignment_vendor ON vendor_owner_assignment(vendor_id);
CREATE INDEX IF NOT EXISTS idx_vendor_project_link_vendor ON vendor_project_link(vendor_id);
";

/// Tables owned by the engine. Repoint gap detection skips these.
pub const ENGINE_TABLES: &[&str] = &[
    "store_meta",
    "vendor",
    "vendor_key",
    "vendor_key_claim",
    "vendor_merge_candidate",
    "vendor_merge_event",
    "vendor_merge_member",
    "vendor_merge_snapshot",
    "vendor_survivorship_decision",
    "vendor_merge_lock",
];

/// Dependent tables created by migration v2, as `(table, vendor column)`.
pub const DEFAULT_DEPENDENTS: &[(&str, &str)] = &[
    ("vendor_offering", "vendor_id"),
    ("vendor_contract", "vendor_id"),
    ("vendor_demo", "vendor_id"),
    ("vendor_contact", "vendor_id"),
    ("vendor_owner_assignment", "vendor_id"),
    ("vendor_project_link", "vendor_id"),
];

/// Indexes expected by resolver, queue, and recovery query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_candidate_open_pair",
    "idx_vendor_merged_into",
    "idx_vendor_owner_org",
    "idx_vendor_key_vendor",
    "idx_vendor_key_claim_key",
    "idx_candidate_status_updated",
    "idx_merge_event_status",
    "idx_merge_event_survivor",
    "idx_merge_event_absorbed",
];
