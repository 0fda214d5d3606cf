use super::{CandidateId, MergeId, VendorId, text_enum};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Why two vendors were paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    /// Shared verified `(source_system, source_key)`.
    ExactKey,
    /// Name similarity above the candidate floor.
    Similarity,
}

text_enum!(MatchBasis {
    ExactKey => "exact_key",
    Similarity => "similarity",
});

/// Queue disposition of a candidate pair.
///
/// A reopened candidate returns to `Pending`; `reopen_count` records that it
/// was reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

text_enum!(CandidateStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Expired => "expired",
});

impl CandidateStatus {
    /// Open entries block a second entry for the same pair.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

/// A pair emitted by the matcher, not yet in the queue.
///
/// The pair is always ordered `vendor_id_a < vendor_id_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub vendor_id_a: VendorId,
    pub vendor_id_b: VendorId,
    pub match_basis: MatchBasis,
    pub confidence_score: f64,
    pub auto_eligible: bool,
}

impl MatchCandidate {
    /// Build a candidate with the pair put in canonical order.
    #[must_use]
    pub fn new(
        x: VendorId,
        y: VendorId,
        match_basis: MatchBasis,
        confidence_score: f64,
        auto_eligible: bool,
    ) -> Self {
        let (vendor_id_a, vendor_id_b) = ordered_pair(x, y);
        Self {
            vendor_id_a,
            vendor_id_b,
            match_basis,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            auto_eligible,
        }
    }

    #[must_use]
    pub const fn pair(&self) -> (VendorId, VendorId) {
        (self.vendor_id_a, self.vendor_id_b)
    }
}

/// Order two vendor ids so the smaller comes first.
#[must_use]
pub fn ordered_pair(x: VendorId, y: VendorId) -> (VendorId, VendorId) {
    if x <= y { (x, y) } else { (y, x) }
}

/// A stewardship queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub candidate_id: CandidateId,
    pub vendor_id_a: VendorId,
    pub vendor_id_b: VendorId,
    pub match_basis: MatchBasis,
    pub confidence_score: f64,
    pub auto_eligible: bool,
    pub status: CandidateStatus,
    pub detected_at_us: i64,
    pub updated_at_us: i64,
    pub decided_by: Option<String>,
    pub decided_at_us: Option<i64>,
    pub decision_note: Option<String>,
    pub reopen_count: u32,
    pub merge_id: Option<MergeId>,
}

pub const CANDIDATE_COLUMNS: &str = "candidate_id, vendor_id_a, vendor_id_b, match_basis, \
     confidence_score, auto_eligible, status, detected_at_us, updated_at_us, decided_by, \
     decided_at_us, decision_note, reopen_count, merge_id";

impl MergeCandidate {
    /// Map a row selected with [`CANDIDATE_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or has the wrong type.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            candidate_id: row.get(0)?,
            vendor_id_a: row.get(1)?,
            vendor_id_b: row.get(2)?,
            match_basis: row.get(3)?,
            confidence_score: row.get(4)?,
            auto_eligible: row.get(5)?,
            status: row.get(6)?,
            detected_at_us: row.get(7)?,
            updated_at_us: row.get(8)?,
            decided_by: row.get(9)?,
            decided_at_us: row.get(10)?,
            decision_note: row.get(11)?,
            reopen_count: row.get(12)?,
            merge_id: row.get(13)?,
        })
    }
}
