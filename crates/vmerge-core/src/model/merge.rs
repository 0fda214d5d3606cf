use super::candidate::MatchBasis;
use super::vendor::{KeyClaim, KeyRef, VendorField, VendorIdentity, VendorKey};
use super::{CandidateId, MergeId, VendorId, text_enum};
use serde::{Deserialize, Serialize};

/// Merge event state machine.
///
/// Happy path: `proposed -> validated -> snapshot_captured ->
/// survivorship_resolved -> repointed -> completed`. Failures pass through
/// `validation_failed` or `repoint_failed` into `rolled_back`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Proposed,
    Validated,
    SnapshotCaptured,
    SurvivorshipResolved,
    Repointed,
    Completed,
    ValidationFailed,
    RepointFailed,
    RolledBack,
    Cancelled,
}

text_enum!(MergeStatus {
    Proposed => "proposed",
    Validated => "validated",
    SnapshotCaptured => "snapshot_captured",
    SurvivorshipResolved => "survivorship_resolved",
    Repointed => "repointed",
    Completed => "completed",
    ValidationFailed => "validation_failed",
    RepointFailed => "repoint_failed",
    RolledBack => "rolled_back",
    Cancelled => "cancelled",
});

/// Statuses a persisted event can be left in by a crash.
pub const IN_FLIGHT_STATUSES: [MergeStatus; 4] = [
    MergeStatus::Proposed,
    MergeStatus::Validated,
    MergeStatus::SnapshotCaptured,
    MergeStatus::SurvivorshipResolved,
];

impl MergeStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Cancelled)
    }

    /// Cancellation is legal only before snapshots are taken.
    #[must_use]
    pub const fn can_cancel(self) -> bool {
        matches!(self, Self::Proposed | Self::Validated)
    }

    /// Validate whether a transition from self to `target` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Proposed, Self::Validated | Self::ValidationFailed | Self::Cancelled)
                | (
                    Self::Validated,
                    Self::SnapshotCaptured
                        | Self::ValidationFailed
                        | Self::Cancelled
                        | Self::RolledBack
                )
                | (
                    Self::SnapshotCaptured,
                    Self::SurvivorshipResolved | Self::RepointFailed | Self::RolledBack
                )
                | (
                    Self::SurvivorshipResolved,
                    Self::Repointed | Self::RepointFailed | Self::RolledBack
                )
                | (Self::Repointed, Self::Completed | Self::RepointFailed)
                | (Self::ValidationFailed | Self::RepointFailed, Self::RolledBack)
        )
    }
}

/// How a merge was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Manual,
    Deterministic,
    Similarity,
}

text_enum!(MergeMethod {
    Manual => "manual",
    Deterministic => "deterministic",
    Similarity => "similarity",
});

impl From<MatchBasis> for MergeMethod {
    fn from(basis: MatchBasis) -> Self {
        match basis {
            MatchBasis::ExactKey => Self::Deterministic,
            MatchBasis::Similarity => Self::Similarity,
        }
    }
}

/// Reviewer-supplied value that replaces the automatic survivorship choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOverride {
    pub field: VendorField,
    pub value: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Persisted merge event header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub merge_id: MergeId,
    pub survivor_vendor_id: VendorId,
    pub absorbed_vendor_id: VendorId,
    pub status: MergeStatus,
    pub merge_reason: String,
    pub merge_method: MergeMethod,
    pub confidence_score: Option<f64>,
    pub originating_candidate_id: Option<CandidateId>,
    pub actor: String,
    pub overrides: Vec<FieldOverride>,
    pub failed_state: Option<MergeStatus>,
    pub failure_reason: Option<String>,
    pub started_at_us: i64,
    pub updated_at_us: i64,
    pub completed_at_us: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Survivor,
    Absorbed,
}

text_enum!(MemberRole {
    Survivor => "survivor",
    Absorbed => "absorbed",
});

/// Participant of a merge with its identifiers as they were before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMember {
    pub merge_id: MergeId,
    pub vendor_id: VendorId,
    pub role: MemberRole,
    pub pre_merge_keys: Vec<KeyRef>,
}

/// Full pre-mutation state of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub vendor: VendorIdentity,
    pub keys: Vec<VendorKey>,
    pub claims: Vec<KeyClaim>,
}

/// Write-once snapshot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSnapshot {
    pub snapshot_id: i64,
    pub merge_id: MergeId,
    pub vendor_id: VendorId,
    pub role: MemberRole,
    pub record: SnapshotRecord,
    /// blake3 hex digest of the stored JSON document.
    pub digest: String,
    pub captured_at_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    SourcePriority,
    MostRecent,
    SurvivorDefault,
    NonEmpty,
    Manual,
}

text_enum!(DecisionMethod {
    SourcePriority => "source_priority",
    MostRecent => "most_recent",
    SurvivorDefault => "survivor_default",
    NonEmpty => "non_empty",
    Manual => "manual",
});

/// Which value won for one conflicting field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurvivorshipDecision {
    pub field: VendorField,
    pub chosen_vendor_id: VendorId,
    pub chosen_value: Option<String>,
    pub survivor_value: Option<String>,
    pub absorbed_value: Option<String>,
    pub decision_method: DecisionMethod,
    pub note: Option<String>,
}
