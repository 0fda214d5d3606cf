use crate::model::merge::MergeStatus;
use crate::model::{CandidateId, MergeId, VendorId};
use std::fmt;

/// Machine-readable error codes for operator and caller decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    VendorNotFound,
    CandidateNotFound,
    MergeNotFound,
    InvalidInput,
    InvalidTransition,
    VendorAlreadyMerged,
    MergeInProgress,
    LockContention,
    DuplicateCandidate,
    RepointConfigurationGap,
    RepointFailed,
    CorruptMergeChain,
    Unauthorized,
    StorageFailure,
    SerializationFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::VendorNotFound => "E2001",
            Self::CandidateNotFound => "E2002",
            Self::MergeNotFound => "E2003",
            Self::InvalidInput => "E2004",
            Self::InvalidTransition => "E2005",
            Self::VendorAlreadyMerged => "E3001",
            Self::MergeInProgress => "E3002",
            Self::LockContention => "E3003",
            Self::DuplicateCandidate => "E3004",
            Self::RepointConfigurationGap => "E4001",
            Self::RepointFailed => "E4002",
            Self::CorruptMergeChain => "E4003",
            Self::Unauthorized => "E5001",
            Self::StorageFailure => "E6001",
            Self::SerializationFailure => "E6002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Vendor store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::VendorNotFound => "Vendor not found",
            Self::CandidateNotFound => "Merge candidate not found",
            Self::MergeNotFound => "Merge event not found",
            Self::InvalidInput => "Invalid input",
            Self::InvalidTransition => "Invalid state transition",
            Self::VendorAlreadyMerged => "Vendor already merged",
            Self::MergeInProgress => "Merge already in progress",
            Self::LockContention => "Lock contention",
            Self::DuplicateCandidate => "Candidate already open for this pair",
            Self::RepointConfigurationGap => "Dependent table not enumerated for repointing",
            Self::RepointFailed => "Repointing failed and was rolled back",
            Self::CorruptMergeChain => "Corrupt merge chain",
            Self::Unauthorized => "Actor not permitted to execute merges",
            Self::StorageFailure => "Storage failure",
            Self::SerializationFailure => "Snapshot serialization failure",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `vmerge init` to create the vendor store."),
            Self::ConfigParseError => Some("Fix syntax in vmerge.toml and retry."),
            Self::VendorNotFound | Self::CandidateNotFound | Self::MergeNotFound => None,
            Self::InvalidInput => Some("Check the supplied ids and values."),
            Self::InvalidTransition => Some(
                "Candidates move pending -> approved|rejected|expired; reopen only from rejected or expired.",
            ),
            Self::VendorAlreadyMerged => {
                Some("Resolve the vendor to its survivor and merge that identity instead.")
            }
            Self::MergeInProgress | Self::LockContention => {
                Some("Retry after the conflicting merge finishes.")
            }
            Self::DuplicateCandidate => Some("Dispose of the existing open candidate first."),
            Self::RepointConfigurationGap => {
                Some("Add the table to [[repoint.dependents]] in vmerge.toml and retry the merge.")
            }
            Self::RepointFailed => Some("Inspect the merge event's failure reason, fix, and retry."),
            Self::CorruptMergeChain => {
                Some("Inspect merged_into_vendor_id for the reported chain; do not guess a survivor.")
            }
            Self::Unauthorized => Some("Ask an administrator for merge permission."),
            Self::StorageFailure => Some("Retry once. If persistent, check the database file."),
            Self::SerializationFailure => Some("Report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Bad or missing input. No state has changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("vendor {0} not found")]
    VendorNotFound(VendorId),
    #[error("candidate {0} not found")]
    CandidateNotFound(CandidateId),
    #[error("merge event {0} not found")]
    MergeNotFound(MergeId),
    #[error("vendor {0} cannot be merged into itself")]
    SelfMerge(VendorId),
    #[error("survivor {survivor} is not part of candidate {candidate_id}")]
    SurvivorNotInPair {
        candidate_id: CandidateId,
        survivor: VendorId,
    },
    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("{0}")]
    InvalidInput(String),
}

/// The target is busy or already changed. The caller may retry later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("vendor {vendor_id} is already merged into {merged_into}")]
    VendorAlreadyMerged {
        vendor_id: VendorId,
        merged_into: VendorId,
    },
    #[error("vendor {vendor_id} is locked by in-flight merge {merge_id}")]
    MergeInProgress {
        vendor_id: VendorId,
        merge_id: MergeId,
    },
    #[error("store still contended after {attempts} attempts")]
    LockContention { attempts: u32 },
    #[error("candidate {existing} is already open for this pair")]
    DuplicateCandidate { existing: CandidateId },
}

/// Engine error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Conflict(#[from] ConflictError),

    #[error("{table}.{column} references vendor but is not enumerated for repointing")]
    RepointConfigurationGap {
        merge_id: Option<MergeId>,
        table: String,
        column: String,
    },

    #[error("merge {merge_id} ({absorbed} -> {survivor}) failed in {state}: {reason}")]
    RepointFailed {
        merge_id: MergeId,
        survivor: VendorId,
        absorbed: VendorId,
        state: MergeStatus,
        reason: String,
    },

    #[error("merge chain from {vendor_id} is corrupt ({fault}) after {chain:?}")]
    CorruptMergeChain {
        vendor_id: VendorId,
        chain: Vec<VendorId>,
        fault: ChainFault,
    },

    #[error("actor '{actor}' is not permitted to execute merges")]
    Unauthorized { actor: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the resolver found wrong with a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFault {
    Cycle,
    TooDeep { max_depth: usize },
    DanglingPointer,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => f.write_str("cycle"),
            Self::TooDeep { max_depth } => write!(f, "deeper than {max_depth}"),
            Self::DanglingPointer => f.write_str("dangling pointer"),
        }
    }
}

impl MergeError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(err) => match err {
                ValidationError::VendorNotFound(_) => ErrorCode::VendorNotFound,
                ValidationError::CandidateNotFound(_) => ErrorCode::CandidateNotFound,
                ValidationError::MergeNotFound(_) => ErrorCode::MergeNotFound,
                ValidationError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                ValidationError::SelfMerge(_)
                | ValidationError::SurvivorNotInPair { .. }
                | ValidationError::InvalidInput(_) => ErrorCode::InvalidInput,
            },
            Self::Conflict(err) => match err {
                ConflictError::VendorAlreadyMerged { .. } => ErrorCode::VendorAlreadyMerged,
                ConflictError::MergeInProgress { .. } => ErrorCode::MergeInProgress,
                ConflictError::LockContention { .. } => ErrorCode::LockContention,
                ConflictError::DuplicateCandidate { .. } => ErrorCode::DuplicateCandidate,
            },
            Self::RepointConfigurationGap { .. } => ErrorCode::RepointConfigurationGap,
            Self::RepointFailed { .. } => ErrorCode::RepointFailed,
            Self::CorruptMergeChain { .. } => ErrorCode::CorruptMergeChain,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Serialization(_) => ErrorCode::SerializationFailure,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// True for SQLite busy/locked errors worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(err) if is_transient_sqlite(err))
    }
}

/// True when SQLite reports lock contention rather than a real failure.
#[must_use]
pub fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub type Result<T, E = MergeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::VendorNotFound,
            ErrorCode::CandidateNotFound,
            ErrorCode::MergeNotFound,
            ErrorCode::InvalidInput,
            ErrorCode::InvalidTransition,
            ErrorCode::VendorAlreadyMerged,
            ErrorCode::MergeInProgress,
            ErrorCode::LockContention,
            ErrorCode::DuplicateCandidate,
            ErrorCode::RepointConfigurationGap,
            ErrorCode::RepointFailed,
            ErrorCode::CorruptMergeChain,
            ErrorCode::Unauthorized,
            ErrorCode::StorageFailure,
            ErrorCode::SerializationFailure,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn merge_errors_map_to_codes() {
        let err = MergeError::from(ConflictError::VendorAlreadyMerged {
            vendor_id: VendorId(2),
            merged_into: VendorId(1),
        });
        assert_eq!(err.code(), ErrorCode::VendorAlreadyMerged);
        assert!(err.is_conflict());
        assert!(err.hint().is_some());

        let err = MergeError::from(ValidationError::VendorNotFound(VendorId(5)));
        assert_eq!(err.code(), ErrorCode::VendorNotFound);
        assert!(!err.is_conflict());
    }

    #[test]
    fn busy_storage_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(MergeError::Storage(busy).is_transient());
        assert!(!MergeError::Storage(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }
}
