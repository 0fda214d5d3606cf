use super::{VendorId, text_enum};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Vendor lifecycle as owned by the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Draft,
    Active,
    Retired,
}

text_enum!(LifecycleState {
    Draft => "draft",
    Active => "active",
    Retired => "retired",
});

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Draft
    }
}

/// A canonical or absorbed vendor row.
///
/// `merged_into_vendor_id = None` marks a survivor. The merge pointer fields
/// are written only by the merge orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorIdentity {
    pub vendor_id: VendorId,
    pub legal_name: String,
    pub display_name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub risk_tier: Option<String>,
    pub owner_org_id: Option<String>,
    pub source_system: String,
    pub source_record_id: Option<String>,
    pub merged_into_vendor_id: Option<VendorId>,
    pub merged_at_us: Option<i64>,
    pub merged_by: Option<String>,
    pub merge_reason: Option<String>,
    pub created_at_us: i64,
    pub updated_at_us: i64,
}

/// Column list matching [`VendorIdentity::from_row`].
pub const VENDOR_COLUMNS: &str = "vendor_id, legal_name, display_name, lifecycle_state, \
     risk_tier, owner_org_id, source_system, source_record_id, merged_into_vendor_id, \
     merged_at_us, merged_by, merge_reason, created_at_us, updated_at_us";

impl VendorIdentity {
    /// Map a row selected with [`VENDOR_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or has the wrong type.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            vendor_id: row.get(0)?,
            legal_name: row.get(1)?,
            display_name: row.get(2)?,
            lifecycle_state: row.get(3)?,
            risk_tier: row.get(4)?,
            owner_org_id: row.get(5)?,
            source_system: row.get(6)?,
            source_record_id: row.get(7)?,
            merged_into_vendor_id: row.get(8)?,
            merged_at_us: row.get(9)?,
            merged_by: row.get(10)?,
            merge_reason: row.get(11)?,
            created_at_us: row.get(12)?,
            updated_at_us: row.get(13)?,
        })
    }

    #[must_use]
    pub const fn is_canonical(&self) -> bool {
        self.merged_into_vendor_id.is_none()
    }

    /// Read a survivorship-managed field by name.
    #[must_use]
    pub fn field(&self, field: VendorField) -> Option<String> {
        match field {
            VendorField::LegalName => Some(self.legal_name.clone()),
            VendorField::DisplayName => self.display_name.clone(),
            VendorField::LifecycleState => Some(self.lifecycle_state.as_str().to_string()),
            VendorField::RiskTier => self.risk_tier.clone(),
            VendorField::OwnerOrgId => self.owner_org_id.clone(),
        }
    }
}

/// Fields subject to survivorship when two vendors merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorField {
    LegalName,
    DisplayName,
    LifecycleState,
    RiskTier,
    OwnerOrgId,
}

text_enum!(VendorField {
    LegalName => "legal_name",
    DisplayName => "display_name",
    LifecycleState => "lifecycle_state",
    RiskTier => "risk_tier",
    OwnerOrgId => "owner_org_id",
});

impl VendorField {
    /// Every survivorship field, in the order decisions are recorded.
    pub const ALL: [Self; 5] = [
        Self::LegalName,
        Self::DisplayName,
        Self::LifecycleState,
        Self::RiskTier,
        Self::OwnerOrgId,
    ];
}

/// Input for a first sighting or manual entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewVendor {
    pub legal_name: String,
    pub display_name: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub risk_tier: Option<String>,
    pub owner_org_id: Option<String>,
    pub source_system: String,
    pub source_record_id: Option<String>,
}

/// Ordinary field edit. `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VendorFieldUpdate {
    pub legal_name: Option<String>,
    pub display_name: Option<Option<String>>,
    pub lifecycle_state: Option<LifecycleState>,
    pub risk_tier: Option<Option<String>>,
    pub owner_org_id: Option<Option<String>>,
}

/// Verification state of an external identifier mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

text_enum!(VerificationStatus {
    Pending => "pending",
    Verified => "verified",
    Rejected => "rejected",
});

/// `(source_system, source_key)` pair as seen in a source payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRef {
    pub source_system: String,
    pub source_key: String,
}

impl KeyRef {
    pub fn new(source_system: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            source_key: source_key.into(),
        }
    }
}

impl std::fmt::Display for KeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_system, self.source_key)
    }
}

/// Current external-identifier mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorKey {
    pub source_system: String,
    pub source_key: String,
    pub vendor_id: VendorId,
    /// Vendor the key was first mapped to. Never rewritten.
    pub original_vendor_id: VendorId,
    pub is_primary_source: bool,
    pub verification_status: VerificationStatus,
    pub first_seen_at_us: i64,
    pub last_seen_at_us: i64,
}

pub const KEY_COLUMNS: &str = "source_system, source_key, vendor_id, original_vendor_id, \
     is_primary_source, verification_status, first_seen_at_us, last_seen_at_us";

impl VendorKey {
    /// Map a row selected with [`KEY_COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or has the wrong type.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source_system: row.get(0)?,
            source_key: row.get(1)?,
            vendor_id: row.get(2)?,
            original_vendor_id: row.get(3)?,
            is_primary_source: row.get(4)?,
            verification_status: row.get(5)?,
            first_seen_at_us: row.get(6)?,
            last_seen_at_us: row.get(7)?,
        })
    }

    #[must_use]
    pub fn key_ref(&self) -> KeyRef {
        KeyRef::new(&self.source_system, &self.source_key)
    }
}

/// Input for registering an identifier against a vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    pub key: KeyRef,
    pub is_primary_source: bool,
    pub verification_status: VerificationStatus,
}

/// A vendor's assertion of an identifier that is currently mapped elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyClaim {
    pub claim_id: i64,
    pub vendor_id: VendorId,
    pub source_system: String,
    pub source_key: String,
    pub verification_status: VerificationStatus,
    pub observed_at_us: i64,
}

impl KeyClaim {
    #[must_use]
    pub fn key_ref(&self) -> KeyRef {
        KeyRef::new(&self.source_system, &self.source_key)
    }
}
