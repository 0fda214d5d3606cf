//! Name similarity scoring.
//!
//! The score of one name pairing blends token overlap with edit distance:
//!
//! ```text
//! token_weight * jaccard(tokens) + (1 - token_weight) * normalized_levenshtein(full)
//! ```
//!
//! Vendor similarity is the best pairing across legal and display names, plus
//! an organizational bonus when both vendors share an owner, clamped to
//! `[0.0, 1.0]`.

use crate::normalize::{NormalizedName, normalize_name};
use std::collections::BTreeSet;
use vmerge_core::config::MatchConfig;
use vmerge_core::model::vendor::VendorIdentity;

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`. Two empty sets score `0.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Blended score of two normalized names.
#[must_use]
pub fn name_score(a: &NormalizedName, b: &NormalizedName, token_weight: f64) -> f64 {
    let weight = token_weight.clamp(0.0, 1.0);
    let tokens = jaccard(&a.token_set(), &b.token_set());
    let edit = strsim::normalized_levenshtein(a.as_str(), b.as_str());
    weight.mul_add(tokens, (1.0 - weight) * edit)
}

/// The comparable parts of a vendor, normalized once per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameProfile {
    pub legal: Option<NormalizedName>,
    pub display: Option<NormalizedName>,
    pub owner_org_id: Option<String>,
}

impl NameProfile {
    #[must_use]
    pub fn of(vendor: &VendorIdentity) -> Self {
        Self {
            legal: normalize_name(&vendor.legal_name),
            display: vendor.display_name.as_deref().and_then(normalize_name),
            owner_org_id: vendor
                .owner_org_id
                .as_deref()
                .map(str::trim)
                .filter(|org| !org.is_empty())
                .map(str::to_owned),
        }
    }

    /// Whether any name survived normalization.
    #[must_use]
    pub const fn has_name(&self) -> bool {
        self.legal.is_some() || self.display.is_some()
    }

    fn names(&self) -> impl Iterator<Item = &NormalizedName> {
        self.legal.iter().chain(self.display.iter())
    }
}

/// Breakdown of a vendor pair's similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityScore {
    /// Best pairing before the bonus.
    pub name: f64,
    /// Whether the organizational bonus applied.
    pub same_org: bool,
    /// Final clamped score.
    pub total: f64,
}

/// Score two vendors. `None` when either side has no usable name.
#[must_use]
pub fn vendor_similarity(
    a: &NameProfile,
    b: &NameProfile,
    config: &MatchConfig,
) -> Option<SimilarityScore> {
    let name = a
        .names()
        .flat_map(|left| b.names().map(move |right| (left, right)))
        .map(|(left, right)| name_score(left, right, config.token_weight))
        .reduce(f64::max)?;

    let same_org = matches!((&a.owner_org_id, &b.owner_org_id), (Some(x), Some(y)) if x == y);
    let bonus = if same_org { config.org_bonus } else { 0.0 };
    Some(SimilarityScore {
        name,
        same_org,
        total: (name + bonus).clamp(0.0, 1.0),
    })
}
