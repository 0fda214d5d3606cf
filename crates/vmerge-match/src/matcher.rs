//! Duplicate detection over a loaded vendor population.
//!
//! A [`Matcher`] runs its strategies in order. The default set runs the
//! deterministic key pass first; a pair it matches is not re-scored by the
//! similarity pass.
//!
//! The matcher only reads. Emitted [`MatchCandidate`]s are handed to the
//! stewardship queue by [`crate::scan`].

use crate::similarity::{NameProfile, vendor_similarity};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use vmerge_core::config::MatchConfig;
use vmerge_core::merge::locks;
use vmerge_core::model::candidate::{MatchBasis, MatchCandidate};
use vmerge_core::model::vendor::{KeyClaim, KeyRef, VendorIdentity, VendorKey, VerificationStatus};
use vmerge_core::model::{MergeId, VendorId};
use vmerge_core::store;

// ---------------------------------------------------------------------------
// Population
// ---------------------------------------------------------------------------

/// The vendors a subject is compared against, with their identifiers.
#[derive(Debug, Clone, Default)]
pub struct Population {
    vendors: Vec<VendorIdentity>,
    profiles: HashMap<VendorId, NameProfile>,
    verified_keys: HashMap<VendorId, Vec<KeyRef>>,
    verified_claims: HashMap<VendorId, Vec<KeyRef>>,
    locked: HashMap<VendorId, MergeId>,
}

impl Population {
    /// Build a population from already-loaded rows.
    ///
    /// Only verified keys and claims take part in the deterministic pass.
    #[must_use]
    pub fn new(
        vendors: Vec<VendorIdentity>,
        keys: &HashMap<VendorId, Vec<VendorKey>>,
        claims: &HashMap<VendorId, Vec<KeyClaim>>,
        locked: impl IntoIterator<Item = (VendorId, MergeId)>,
    ) -> Self {
        let profiles = vendors
            .iter()
            .map(|vendor| (vendor.vendor_id, NameProfile::of(vendor)))
            .collect();
        let verified_keys = keys
            .iter()
            .map(|(vendor_id, keys)| {
                let refs = keys
                    .iter()
                    .filter(|key| key.verification_status == VerificationStatus::Verified)
                    .map(VendorKey::key_ref)
                    .collect();
                (*vendor_id, refs)
            })
            .collect();
        let verified_claims = claims
            .iter()
            .map(|(vendor_id, claims)| {
                let refs = claims
                    .iter()
                    .filter(|claim| claim.verification_status == VerificationStatus::Verified)
                    .map(KeyClaim::key_ref)
                    .collect();
                (*vendor_id, refs)
            })
            .collect();
        Self {
            vendors,
            profiles,
            verified_keys,
            verified_claims,
            locked: locked.into_iter().collect(),
        }
    }

    /// Load every canonical vendor plus the vendors held by in-flight merges.
    ///
    /// # Errors
    ///
    /// Returns an error if any store query fails.
    pub fn load(conn: &rusqlite::Connection) -> vmerge_core::Result<Self> {
        let vendors = store::list_canonical(conn)?;
        let keys = store::canonical_keys(conn)?;
        let claims = store::canonical_claims(conn)?;
        let locked = locks::locked_vendors(conn)?;
        Ok(Self::new(vendors, &keys, &claims, locked))
    }

    #[must_use]
    pub fn vendors(&self) -> &[VendorIdentity] {
        &self.vendors
    }

    #[must_use]
    pub fn get(&self, vendor_id: VendorId) -> Option<&VendorIdentity> {
        self.vendors.iter().find(|vendor| vendor.vendor_id == vendor_id)
    }

    /// Merge holding `vendor_id`, if any.
    #[must_use]
    pub fn lock_holder(&self, vendor_id: VendorId) -> Option<MergeId> {
        self.locked.get(&vendor_id).copied()
    }

    fn profile(&self, vendor: &VendorIdentity) -> Cow<'_, NameProfile> {
        self.profiles
            .get(&vendor.vendor_id)
            .map_or_else(|| Cow::Owned(NameProfile::of(vendor)), Cow::Borrowed)
    }

    fn keys_of(&self, vendor_id: VendorId) -> &[KeyRef] {
        self.verified_keys.get(&vendor_id).map_or(&[][..], Vec::as_slice)
    }

    fn claims_of(&self, vendor_id: VendorId) -> &[KeyRef] {
        self.verified_claims.get(&vendor_id).map_or(&[][..], Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// What a strategy concluded about one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub basis: MatchBasis,
    pub score: f64,
    pub auto_eligible: bool,
    /// Human-readable evidence, e.g. the shared key.
    pub evidence: String,
}

/// Inputs shared by every strategy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub config: &'a MatchConfig,
    pub population: &'a Population,
}

/// One way of deciding that two vendors may be the same.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluate `subject` against `other`. `None` means no candidate.
    fn evaluate(
        &self,
        subject: &VendorIdentity,
        other: &VendorIdentity,
        ctx: &MatchContext<'_>,
    ) -> Option<MatchOutcome>;
}

/// Shared verified identifier.
///
/// A vendor's verified claim on a key that another vendor holds as a
/// verified current mapping. Checked in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicKeyStrategy;

impl DeterministicKeyStrategy {
    fn shared_key(claimant: VendorId, owner: VendorId, population: &Population) -> Option<KeyRef> {
        let owned = population.keys_of(owner);
        population
            .claims_of(claimant)
            .iter()
            .find(|claim| owned.contains(claim))
            .cloned()
    }
}

impl MatchStrategy for DeterministicKeyStrategy {
    fn name(&self) -> &'static str {
        "deterministic_key"
    }

    fn evaluate(
        &self,
        subject: &VendorIdentity,
        other: &VendorIdentity,
        ctx: &MatchContext<'_>,
    ) -> Option<MatchOutcome> {
        let key = Self::shared_key(subject.vendor_id, other.vendor_id, ctx.population)
            .or_else(|| Self::shared_key(other.vendor_id, subject.vendor_id, ctx.population))?;
        Some(MatchOutcome {
            basis: MatchBasis::ExactKey,
            score: 1.0,
            auto_eligible: true,
            evidence: format!("shared verified key {key}"),
        })
    }
}

/// Normalized name similarity with the organizational bonus.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityStrategy;

impl MatchStrategy for SimilarityStrategy {
    fn name(&self) -> &'static str {
        "similarity"
    }

    fn evaluate(
        &self,
        subject: &VendorIdentity,
        other: &VendorIdentity,
        ctx: &MatchContext<'_>,
    ) -> Option<MatchOutcome> {
        let left = ctx.population.profile(subject);
        let right = ctx.population.profile(other);
        let score = vendor_similarity(&left, &right, ctx.config)?;
        debug!(
            subject = %subject.vendor_id,
            other = %other.vendor_id,
            name = score.name,
            same_org = score.same_org,
            total = score.total,
            "similarity scored"
        );
        if score.total <= ctx.config.candidate_floor {
            return None;
        }
        Some(MatchOutcome {
            basis: MatchBasis::Similarity,
            score: score.total,
            auto_eligible: score.total >= ctx.config.auto_merge_threshold,
            evidence: format!("name similarity {:.3}", score.name),
        })
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Runs strategies over a population and emits ordered candidate pairs.
pub struct Matcher {
    config: MatchConfig,
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("config", &self.config)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Matcher {
    /// Deterministic key pass, then name similarity.
    #[must_use]
    pub fn new(config: MatchConfig) -> Self {
        Self::with_strategies(
            config,
            vec![
                Box::new(DeterministicKeyStrategy),
                Box::new(SimilarityStrategy),
            ],
        )
    }

    #[must_use]
    pub fn with_strategies(config: MatchConfig, strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { config, strategies }
    }

    #[must_use]
    pub const fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Candidates pairing `subject` with the rest of `population`.
    ///
    /// Self-pairs, absorbed vendors, and pairs touching a vendor held by an
    /// in-flight merge are suppressed. Results are sorted by descending score,
    /// then by pair.
    #[must_use]
    pub fn find_candidates(
        &self,
        subject: &VendorIdentity,
        population: &Population,
    ) -> Vec<MatchCandidate> {
        if subject.merged_into_vendor_id.is_some() {
            return Vec::new();
        }
        if let Some(merge_id) = population.lock_holder(subject.vendor_id) {
            debug!(subject = %subject.vendor_id, %merge_id, "subject held by merge; skipped");
            return Vec::new();
        }

        let ctx = MatchContext {
            config: &self.config,
            population,
        };
        let others: Vec<&VendorIdentity> = population
            .vendors()
            .iter()
            .filter(|other| other.vendor_id != subject.vendor_id)
            .filter(|other| other.merged_into_vendor_id.is_none())
            .filter(|other| population.lock_holder(other.vendor_id).is_none())
            .collect();

        let mut matched: HashSet<VendorId> = HashSet::new();
        let mut candidates = Vec::new();
        for strategy in &self.strategies {
            for other in &others {
                if matched.contains(&other.vendor_id) {
                    continue;
                }
                if let Some(outcome) = strategy.evaluate(subject, other, &ctx) {
                    debug!(
                        strategy = strategy.name(),
                        subject = %subject.vendor_id,
                        other = %other.vendor_id,
                        score = outcome.score,
                        evidence = %outcome.evidence,
                        "match candidate"
                    );
                    matched.insert(other.vendor_id);
                    candidates.push(MatchCandidate::new(
                        subject.vendor_id,
                        other.vendor_id,
                        outcome.basis,
                        outcome.score,
                        outcome.auto_eligible,
                    ));
                }
            }
        }
        sort_candidates(&mut candidates);
        candidates
    }

    /// Candidates for many subjects, spread across `workers` threads.
    ///
    /// A pair found from both sides is reported once, keeping the stronger
    /// outcome.
    #[must_use]
    pub fn find_candidates_batch(
        &self,
        subjects: &[VendorIdentity],
        population: &Population,
        workers: usize,
    ) -> Vec<MatchCandidate> {
        if subjects.is_empty() {
            return Vec::new();
        }
        let workers = workers.clamp(1, subjects.len());
        let chunk = subjects.len().div_ceil(workers);

        let found: Vec<Vec<MatchCandidate>> = std::thread::scope(|scope| {
            let handles: Vec<_> = subjects
                .chunks(chunk)
                .map(|slice| {
                    scope.spawn(move || {
                        slice
                            .iter()
                            .flat_map(|subject| self.find_candidates(subject, population))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        let mut by_pair: BTreeMap<(VendorId, VendorId), MatchCandidate> = BTreeMap::new();
        for candidate in found.into_iter().flatten() {
            by_pair
                .entry(candidate.pair())
                .and_modify(|existing| {
                    if stronger(&candidate, existing) {
                        *existing = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }
        let mut candidates: Vec<_> = by_pair.into_values().collect();
        sort_candidates(&mut candidates);
        candidates
    }
}

/// Default worker count for batch scans.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn stronger(candidate: &MatchCandidate, existing: &MatchCandidate) -> bool {
    let exact = |c: &MatchCandidate| c.match_basis == MatchBasis::ExactKey;
    (exact(candidate), candidate.confidence_score) > (exact(existing), existing.confidence_score)
}

fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence_score
            .total_cmp(&a.confidence_score)
            .then_with(|| a.pair().cmp(&b.pair()))
    });
}
