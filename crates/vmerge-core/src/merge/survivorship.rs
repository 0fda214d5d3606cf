//! Field-level survivorship between a survivor and an absorbed vendor.
//!
//! [`resolve`] is a pure function of the two snapshotted records, the policy
//! and the reviewer overrides, so replaying it over stored snapshots must
//! reproduce the stored decisions exactly.

use crate::config::SurvivorshipConfig;
use crate::error::{Result, ValidationError};
use crate::model::merge::{DecisionMethod, FieldOverride, SurvivorshipDecision};
use crate::model::vendor::{LifecycleState, VendorField, VendorIdentity};
use std::cmp::Ordering;

/// Ordered source trust plus tie-break switches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurvivorshipPolicy {
    /// Most trusted source first. Unlisted sources rank after every listed one.
    pub source_priority: Vec<String>,
    pub prefer_non_empty: bool,
}

impl From<&SurvivorshipConfig> for SurvivorshipPolicy {
    fn from(config: &SurvivorshipConfig) -> Self {
        Self {
            source_priority: config.source_priority.clone(),
            prefer_non_empty: config.prefer_non_empty,
        }
    }
}

impl SurvivorshipPolicy {
    fn rank(&self, source_system: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s.eq_ignore_ascii_case(source_system))
            .unwrap_or(self.source_priority.len())
    }
}

#[derive(Clone, Copy)]
enum Side {
    Survivor,
    Absorbed,
}

fn present(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// One decision per field whose values differ or that carries an override.
#[must_use]
pub fn resolve(
    policy: &SurvivorshipPolicy,
    survivor: &VendorIdentity,
    absorbed: &VendorIdentity,
    overrides: &[FieldOverride],
) -> Vec<SurvivorshipDecision> {
    let mut decisions = Vec::new();
    for field in VendorField::ALL {
        let survivor_value = survivor.field(field);
        let absorbed_value = absorbed.field(field);
        let manual = overrides.iter().rev().find(|o| o.field == field);

        if manual.is_none() && survivor_value == absorbed_value {
            continue;
        }

        let decision = if let Some(manual) = manual {
            let chosen_vendor_id = if manual.value == survivor_value {
                survivor.vendor_id
            } else if manual.value == absorbed_value {
                absorbed.vendor_id
            } else {
                survivor.vendor_id
            };
            SurvivorshipDecision {
                field,
                chosen_vendor_id,
                chosen_value: manual.value.clone(),
                survivor_value,
                absorbed_value,
                decision_method: DecisionMethod::Manual,
                note: manual.note.clone(),
            }
        } else {
            let (side, method, note) = automatic(
                policy,
                survivor,
                absorbed,
                survivor_value.as_ref(),
                absorbed_value.as_ref(),
            );
            let (chosen_vendor_id, chosen_value) = match side {
                Side::Survivor => (survivor.vendor_id, survivor_value.clone()),
                Side::Absorbed => (absorbed.vendor_id, absorbed_value.clone()),
            };
            SurvivorshipDecision {
                field,
                chosen_vendor_id,
                chosen_value,
                survivor_value,
                absorbed_value,
                decision_method: method,
                note,
            }
        };
        decisions.push(decision);
    }
    decisions
}

fn automatic(
    policy: &SurvivorshipPolicy,
    survivor: &VendorIdentity,
    absorbed: &VendorIdentity,
    survivor_value: Option<&String>,
    absorbed_value: Option<&String>,
) -> (Side, DecisionMethod, Option<String>) {
    if policy.prefer_non_empty {
        match (present(survivor_value), present(absorbed_value)) {
            (true, false) => return (Side::Survivor, DecisionMethod::NonEmpty, None),
            (false, true) => return (Side::Absorbed, DecisionMethod::NonEmpty, None),
            _ => {}
        }
    }

    let survivor_rank = policy.rank(&survivor.source_system);
    let absorbed_rank = policy.rank(&absorbed.source_system);
    match survivor_rank.cmp(&absorbed_rank) {
        Ordering::Less => {
            return (
                Side::Survivor,
                DecisionMethod::SourcePriority,
                Some(format!(
                    "{} outranks {}",
                    survivor.source_system, absorbed.source_system
                )),
            );
        }
        Ordering::Greater => {
            return (
                Side::Absorbed,
                DecisionMethod::SourcePriority,
                Some(format!(
                    "{} outranks {}",
                    absorbed.source_system, survivor.source_system
                )),
            );
        }
        Ordering::Equal => {}
    }

    match survivor.updated_at_us.cmp(&absorbed.updated_at_us) {
        Ordering::Less => (Side::Absorbed, DecisionMethod::MostRecent, None),
        Ordering::Greater => (Side::Survivor, DecisionMethod::MostRecent, None),
        Ordering::Equal => (Side::Survivor, DecisionMethod::SurvivorDefault, None),
    }
}

/// Check reviewer overrides before anything is persisted.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidInput`] for a blank legal name, an
/// unknown lifecycle state, or two overrides of the same field.
pub fn validate_overrides(overrides: &[FieldOverride]) -> Result<()> {
    for (i, o) in overrides.iter().enumerate() {
        if overrides[..i].iter().any(|earlier| earlier.field == o.field) {
            return Err(invalid(format!("field {} overridden twice", o.field)));
        }
        match o.field {
            VendorField::LegalName if !present(o.value.as_ref()) => {
                return Err(invalid("legal_name override must not be blank".into()));
            }
            VendorField::LifecycleState => {
                let Some(value) = &o.value else {
                    return Err(invalid("lifecycle_state override must not be empty".into()));
                };
                value
                    .parse::<LifecycleState>()
                    .map_err(|err| invalid(err.to_string()))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn invalid(message: String) -> crate::error::MergeError {
    ValidationError::InvalidInput(message).into()
}

/// Survivor record with every chosen value applied.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidInput`] if a decision would blank the
/// legal name or carries an unknown lifecycle state.
pub fn apply(
    survivor: &VendorIdentity,
    decisions: &[SurvivorshipDecision],
) -> Result<VendorIdentity> {
    let mut resolved = survivor.clone();
    for decision in decisions {
        let value = decision.chosen_value.clone();
        match decision.field {
            VendorField::LegalName => {
                resolved.legal_name =
                    value.ok_or_else(|| invalid("legal_name cannot be cleared".into()))?;
            }
            VendorField::DisplayName => resolved.display_name = value,
            VendorField::LifecycleState => {
                let text =
                    value.ok_or_else(|| invalid("lifecycle_state cannot be cleared".into()))?;
                resolved.lifecycle_state = text
                    .parse()
                    .map_err(|err: crate::model::UnknownVariant| invalid(err.to_string()))?;
            }
            VendorField::RiskTier => resolved.risk_tier = value,
            VendorField::OwnerOrgId => resolved.owner_org_id = value,
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VendorId;

    fn vendor(id: i64, source: &str, legal: &str, updated_at_us: i64) -> VendorIdentity {
        VendorIdentity {
            vendor_id: VendorId(id),
            legal_name: legal.into(),
            display_name: None,
            lifecycle_state: LifecycleState::Active,
            risk_tier: None,
            owner_org_id: Some("org-1".into()),
            source_system: source.into(),
            source_record_id: None,
            merged_into_vendor_id: None,
            merged_at_us: None,
            merged_by: None,
            merge_reason: None,
            created_at_us: 0,
            updated_at_us,
        }
    }

    fn policy() -> SurvivorshipPolicy {
        SurvivorshipPolicy {
            source_priority: vec!["peoplesoft".into(), "zycus".into()],
            prefer_non_empty: true,
        }
    }

    #[test]
    fn identical_fields_produce_no_decisions() {
        let a = vendor(1, "peoplesoft", "Acme", 10);
        let mut b = vendor(2, "zycus", "Acme", 20);
        b.owner_org_id.clone_from(&a.owner_org_id);
        assert!(resolve(&policy(), &a, &b, &[]).is_empty());
    }

    #[test]
    fn higher_trust_source_wins_even_when_absorbed() {
        let survivor = vendor(1, "zycus", "Acme Corp", 50);
        let absorbed = vendor(2, "peoplesoft", "Acme Corporation", 10);
        let decisions = resolve(&policy(), &survivor, &absorbed, &[]);

        assert_eq!(decisions.len(), 1);
        let d = &decisions[0];
        assert_eq!(d.field, VendorField::LegalName);
        assert_eq!(d.decision_method, DecisionMethod::SourcePriority);
        assert_eq!(d.chosen_vendor_id, VendorId(2));
        assert_eq!(d.chosen_value.as_deref(), Some("Acme Corporation"));
    }

    #[test]
    fn recency_then_survivor_break_ties() {
        let survivor = vendor(1, "manual", "Acme", 10);
        let absorbed = vendor(2, "manual", "Acme Inc", 20);
        let d = &resolve(&policy(), &survivor, &absorbed, &[])[0];
        assert_eq!(d.decision_method, DecisionMethod::MostRecent);
        assert_eq!(d.chosen_vendor_id, VendorId(2));

        let absorbed = vendor(2, "manual", "Acme Inc", 10);
        let d = &resolve(&policy(), &survivor, &absorbed, &[])[0];
        assert_eq!(d.decision_method, DecisionMethod::SurvivorDefault);
        assert_eq!(d.chosen_value.as_deref(), Some("Acme"));
    }

    #[test]
    fn present_value_beats_missing_one() {
        let survivor = vendor(1, "peoplesoft", "Acme", 10);
        let mut absorbed = vendor(2, "zycus", "Acme", 10);
        absorbed.risk_tier = Some("high".into());
        let d = &resolve(&policy(), &survivor, &absorbed, &[])[0];
        assert_eq!(d.field, VendorField::RiskTier);
        assert_eq!(d.decision_method, DecisionMethod::NonEmpty);
        assert_eq!(d.chosen_value.as_deref(), Some("high"));

        let strict = SurvivorshipPolicy {
            prefer_non_empty: false,
            ..policy()
        };
        let d = &resolve(&strict, &survivor, &absorbed, &[])[0];
        assert_eq!(d.decision_method, DecisionMethod::SourcePriority);
        assert_eq!(d.chosen_value, None);
    }

    #[test]
    fn manual_override_wins_and_is_attributed() {
        let survivor = vendor(1, "peoplesoft", "Acme", 10);
        let absorbed = vendor(2, "zycus", "ACME Holdings", 10);
        let overrides = [
            FieldOverride {
                field: VendorField::LegalName,
                value: Some("ACME Holdings".into()),
                note: Some("per W-9".into()),
            },
            FieldOverride {
                field: VendorField::RiskTier,
                value: Some("low".into()),
                note: None,
            },
        ];
        let decisions = resolve(&policy(), &survivor, &absorbed, &overrides);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].decision_method, DecisionMethod::Manual);
        assert_eq!(decisions[0].chosen_vendor_id, VendorId(2));
        assert_eq!(decisions[0].note.as_deref(), Some("per W-9"));
        assert_eq!(decisions[1].chosen_vendor_id, VendorId(1));

        let applied = apply(&survivor, &decisions).expect("apply");
        assert_eq!(applied.legal_name, "ACME Holdings");
        assert_eq!(applied.risk_tier.as_deref(), Some("low"));
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let blank = [FieldOverride {
            field: VendorField::LegalName,
            value: Some("  ".into()),
            note: None,
        }];
        assert!(validate_overrides(&blank).is_err());

        let lifecycle = [FieldOverride {
            field: VendorField::LifecycleState,
            value: Some("archived".into()),
            note: None,
        }];
        assert!(validate_overrides(&lifecycle).is_err());

        let twice = [
            FieldOverride {
                field: VendorField::RiskTier,
                value: None,
                note: None,
            },
            FieldOverride {
                field: VendorField::RiskTier,
                value: Some("low".into()),
                note: None,
            },
        ];
        assert!(validate_overrides(&twice).is_err());
        assert!(validate_overrides(&twice[1..]).is_ok());
    }
}
