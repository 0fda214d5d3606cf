//! Property tests: resolver idempotence and survivorship determinism.

use proptest::prelude::*;
use std::sync::Arc;
use vmerge_core::audit::MemoryAuditSink;
use vmerge_core::auth::{AuthToken, StaticAuthorizer};
use vmerge_core::config::EngineConfig;
use vmerge_core::db::open_in_memory;
use vmerge_core::merge::survivorship::{self, SurvivorshipPolicy};
use vmerge_core::model::VendorId;
use vmerge_core::model::merge::{FieldOverride, MergeStatus};
use vmerge_core::model::vendor::{
    KeyRef, LifecycleState, NewKey, NewVendor, VendorField, VendorIdentity, VerificationStatus,
};
use vmerge_core::resolver::{self, Resolver};
use vmerge_core::{MergeOrchestrator, MergeRequest, lineage, store};

fn engine() -> MergeOrchestrator {
    let mut config = EngineConfig::default();
    config.survivorship.source_priority = vec!["peoplesoft".into(), "coupa".into()];
    MergeOrchestrator::new(
        config,
        Arc::new(StaticAuthorizer::new(["steward"])),
        Arc::new(MemoryAuditSink::new()),
    )
}

fn lifecycle() -> impl Strategy<Value = LifecycleState> {
    prop_oneof![
        Just(LifecycleState::Draft),
        Just(LifecycleState::Active),
        Just(LifecycleState::Retired),
    ]
}

fn source() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("peoplesoft".to_owned()),
        Just("coupa".to_owned()),
        Just("zycus".to_owned()),
    ]
}

fn new_vendor() -> impl Strategy<Value = NewVendor> {
    (
        "[A-Z][a-z]{0,6}",
        prop::option::of("[A-Z]{2,4}"),
        lifecycle(),
        prop::option::of(prop_oneof![Just("low"), Just("high")]),
        prop::option::of(prop_oneof![Just("org-1"), Just("org-2")]),
        source(),
    )
        .prop_map(|(legal, display, state, risk, org, source)| NewVendor {
            legal_name: legal,
            display_name: display,
            lifecycle_state: state,
            risk_tier: risk.map(str::to_owned),
            owner_org_id: org.map(str::to_owned),
            source_system: source,
            source_record_id: None,
        })
}

fn identity(id: i64, new: &NewVendor, updated_at_us: i64) -> VendorIdentity {
    VendorIdentity {
        vendor_id: VendorId(id),
        legal_name: new.legal_name.clone(),
        display_name: new.display_name.clone(),
        lifecycle_state: new.lifecycle_state,
        risk_tier: new.risk_tier.clone(),
        owner_org_id: new.owner_org_id.clone(),
        source_system: new.source_system.clone(),
        source_record_id: None,
        merged_into_vendor_id: None,
        merged_at_us: None,
        merged_by: None,
        merge_reason: None,
        created_at_us: 0,
        updated_at_us,
    }
}

fn differing_fields(a: &VendorIdentity, b: &VendorIdentity) -> usize {
    VendorField::ALL
        .iter()
        .filter(|field| a.field(**field) != b.field(**field))
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn resolve_is_idempotent_and_lands_on_a_survivor(
        count in 2usize..10,
        merges in prop::collection::vec((0usize..10, 0usize..10), 0..14),
    ) {
        let conn = open_in_memory().expect("store");
        let engine = engine();
        let token = AuthToken::new("steward");
        let ids: Vec<VendorId> = (0..count)
            .map(|i| {
                store::insert_vendor(&conn, &NewVendor {
                    legal_name: format!("Vendor {i}"),
                    source_system: "manual".into(),
                    ..NewVendor::default()
                })
                .expect("vendor")
                .vendor_id
            })
            .collect();

        for (x, y) in merges {
            let survivor = resolver::resolve(&conn, ids[x % count], 64).expect("resolve survivor");
            let absorbed = resolver::resolve(&conn, ids[y % count], 64).expect("resolve absorbed");
            if survivor == absorbed {
                continue;
            }
            let outcome = engine
                .execute_direct(&conn, &token, &MergeRequest::manual(survivor, absorbed, "prop"))
                .expect("merge of two canonical vendors");
            prop_assert_eq!(outcome.status, MergeStatus::Completed);
        }

        let mut cached = Resolver::new(&conn, 64);
        for id in &ids {
            let once = resolver::resolve(&conn, *id, 64).expect("resolve");
            let twice = resolver::resolve(&conn, once, 64).expect("resolve again");
            prop_assert_eq!(once, twice);
            prop_assert!(store::require_vendor(&conn, once).expect("vendor").is_canonical());
            prop_assert_eq!(cached.resolve(*id).expect("cached resolve"), once);
        }
    }

    #[test]
    fn survivorship_is_deterministic(
        survivor in new_vendor(),
        absorbed in new_vendor(),
        survivor_at in 0i64..1_000,
        absorbed_at in 0i64..1_000,
        prefer_non_empty in any::<bool>(),
    ) {
        let policy = SurvivorshipPolicy {
            source_priority: vec!["peoplesoft".into(), "coupa".into()],
            prefer_non_empty,
        };
        let s = identity(1, &survivor, survivor_at);
        let a = identity(2, &absorbed, absorbed_at);

        let first = survivorship::resolve(&policy, &s, &a, &[]);
        let second = survivorship::resolve(&policy, &s, &a, &[]);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), differing_fields(&s, &a));
        for decision in &first {
            prop_assert!(decision.chosen_vendor_id == s.vendor_id || decision.chosen_vendor_id == a.vendor_id);
            let chosen_from = if decision.chosen_vendor_id == s.vendor_id { &s } else { &a };
            prop_assert_eq!(&decision.chosen_value, &chosen_from.field(decision.field));
        }

        let merged = survivorship::apply(&s, &first).expect("apply decisions");
        for decision in &first {
            prop_assert_eq!(&merged.field(decision.field), &decision.chosen_value);
        }
    }

    #[test]
    fn manual_override_always_wins(
        survivor in new_vendor(),
        absorbed in new_vendor(),
        risk in prop_oneof![Just("low"), Just("medium"), Just("high")],
    ) {
        let policy = SurvivorshipPolicy::default();
        let s = identity(1, &survivor, 10);
        let a = identity(2, &absorbed, 20);
        let overrides = vec![FieldOverride {
            field: VendorField::RiskTier,
            value: Some(risk.to_owned()),
            note: None,
        }];

        let decisions = survivorship::resolve(&policy, &s, &a, &overrides);
        let risk_decision = decisions
            .iter()
            .find(|d| d.field == VendorField::RiskTier)
            .expect("overridden field is always decided");
        prop_assert_eq!(risk_decision.chosen_value.as_deref(), Some(risk));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn stored_decisions_replay_and_keys_survive(
        survivor in new_vendor(),
        absorbed in new_vendor(),
        key_count in 0usize..5,
    ) {
        let conn = open_in_memory().expect("store");
        let engine = engine();
        let s = store::insert_vendor(&conn, &survivor).expect("survivor").vendor_id;
        let a = store::insert_vendor(&conn, &absorbed).expect("absorbed").vendor_id;
        for i in 0..key_count {
            store::register_key(&conn, a, &NewKey {
                key: KeyRef::new("coupa", format!("CP-{i}")),
                is_primary_source: i == 0,
                verification_status: VerificationStatus::Verified,
            })
            .expect("key");
        }
        let before_s = store::require_vendor(&conn, s).expect("s");
        let before_a = store::require_vendor(&conn, a).expect("a");

        let outcome = engine
            .execute_direct(&conn, &AuthToken::new("steward"), &MergeRequest::manual(s, a, "prop"))
            .expect("merge");

        let stored = lineage::decisions(&conn, outcome.merge_id).expect("decisions");
        prop_assert_eq!(stored.len(), differing_fields(&before_s, &before_a));
        prop_assert_eq!(
            engine.replay_survivorship(&conn, outcome.merge_id).expect("replay"),
            stored
        );

        let moved = store::keys_for(&conn, s).expect("keys");
        prop_assert_eq!(moved.len(), key_count);
        prop_assert!(moved.iter().all(|key| key.original_vendor_id == a));
    }
}
