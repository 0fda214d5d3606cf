//! Outbound audit events for the external lineage sink.

use crate::model::merge::MergeStatus;
use crate::model::{MergeId, VendorId, now_us};
use serde::Serialize;
use std::sync::Mutex;

/// Entity name stamped on every merge audit event.
pub const ENTITY: &str = "vendor_merge";

/// One state transition of a merge event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub entity: &'static str,
    pub action: MergeStatus,
    pub merge_id: Option<MergeId>,
    pub actor: String,
    pub survivor: VendorId,
    pub absorbed: VendorId,
    pub at_us: i64,
    pub snapshot_ids: Vec<i64>,
    pub detail: Option<String>,
}

/// Everything the engine emits outward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Transition(TransitionEvent),
    /// Downstream caches holding `vendor_id -> display` mappings for
    /// `absorbed` must invalidate.
    CanonicalIdentityChanged {
        merge_id: MergeId,
        survivor: VendorId,
        absorbed: VendorId,
        at_us: i64,
    },
}

impl AuditEvent {
    #[must_use]
    pub fn transition(
        action: MergeStatus,
        merge_id: Option<MergeId>,
        actor: &str,
        survivor: VendorId,
        absorbed: VendorId,
    ) -> TransitionEvent {
        TransitionEvent {
            entity: ENTITY,
            action,
            merge_id,
            actor: actor.to_string(),
            survivor,
            absorbed,
            at_us: now_us(),
            snapshot_ids: Vec::new(),
            detail: None,
        }
    }

    #[must_use]
    pub fn action(&self) -> Option<MergeStatus> {
        match self {
            Self::Transition(event) => Some(event.action),
            Self::CanonicalIdentityChanged { .. } => None,
        }
    }
}

/// Receiver of audit events. Implementations must not fail the merge.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Logs every audit event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        match event {
            AuditEvent::Transition(t) => tracing::info!(
                target: "vmerge::audit",
                entity = t.entity,
                action = %t.action,
                merge_id = ?t.merge_id,
                actor = %t.actor,
                survivor = %t.survivor,
                absorbed = %t.absorbed,
                snapshots = ?t.snapshot_ids,
                detail = t.detail.as_deref().unwrap_or(""),
                "merge transition"
            ),
            AuditEvent::CanonicalIdentityChanged {
                merge_id,
                survivor,
                absorbed,
                ..
            } => tracing::info!(
                target: "vmerge::audit",
                %merge_id,
                %survivor,
                %absorbed,
                "canonical identity changed"
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Transition actions for one merge, in emission order.
    #[must_use]
    pub fn actions_for(&self, merge_id: MergeId) -> Vec<MergeStatus> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                AuditEvent::Transition(t) if t.merge_id == Some(merge_id) => Some(t.action),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Holds events produced inside a transaction until it commits.
#[derive(Debug, Default)]
pub(crate) struct AuditBuffer {
    pending: Vec<AuditEvent>,
}

impl AuditBuffer {
    pub(crate) fn push(&mut self, event: AuditEvent) {
        self.pending.push(event);
    }

    pub(crate) fn transition(&mut self, event: TransitionEvent) {
        self.pending.push(AuditEvent::Transition(event));
    }

    pub(crate) fn flush(self, sink: &dyn AuditSink) {
        for event in &self.pending {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_filters_by_merge() {
        let sink = MemoryAuditSink::new();
        let one = AuditEvent::transition(
            MergeStatus::Validated,
            Some(MergeId(1)),
            "alice",
            VendorId(1),
            VendorId(2),
        );
        let two = AuditEvent::transition(
            MergeStatus::Validated,
            Some(MergeId(2)),
            "alice",
            VendorId(3),
            VendorId(4),
        );
        sink.emit(&AuditEvent::Transition(one));
        sink.emit(&AuditEvent::Transition(two));
        assert_eq!(sink.actions_for(MergeId(1)), vec![MergeStatus::Validated]);
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn buffer_emits_only_on_flush() {
        let sink = MemoryAuditSink::new();
        let mut buffer = AuditBuffer::default();
        buffer.push(AuditEvent::CanonicalIdentityChanged {
            merge_id: MergeId(7),
            survivor: VendorId(1),
            absorbed: VendorId(2),
            at_us: 0,
        });
        assert!(sink.events().is_empty());
        buffer.flush(&sink);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = AuditEvent::CanonicalIdentityChanged {
            merge_id: MergeId(7),
            survivor: VendorId(1),
            absorbed: VendorId(2),
            at_us: 5,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "canonical_identity_changed");
        assert_eq!(json["survivor"], 1);
    }
}
