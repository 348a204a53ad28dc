//! Objects with finalizers and soft, weak and phantom references.
//!
//! After the trace phase a dead object with a finalizer is brought back to life
//! by tracing from it, and handed to the runtime exactly once. References are
//! resolved afterwards, so a reference to an object that was just resurrected
//! for finalization is not cleared in the same cycle.
use crate::error::CollectionFailure;
use crate::object::ObjectRef;
use crate::runtime::{LivenessOracle, SlotDiscarded, TraceSummary};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

impl ReferenceKind {
    /// Order in which pools are resolved.
    pub const ALL: [ReferenceKind; 3] = [Self::Soft, Self::Weak, Self::Phantom];

    fn index(self) -> usize {
        match self {
            Self::Soft => 0,
            Self::Weak => 1,
            Self::Phantom => 2,
        }
    }
}

/// A reference object and the object it refers to.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ReferenceEntry {
    pub reference: ObjectRef,
    pub referent: ObjectRef,
}

/// Pools of objects that need attention after tracing.
#[derive(Default)]
pub struct FinalizationMetadata {
    with_finalizer: Vec<ObjectRef>,
    references: [Vec<ReferenceEntry>; 3],
    finalizable: Vec<ObjectRef>,
    fallback: Vec<ObjectRef>,
    cleared: [Vec<ReferenceEntry>; 3],
    finalizers_pending: bool,
    references_pending: [bool; 3],
}

impl FinalizationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `object` already has a finalizer registered.
    pub fn register_finalizer(&mut self, object: ObjectRef) -> bool {
        if self.with_finalizer.contains(&object) {
            return false;
        }
        self.with_finalizer.push(object);
        true
    }

    pub fn register_reference(&mut self, kind: ReferenceKind, reference: ObjectRef, referent: ObjectRef) {
        self.references[kind.index()].push(ReferenceEntry {
            reference,
            referent,
        });
    }

    pub fn take_finalizable(&mut self) -> Vec<ObjectRef> {
        self.finalizers_pending = false;
        std::mem::take(&mut self.finalizable)
    }

    pub fn take_cleared(&mut self, kind: ReferenceKind) -> Vec<ReferenceEntry> {
        self.references_pending[kind.index()] = false;
        std::mem::take(&mut self.cleared[kind.index()])
    }

    pub fn finalizers_pending(&self) -> bool {
        self.finalizers_pending
    }

    pub fn references_pending(&self, kind: ReferenceKind) -> bool {
        self.references_pending[kind.index()]
    }

    pub fn registered_finalizers(&self) -> &[ObjectRef] {
        &self.with_finalizer
    }

    pub fn references(&self, kind: ReferenceKind) -> &[ReferenceEntry] {
        &self.references[kind.index()]
    }

    /// Takes back what `report` handed to the runtime. Objects staged for
    /// finalization return to the finalizer pool and cleared references to
    /// their pools, so the collection that redoes the cycle reports them again.
    pub fn restore(&mut self, report: &ResurrectionReport) {
        let keep = self.finalizable.len().saturating_sub(report.finalizable);
        let staged = self.finalizable.split_off(keep);
        self.with_finalizer.extend(staged);
        self.finalizers_pending = !self.finalizable.is_empty();
        for kind in ReferenceKind::ALL {
            let slot = kind.index();
            let queue = &mut self.cleared[slot];
            let keep = queue.len().saturating_sub(report.cleared_per_kind[slot]);
            let cleared = queue.split_off(keep);
            self.references[slot].extend(cleared);
            self.references_pending[slot] = !self.cleared[slot].is_empty();
        }
    }

    /// Objects the runtime has not drained yet. They are roots of every cycle.
    pub fn for_each_root(&self, mut visitor: impl FnMut(ObjectRef)) {
        self.finalizable.iter().copied().for_each(&mut visitor);
        for queue in &self.cleared {
            queue.iter().for_each(|entry| visitor(entry.reference));
        }
    }
}

/// Counts reported by one resolution pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ResurrectionReport {
    pub finalizable: usize,
    pub cleared: usize,
    pub cleared_per_kind: [usize; 3],
    /// What the retraces of resurrected objects found.
    pub resurrected: TraceSummary,
}

pub struct ResurrectionEngine;

impl ResurrectionEngine {
    /// Resolves finalizers, then soft, weak and phantom references.
    ///
    /// On [`CollectionFailure::ResurrectionFallback`] the objects staged for
    /// finalization are back in the finalizer pool and nothing was reported;
    /// the cycle has to be redone by a full collection.
    pub fn resolve(
        pools: &mut FinalizationMetadata,
        liveness: &dyn LivenessOracle,
        retrace: &mut dyn FnMut(ObjectRef) -> Result<TraceSummary, SlotDiscarded>,
    ) -> Result<ResurrectionReport, CollectionFailure> {
        let mut report = ResurrectionReport::default();

        // undrained output is rooted, it may have moved
        for object in pools.finalizable.iter_mut() {
            *object = liveness.forwarded(*object);
        }
        for queue in pools.cleared.iter_mut() {
            for entry in queue.iter_mut() {
                entry.reference = liveness.forwarded(entry.reference);
            }
        }

        debug_assert!(pools.fallback.is_empty());
        let mut index = 0;
        while index < pools.with_finalizer.len() {
            let object = pools.with_finalizer[index];
            if liveness.is_dead(object) {
                pools.fallback.push(pools.with_finalizer.swap_remove(index));
            } else {
                pools.with_finalizer[index] = liveness.forwarded(object);
                index += 1;
            }
        }

        for position in 0..pools.fallback.len() {
            match retrace(pools.fallback[position]) {
                Ok(summary) => report.resurrected.merge(&summary),
                Err(SlotDiscarded) => {
                    let staged = std::mem::take(&mut pools.fallback);
                    pools.with_finalizer.extend(staged);
                    return Err(CollectionFailure::ResurrectionFallback);
                }
            }
        }

        for object in pools.fallback.drain(..) {
            pools.finalizable.push(liveness.forwarded(object));
            report.finalizable += 1;
        }
        if report.finalizable != 0 {
            pools.finalizers_pending = true;
        }

        for kind in ReferenceKind::ALL {
            let slot = kind.index();
            let mut cleared = Vec::new();
            pools.references[slot].retain_mut(|entry| {
                if liveness.is_dead(entry.reference) {
                    return false;
                }
                entry.reference = liveness.forwarded(entry.reference);
                if liveness.is_dead(entry.referent) {
                    cleared.push(*entry);
                    return false;
                }
                if liveness.needs_move(entry.referent) {
                    entry.referent = liveness.forwarded(entry.referent);
                }
                true
            });
            if !cleared.is_empty() {
                report.cleared += cleared.len();
                report.cleared_per_kind[slot] = cleared.len();
                pools.cleared[slot].extend(cleared);
                pools.references_pending[slot] = true;
            }
        }

        Ok(report)
    }
}
