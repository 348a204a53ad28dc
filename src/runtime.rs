//! Interfaces of the runtime the collector is embedded into.
//!
//! The collector decides when and what to collect. Walking objects, finding
//! roots and stopping threads is done by the embedder through these traits.
use std::sync::Arc;

use crate::error::CollectionFailure;
use crate::header::{CollectionMetadata, SideTableMetadata};
use crate::mmap::VirtualMemory;
use crate::object::ObjectRef;
use crate::space::{PerRegion, RegionKind, RegionReclaim};

/// Thread management and root enumeration.
pub trait MutatorRuntime: Send + Sync {
    /// Returns once every mutator is parked at a safepoint.
    fn suspend_mutators(&self);
    fn resume_mutators(&self);
    /// Calls `visitor` once per root. Only invoked while mutators are suspended.
    fn enumerate_roots(&self, visitor: &mut dyn FnMut(ObjectRef));
}

/// Part of the heap a collection covers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionScope {
    /// The young region. Everything else is assumed live.
    Young,
    /// Every region.
    Full,
}

impl CollectionScope {
    pub fn covers(self, region: RegionKind) -> bool {
        match self {
            Self::Young => region == RegionKind::Young,
            Self::Full => true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceMode {
    /// Marks reachable objects in place.
    Mark,
    /// Marks and copies reachable objects out of the scope into `target`,
    /// recording forward targets.
    Evacuate { target: RegionKind },
}

/// Parameters of one trace phase. [`ObjectGraph::retrace`] reuses the request
/// of the running cycle.
#[derive(Clone, Copy, Debug)]
pub struct TraceRequest<'a> {
    pub roots: &'a [ObjectRef],
    pub scope: CollectionScope,
    pub mode: TraceMode,
    /// Old objects written since the last minor cycle. `None` when the whole
    /// old generation must be scanned for young references.
    pub remembered: Option<&'a [ObjectRef]>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TraceSummary {
    /// Live bytes found per region, after evacuation.
    pub live: PerRegion<usize>,
    /// Bytes copied out of the young region.
    pub promoted: usize,
}

impl TraceSummary {
    pub fn merge(&mut self, other: &TraceSummary) {
        for kind in RegionKind::ALL {
            self.live[kind] += other.live[kind];
        }
        self.promoted += other.promoted;
    }
}

/// A retrace needed a slot the running cycle already threw away.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotDiscarded;

/// Outcome of a stop-the-world sweep or compaction.
#[derive(Clone, Debug, Default)]
pub struct ReclaimSummary {
    pub freed: PerRegion<usize>,
    pub regions: PerRegion<RegionReclaim>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MarkStep {
    pub marked_bytes: usize,
    /// No grey object is left.
    pub done: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SweepStep {
    pub freed: PerRegion<usize>,
    pub holes: Vec<(RegionKind, usize)>,
    /// Nothing is left to sweep.
    pub done: bool,
}

/// The heap's objects as the embedder lays them out.
///
/// Concurrent operations are called from several worker threads at once.
/// Objects allocated after [`ObjectGraph::begin_concurrent_mark`] must be
/// treated as live by the running cycle.
pub trait ObjectGraph: Send + Sync {
    /// `None` for references that do not point into the heap.
    fn region_of(&self, object: ObjectRef) -> Option<RegionKind>;

    fn trace(
        &self,
        request: &TraceRequest<'_>,
        metadata: &dyn CollectionMetadata,
    ) -> Result<TraceSummary, CollectionFailure>;

    /// Traces from a single object with the parameters of the running cycle.
    fn retrace(
        &self,
        object: ObjectRef,
        request: &TraceRequest<'_>,
        metadata: &dyn CollectionMetadata,
    ) -> Result<TraceSummary, SlotDiscarded>;

    /// Frees unmarked objects in place.
    fn sweep(&self, scope: CollectionScope, metadata: &dyn CollectionMetadata) -> ReclaimSummary;

    /// Frees unmarked objects and slides the survivors together.
    fn compact(&self, scope: CollectionScope, metadata: &dyn CollectionMetadata)
        -> ReclaimSummary;

    fn begin_concurrent_mark(&self, roots: &[ObjectRef], metadata: &dyn CollectionMetadata);

    fn mark_step(&self, budget: usize, metadata: &dyn CollectionMetadata) -> MarkStep;

    /// Greys objects the write barrier reported as modified during marking.
    fn process_dirty(&self, objects: &[ObjectRef], metadata: &dyn CollectionMetadata);

    fn begin_concurrent_sweep(&self, metadata: &dyn CollectionMetadata);

    fn sweep_step(&self, budget: usize, metadata: &dyn CollectionMetadata) -> SweepStep;

    /// Called once per concurrent cycle after the sweep results were merged.
    fn end_concurrent_cycle(&self, _metadata: &dyn CollectionMetadata) {}
}

/// Answers liveness questions during resurrection.
pub trait LivenessOracle {
    fn is_dead(&self, object: ObjectRef) -> bool;
    /// The object was moved by this cycle and references to it must be updated.
    fn needs_move(&self, object: ObjectRef) -> bool;
    /// Current location of `object`.
    fn forwarded(&self, object: ObjectRef) -> ObjectRef;
}

/// Liveness derived from collection metadata, limited to a collection scope.
pub struct ScopedLiveness<'a> {
    pub metadata: &'a dyn CollectionMetadata,
    pub graph: &'a dyn ObjectGraph,
    pub scope: CollectionScope,
}

impl LivenessOracle for ScopedLiveness<'_> {
    fn is_dead(&self, object: ObjectRef) -> bool {
        match self.graph.region_of(object) {
            None => true,
            Some(region) if !self.scope.covers(region) => false,
            Some(_) => {
                !self.metadata.is_marked(object) && self.metadata.forward_target(object).is_none()
            }
        }
    }

    fn needs_move(&self, object: ObjectRef) -> bool {
        self.metadata.forward_target(object).is_some()
    }

    fn forwarded(&self, object: ObjectRef) -> ObjectRef {
        self.metadata.forward_target(object).unwrap_or(object)
    }
}

/// Everything the heap needs from its embedder.
pub struct Collaborators {
    pub runtime: Arc<dyn MutatorRuntime>,
    pub graph: Arc<dyn ObjectGraph>,
    pub metadata: Arc<dyn CollectionMetadata>,
    /// `None` reserves `max_heap_size` bytes with [`crate::mmap::reserve`].
    pub memory: Option<Box<dyn VirtualMemory>>,
}

impl Collaborators {
    /// Side-table metadata and an anonymous memory reservation.
    pub fn new(runtime: Arc<dyn MutatorRuntime>, graph: Arc<dyn ObjectGraph>) -> Self {
        Self {
            runtime,
            graph,
            metadata: Arc::new(SideTableMetadata::new()),
            memory: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn CollectionMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_memory(mut self, memory: Box<dyn VirtualMemory>) -> Self {
        self.memory = Some(memory);
        self
    }
}
