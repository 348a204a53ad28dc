//! In-memory runtime and object graph driving the heap in tests.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::CollectionFailure;
use crate::header::{CollectionMetadata, SideTableMetadata};
use crate::heap::Heap;
use crate::mmap::VirtualMemory;
use crate::object::ObjectRef;
use crate::runtime::{
    CollectionScope, Collaborators, MarkStep, MutatorRuntime, ObjectGraph, ReclaimSummary,
    SlotDiscarded, SweepStep, TraceMode, TraceRequest, TraceSummary,
};
use crate::space::{PerRegion, RegionKind};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct MockRuntime {
    roots: Mutex<Vec<ObjectRef>>,
    pub suspends: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl MockRuntime {
    pub fn add_root(&self, object: ObjectRef) {
        self.roots.lock().push(object);
    }

    pub fn clear_roots(&self) {
        self.roots.lock().clear();
    }
}

impl MutatorRuntime for MockRuntime {
    fn suspend_mutators(&self) {
        self.suspends.fetch_add(1, Ordering::AcqRel);
    }

    fn resume_mutators(&self) {
        self.resumes.fetch_add(1, Ordering::AcqRel);
    }

    fn enumerate_roots(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        for root in self.roots.lock().iter() {
            visitor(*root);
        }
    }
}

struct MockObject {
    region: RegionKind,
    size: usize,
    refs: Vec<ObjectRef>,
}

/// Object graph kept in a hash map. Evacuation changes an object's region in
/// place, so references stay valid across collections.
#[derive(Default)]
pub struct MockGraph {
    objects: Mutex<HashMap<ObjectRef, MockObject>>,
    next_id: AtomicUsize,
    grey: Mutex<Vec<ObjectRef>>,
    marking: AtomicBool,
    sweep_queue: Mutex<Vec<ObjectRef>>,

    /// Retraces of minor collections report a discarded slot.
    pub fail_minor_retrace: AtomicBool,
    /// Young evacuation fails as if the mature region were full.
    pub fail_promotion: AtomicBool,
    /// Markers make no progress while set.
    pub hold_marking: AtomicBool,
    /// Sweepers make no progress while set.
    pub hold_sweeping: AtomicBool,
    /// Stop-the-world traces block while set.
    pub hold_trace: AtomicBool,
    /// Retraces of resurrected objects block while set.
    pub hold_retrace: AtomicBool,
    /// The end of a concurrent cycle blocks while set.
    pub hold_cycle_end: AtomicBool,

    pub traces: AtomicUsize,
    pub concurrent_mark_starts: AtomicUsize,
    pub concurrent_sweep_starts: AtomicUsize,
    pub stw_sweeps: AtomicUsize,
    pub compactions: AtomicUsize,
    pub dirty_processed: AtomicUsize,
    pub cycle_ends: AtomicUsize,
    pub remembered_seen: Mutex<Option<usize>>,
}

fn wait_while(flag: &AtomicBool) {
    while flag.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(1));
    }
}

impl MockGraph {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            ..Default::default()
        }
    }

    pub fn insert(&self, region: RegionKind, size: usize, refs: Vec<ObjectRef>) -> ObjectRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let object = ObjectRef::from_address(id * ObjectRef::ALIGNMENT);
        self.objects
            .lock()
            .insert(object, MockObject { region, size, refs });
        object
    }

    pub fn set_refs(&self, object: ObjectRef, refs: Vec<ObjectRef>) {
        if let Some(entry) = self.objects.lock().get_mut(&object) {
            entry.refs = refs;
        }
    }

    pub fn contains(&self, object: ObjectRef) -> bool {
        self.objects.lock().contains_key(&object)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn bytes_in(&self, region: RegionKind) -> usize {
        self.objects
            .lock()
            .values()
            .filter(|object| object.region == region)
            .map(|object| object.size)
            .sum()
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    /// Marks everything reachable from `start` inside the request's scope.
    fn mark_from(
        &self,
        start: impl IntoIterator<Item = ObjectRef>,
        request: &TraceRequest<'_>,
        metadata: &dyn CollectionMetadata,
    ) -> TraceSummary {
        let mut objects = self.objects.lock();
        let mut summary = TraceSummary::default();
        let mut queue: VecDeque<ObjectRef> = start.into_iter().collect();
        while let Some(object) = queue.pop_front() {
            let entry = match objects.get_mut(&object) {
                Some(entry) => entry,
                None => continue,
            };
            if !request.scope.covers(entry.region) || !metadata.set_mark(object) {
                continue;
            }
            if let TraceMode::Evacuate { target } = request.mode {
                summary.promoted += entry.size;
                entry.region = target;
            } else {
                summary.live[entry.region] += entry.size;
            }
            queue.extend(entry.refs.iter().copied());
        }
        summary
    }

    fn young_sources(&self, request: &TraceRequest<'_>) -> Vec<ObjectRef> {
        let objects = self.objects.lock();
        let sources: Vec<ObjectRef> = match request.remembered {
            Some(remembered) => remembered.to_vec(),
            None => objects
                .iter()
                .filter(|(_, object)| object.region != RegionKind::Young)
                .map(|(object, _)| *object)
                .collect(),
        };
        sources
            .iter()
            .filter_map(|source| objects.get(source))
            .flat_map(|object| object.refs.iter().copied())
            .collect()
    }

    fn reclaim(
        &self,
        scope: CollectionScope,
        metadata: &dyn CollectionMetadata,
        compact: bool,
    ) -> ReclaimSummary {
        self.marking.store(false, Ordering::Release);
        let mut objects = self.objects.lock();
        let mut summary = ReclaimSummary::default();
        objects.retain(|object, entry| {
            if !scope.covers(entry.region) {
                return true;
            }
            if metadata.is_marked(*object) {
                summary.regions[entry.region].live += entry.size;
                return true;
            }
            summary.freed[entry.region] += entry.size;
            if !compact {
                summary.regions[entry.region].holes.push(entry.size);
            }
            metadata.forget(*object);
            false
        });
        for kind in RegionKind::ALL {
            if scope.covers(kind) {
                summary.regions[kind].compacted = compact || kind == RegionKind::Young;
                if summary.regions[kind].compacted {
                    summary.regions[kind].holes.clear();
                }
            }
        }
        summary
    }
}

impl ObjectGraph for MockGraph {
    fn region_of(&self, object: ObjectRef) -> Option<RegionKind> {
        self.objects.lock().get(&object).map(|entry| entry.region)
    }

    fn trace(
        &self,
        request: &TraceRequest<'_>,
        metadata: &dyn CollectionMetadata,
    ) -> Result<TraceSummary, CollectionFailure> {
        self.traces.fetch_add(1, Ordering::AcqRel);
        wait_while(&self.hold_trace);
        let mut start: Vec<ObjectRef> = request.roots.to_vec();
        if request.scope == CollectionScope::Young {
            *self.remembered_seen.lock() = request.remembered.map(|remembered| remembered.len());
            start.extend(self.young_sources(request));
            if self.fail_promotion.load(Ordering::Acquire) {
                let summary = self.mark_from(start, request, metadata);
                return Err(CollectionFailure::PromotionFailed(summary.promoted));
            }
        }
        Ok(self.mark_from(start, request, metadata))
    }

    fn retrace(
        &self,
        object: ObjectRef,
        request: &TraceRequest<'_>,
        metadata: &dyn CollectionMetadata,
    ) -> Result<TraceSummary, SlotDiscarded> {
        if request.scope == CollectionScope::Young && self.fail_minor_retrace.load(Ordering::Acquire) {
            return Err(SlotDiscarded);
        }
        wait_while(&self.hold_retrace);
        Ok(self.mark_from([object], request, metadata))
    }

    fn sweep(&self, scope: CollectionScope, metadata: &dyn CollectionMetadata) -> ReclaimSummary {
        if scope == CollectionScope::Full {
            self.stw_sweeps.fetch_add(1, Ordering::AcqRel);
        }
        self.reclaim(scope, metadata, false)
    }

    fn compact(&self, scope: CollectionScope, metadata: &dyn CollectionMetadata) -> ReclaimSummary {
        self.compactions.fetch_add(1, Ordering::AcqRel);
        self.reclaim(scope, metadata, true)
    }

    fn begin_concurrent_mark(&self, roots: &[ObjectRef], metadata: &dyn CollectionMetadata) {
        self.concurrent_mark_starts.fetch_add(1, Ordering::AcqRel);
        self.marking.store(true, Ordering::Release);
        let mut grey = self.grey.lock();
        for root in roots {
            if self.contains(*root) && metadata.set_mark(*root) {
                grey.push(*root);
            }
        }
    }

    fn mark_step(&self, budget: usize, metadata: &dyn CollectionMetadata) -> MarkStep {
        if self.hold_marking.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
            return MarkStep::default();
        }
        let mut step = MarkStep::default();
        for _ in 0..budget {
            let object = match self.grey.lock().pop() {
                Some(object) => object,
                None => break,
            };
            let (size, refs) = match self.objects.lock().get(&object) {
                Some(entry) => (entry.size, entry.refs.clone()),
                None => continue,
            };
            step.marked_bytes += size;
            let mut grey = self.grey.lock();
            for child in refs {
                if metadata.set_mark(child) {
                    grey.push(child);
                }
            }
        }
        step.done = self.grey.lock().is_empty();
        step
    }

    fn process_dirty(&self, objects: &[ObjectRef], metadata: &dyn CollectionMetadata) {
        self.dirty_processed
            .fetch_add(objects.len(), Ordering::AcqRel);
        let request = TraceRequest {
            roots: &[],
            scope: CollectionScope::Full,
            mode: TraceMode::Mark,
            remembered: None,
        };
        let children: Vec<ObjectRef> = {
            let graph = self.objects.lock();
            objects
                .iter()
                .filter_map(|object| graph.get(object))
                .flat_map(|entry| entry.refs.iter().copied())
                .collect()
        };
        self.mark_from(children, &request, metadata);
    }

    fn begin_concurrent_sweep(&self, _metadata: &dyn CollectionMetadata) {
        self.concurrent_sweep_starts.fetch_add(1, Ordering::AcqRel);
        self.marking.store(false, Ordering::Release);
        let ids: Vec<ObjectRef> = self.objects.lock().keys().copied().collect();
        *self.sweep_queue.lock() = ids;
    }

    fn sweep_step(&self, budget: usize, metadata: &dyn CollectionMetadata) -> SweepStep {
        if self.hold_sweeping.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
            return SweepStep::default();
        }
        let mut step = SweepStep::default();
        for _ in 0..budget {
            let object = match self.sweep_queue.lock().pop() {
                Some(object) => object,
                None => break,
            };
            if metadata.is_marked(object) {
                continue;
            }
            if let Some(entry) = self.objects.lock().remove(&object) {
                step.freed[entry.region] += entry.size;
                step.holes.push((entry.region, entry.size));
                metadata.forget(object);
            }
        }
        step.done = self.sweep_queue.lock().is_empty();
        step
    }

    fn end_concurrent_cycle(&self, _metadata: &dyn CollectionMetadata) {
        wait_while(&self.hold_cycle_end);
        self.cycle_ends.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct MemoryCounters {
    pub committed: AtomicUsize,
    pub commits: AtomicUsize,
    pub decommits: AtomicUsize,
}

/// Reservation that only counts.
pub struct MockMemory {
    reserved: usize,
    counters: Arc<MemoryCounters>,
}

impl VirtualMemory for MockMemory {
    fn reserved(&self) -> usize {
        self.reserved
    }

    fn commit(&self, offset: usize, size: usize) -> bool {
        if offset + size > self.reserved {
            return false;
        }
        self.counters.commits.fetch_add(1, Ordering::AcqRel);
        self.counters
            .committed
            .store(offset + size, Ordering::Release);
        true
    }

    fn decommit(&self, offset: usize, _size: usize) {
        self.counters.decommits.fetch_add(1, Ordering::AcqRel);
        self.counters.committed.store(offset, Ordering::Release);
    }
}

pub struct Fixture {
    pub heap: Arc<Heap>,
    pub graph: Arc<MockGraph>,
    pub runtime: Arc<MockRuntime>,
    pub metadata: Arc<SideTableMetadata>,
    pub memory: Arc<MemoryCounters>,
}

const KB: usize = 1024;

/// A heap small enough to fill in a test: 1M committed, 128K nursery, 256K
/// large object region, 640K mature region.
pub fn small_config() -> Config {
    Config {
        initial_heap_size: 1024 * KB,
        min_heap_size: 512 * KB,
        max_heap_size: 4096 * KB,
        young_size: 128 * KB,
        young_size_min: 64 * KB,
        young_size_max: 256 * KB,
        large_object_region_size: 256 * KB,
        large_object_region_min: 64 * KB,
        mature_region_min: 128 * KB,
        large_object_size: 16 * KB,
        block_size: 4 * KB,
        marker_threads: 2,
        sweeper_threads: 1,
        ..Config::default()
    }
}

pub fn fixture(config: Config) -> Fixture {
    init_logging();
    let graph = Arc::new(MockGraph::new());
    let runtime = Arc::new(MockRuntime::default());
    let metadata = Arc::new(SideTableMetadata::new());
    let memory = Arc::new(MemoryCounters::default());
    let collaborators = Collaborators::new(runtime.clone(), graph.clone())
        .with_metadata(metadata.clone())
        .with_memory(Box::new(MockMemory {
            reserved: config.max_heap_size,
            counters: memory.clone(),
        }));
    let heap = Heap::new(config, collaborators).expect("valid test configuration");
    Fixture {
        heap,
        graph,
        runtime,
        metadata,
        memory,
    }
}

impl Fixture {
    /// Allocates an object through the heap and records it in the graph.
    /// Objects allocated while a concurrent mark runs are allocated black.
    pub fn alloc(&self, size: usize, refs: Vec<ObjectRef>) -> ObjectRef {
        let region = self.heap.allocate(size).expect("allocation failed");
        let object = self.graph.insert(region, size, refs);
        if self.graph.is_marking() {
            self.metadata.set_mark(object);
        }
        object
    }

    pub fn alloc_root(&self, size: usize) -> ObjectRef {
        let object = self.alloc(size, Vec::new());
        self.runtime.add_root(object);
        object
    }

    pub fn used(&self) -> PerRegion<usize> {
        self.heap.used_per_region()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Distinct objects, for tests that never touch the graph.
pub fn refs(count: usize) -> Vec<ObjectRef> {
    (1..=count)
        .map(|id| ObjectRef::from_address(id * ObjectRef::ALIGNMENT))
        .collect()
}
