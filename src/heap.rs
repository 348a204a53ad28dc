use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use atomic::Atomic;
use parking_lot::{Mutex, RwLock};

use crate::collection_barrier::CollectionBarrier;
use crate::collector::{CollectionKind, GcCause};
use crate::concurrent::barrier::{LocalBuffers, MutatorBuffer};
use crate::concurrent::ConcurrentCollector;
use crate::config::{AlgorithmKind, Config};
use crate::error::{AllocationError, ConfigError};
use crate::finalization::{FinalizationMetadata, ReferenceEntry, ReferenceKind};
use crate::gen_mode::{GenMode, GenModeAdaptor, NurserySizer};
use crate::header::CollectionMetadata;
use crate::mmap::{self, VirtualMemory};
use crate::object::ObjectRef;
use crate::phase::{ConcurrentPhase, PhaseCell};
use crate::runtime::{Collaborators, MutatorRuntime, ObjectGraph};
use crate::safepoint::{GlobalSafepoint, StopTheWorld};
use crate::space::{PerRegion, Region, RegionKind};
use crate::statistics::{ConcurrentCycleStatistics, HeapStatistics, PauseLog, PauseRecord};
use crate::strategy::{self, CollectionStrategy};
use crate::tuner::{RegionView, SpaceTuner, Transfer, TransferDirection};
use crate::util::{align_down, align_up, formatted_size};

/// Smallest hole worth keeping in a free-area bucket.
const MIN_HOLE: usize = 2 * ObjectRef::ALIGNMENT;

/// Allocation attempts that are followed by a collection before giving up.
const ALLOCATION_RETRIES: usize = 2;

/// The collected heap.
///
/// The heap owns the regions and all collection state. Mutators allocate
/// through [`Heap::allocate`] and report reference stores through the buffer
/// returned by [`Heap::attach_mutator`]. Collections are started by
/// [`Heap::reclaim_heap`], either directly or when an allocation fails.
pub struct Heap {
    pub(crate) config: Config,
    pub(crate) runtime: Arc<dyn MutatorRuntime>,
    pub(crate) graph: Arc<dyn ObjectGraph>,
    pub(crate) metadata: Arc<dyn CollectionMetadata>,
    memory: Box<dyn VirtualMemory>,
    pub(crate) strategy: Box<dyn CollectionStrategy>,
    pub(crate) regions: PerRegion<Region>,
    heap_committed: AtomicUsize,

    pub(crate) phase: PhaseCell,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) enumeration_lock: Mutex<()>,
    pub(crate) mark_lock: RwLock<()>,
    pub(crate) sweep_lock: RwLock<()>,
    pub(crate) scheduling_lock: Mutex<()>,
    pub(crate) collection_barrier: CollectionBarrier,

    pub(crate) tuner: Mutex<SpaceTuner>,
    pub(crate) adaptor: Mutex<GenModeAdaptor>,
    pub(crate) nursery: NurserySizer,
    pub(crate) finalization: Mutex<FinalizationMetadata>,
    remembered: Mutex<Vec<Vec<ObjectRef>>>,
    mutator_buffers: Mutex<Vec<Weak<Mutex<LocalBuffers>>>>,
    concurrent: Option<ConcurrentCollector>,
    pub(crate) cycle_stats: ConcurrentCycleStatistics,
    pauses: PauseLog,

    total_gcs: AtomicUsize,
    minor_gcs: AtomicUsize,
    major_gcs: AtomicUsize,
    concurrent_gcs: AtomicUsize,
    total_pause_nanos: AtomicU64,
    last_collection: Atomic<Option<CollectionKind>>,
    last_transfer: Mutex<Option<Transfer>>,
    pub(crate) force_major_request: AtomicBool,
    pub(crate) last_cycle_end: Mutex<Instant>,
    allocated_at_last_cycle: AtomicUsize,
}

impl Heap {
    /// Validates `config`, commits the initial heap and starts the concurrent
    /// workers if concurrent collection is configured.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Arc<Heap>, ConfigError> {
        config.validate()?;
        let Collaborators {
            runtime,
            graph,
            metadata,
            memory,
        } = collaborators;
        let memory = match memory {
            Some(memory) => memory,
            None => mmap::reserve(config.max_heap_size)?,
        };
        if memory.reserved() < config.max_heap_size {
            return Err(ConfigError::ReservationFailed(config.max_heap_size));
        }
        if !memory.commit(0, config.initial_heap_size) {
            return Err(ConfigError::ReservationFailed(config.initial_heap_size));
        }

        let young = config.initial_young_size();
        let large = config.large_object_region_size;
        let mature = config.initial_heap_size - young - large;
        let young_min = if young == 0 { 0 } else { config.young_size_min };
        let regions = PerRegion::new(
            Region::new(RegionKind::Young, young, young_min, MIN_HOLE),
            Region::new(RegionKind::Mature, mature, config.mature_region_min, MIN_HOLE),
            Region::new(
                RegionKind::LargeObject,
                large,
                config.large_object_region_min,
                MIN_HOLE,
            ),
        );

        let initial_mode = if config.generational {
            GenMode::Generational
        } else {
            GenMode::NonGenerational
        };
        let adaptive = config.algorithm == AlgorithmKind::Generational;
        let concurrent = config
            .concurrent
            .map(|variant| ConcurrentCollector::new(&config, variant));

        let heap = Arc::new(Heap {
            runtime: runtime.clone(),
            graph,
            metadata,
            memory,
            strategy: strategy::for_algorithm(config.algorithm),
            regions,
            heap_committed: AtomicUsize::new(config.initial_heap_size),
            phase: PhaseCell::new(),
            safepoint: GlobalSafepoint::new(runtime),
            enumeration_lock: Mutex::new(()),
            mark_lock: RwLock::new(()),
            sweep_lock: RwLock::new(()),
            scheduling_lock: Mutex::new(()),
            collection_barrier: CollectionBarrier::new(),
            tuner: Mutex::new(SpaceTuner::new(config.block_size, &config.tuning)),
            adaptor: Mutex::new(GenModeAdaptor::new(initial_mode, adaptive, &config.tuning)),
            nursery: NurserySizer::new(
                config.young_size_min,
                config.young_size_max,
                config.block_size,
                &config.tuning,
            ),
            finalization: Mutex::new(FinalizationMetadata::new()),
            remembered: Mutex::new(Vec::new()),
            mutator_buffers: Mutex::new(Vec::new()),
            concurrent,
            cycle_stats: ConcurrentCycleStatistics::new(),
            pauses: PauseLog::new(config.tuning.pause_log_capacity),
            total_gcs: AtomicUsize::new(0),
            minor_gcs: AtomicUsize::new(0),
            major_gcs: AtomicUsize::new(0),
            concurrent_gcs: AtomicUsize::new(0),
            total_pause_nanos: AtomicU64::new(0),
            last_collection: Atomic::new(None),
            last_transfer: Mutex::new(None),
            force_major_request: AtomicBool::new(false),
            last_cycle_end: Mutex::new(Instant::now()),
            allocated_at_last_cycle: AtomicUsize::new(0),
            config,
        });

        match &heap.concurrent {
            Some(collector) => {
                if let Err(error) = collector.spawn_workers(&heap) {
                    log::error!("[gc] failed to start collector threads: {}", error);
                    heap.phase
                        .try_transition(ConcurrentPhase::Idle, ConcurrentPhase::Disabled);
                }
            }
            None => {
                heap.phase
                    .try_transition(ConcurrentPhase::Idle, ConcurrentPhase::Disabled);
            }
        }

        logln_if!(
            heap.config.verbose,
            "[gc] Heap initialized {:?}: young {}, mature {}, large object {} (max {})",
            heap.config.algorithm,
            formatted_size(heap.regions[RegionKind::Young].committed()),
            formatted_size(heap.regions[RegionKind::Mature].committed()),
            formatted_size(heap.regions[RegionKind::LargeObject].committed()),
            formatted_size(heap.config.max_heap_size)
        );
        Ok(heap)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &dyn ObjectGraph {
        &*self.graph
    }

    pub fn metadata(&self) -> &dyn CollectionMetadata {
        &*self.metadata
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        &self.regions[kind]
    }

    pub(crate) fn concurrent(&self) -> Option<&ConcurrentCollector> {
        self.concurrent.as_ref()
    }

    /// Region an allocation of `size` bytes goes to.
    pub fn region_for(&self, size: usize) -> RegionKind {
        if size >= self.config.large_object_size {
            RegionKind::LargeObject
        } else if self.config.algorithm.has_young_region()
            && size <= self.regions[RegionKind::Young].committed()
        {
            RegionKind::Young
        } else {
            RegionKind::Mature
        }
    }

    /// Accounts an allocation of `size` bytes. Collects and retries when the
    /// target region is full.
    pub fn allocate(&self, size: usize) -> Result<RegionKind, AllocationError> {
        let size = align_up(size.max(1), ObjectRef::ALIGNMENT);
        let mut region = self.region_for(size);
        for attempt in 0..=ALLOCATION_RETRIES {
            let epoch = self.collection_barrier.epoch();
            if self.regions[region].allocate(size) {
                if region != RegionKind::Young {
                    self.maybe_start_concurrent();
                }
                return Ok(region);
            }
            if attempt == ALLOCATION_RETRIES {
                break;
            }
            let cause = match region {
                RegionKind::Young => GcCause::YoungRegionFull,
                RegionKind::Mature => GcCause::MatureRegionFull,
                RegionKind::LargeObject => GcCause::LargeObjectRegionFull,
            };
            self.reclaim_heap_observed(cause, epoch, size);
            // the nursery may have shrunk below the request
            region = self.region_for(size);
        }
        log::warn!(
            "[gc] out of memory allocating {} in the {} region",
            formatted_size(size),
            region.name()
        );
        Err(AllocationError::OutOfMemory {
            region,
            requested: size,
        })
    }

    fn maybe_start_concurrent(&self) {
        if self.concurrent.is_none() || self.phase.current() != ConcurrentPhase::Idle {
            return;
        }
        let mature = &self.regions[RegionKind::Mature];
        let large = &self.regions[RegionKind::LargeObject];
        let committed = mature.committed() + large.committed();
        if committed == 0 {
            return;
        }
        let occupancy = (mature.used() + large.used()) as f64 / committed as f64;
        if occupancy >= self.config.tuning.concurrent_trigger_ratio {
            self.reclaim_heap(GcCause::ConcurrentTrigger);
        }
    }

    /// Makes the next collection a major one.
    pub fn request_major(&self) {
        self.force_major_request.store(true, Ordering::Release);
    }

    /// Returns the write-barrier buffer of a new mutator.
    pub fn attach_mutator(self: &Arc<Self>) -> MutatorBuffer {
        let local = Arc::new(Mutex::new(LocalBuffers::default()));
        let mut buffers = self.mutator_buffers.lock();
        buffers.retain(|buffer| buffer.strong_count() != 0);
        buffers.push(Arc::downgrade(&local));
        drop(buffers);
        MutatorBuffer::new(self.clone(), local)
    }

    pub(crate) fn maintains_remembered_set(&self) -> bool {
        self.config.algorithm == AlgorithmKind::Generational
    }

    pub(crate) fn push_remembered(&self, block: Vec<ObjectRef>) {
        self.remembered.lock().push(block);
    }

    fn for_each_mutator_buffer(&self, mut visitor: impl FnMut(&mut LocalBuffers)) {
        let buffers = self.mutator_buffers.lock();
        for buffer in buffers.iter().filter_map(Weak::upgrade) {
            visitor(&mut buffer.lock());
        }
    }

    /// Remembered set for a minor collection: the pooled blocks plus whatever
    /// mutators still buffer.
    pub(crate) fn drain_remembered(&self, _stw: &StopTheWorld<'_>) -> Vec<ObjectRef> {
        let mut remembered: Vec<ObjectRef> =
            std::mem::take(&mut *self.remembered.lock()).concat();
        self.for_each_mutator_buffer(|local| remembered.append(&mut local.remembered));
        remembered.sort_unstable();
        remembered.dedup();
        remembered
    }

    pub(crate) fn flush_mutator_dirty(&self) {
        if let Some(collector) = &self.concurrent {
            let mut batches = Vec::new();
            self.for_each_mutator_buffer(|local| {
                if !local.dirty.is_empty() {
                    batches.push(std::mem::take(&mut local.dirty));
                }
            });
            for batch in batches {
                collector.submit_dirty(batch);
            }
        }
    }

    pub(crate) fn enumerate_roots(&self) -> Vec<ObjectRef> {
        let _enumeration = self.enumeration_lock.lock();
        let mut roots = Vec::new();
        self.runtime.enumerate_roots(&mut |object| roots.push(object));
        self.finalization
            .lock()
            .for_each_root(|object| roots.push(object));
        roots
    }

    pub(crate) fn used_per_region(&self) -> PerRegion<usize> {
        PerRegion::new(
            self.regions[RegionKind::Young].used(),
            self.regions[RegionKind::Mature].used(),
            self.regions[RegionKind::LargeObject].used(),
        )
    }

    pub(crate) fn allocated_total(&self) -> usize {
        RegionKind::ALL
            .iter()
            .map(|&kind| self.regions[kind].allocated_total())
            .sum()
    }

    pub(crate) fn allocated_since_last_cycle(&self) -> usize {
        self.allocated_total()
            .saturating_sub(self.allocated_at_last_cycle.load(Ordering::Relaxed))
    }

    pub(crate) fn mark_cycle_end(&self) {
        self.allocated_at_last_cycle
            .store(self.allocated_total(), Ordering::Relaxed);
        *self.last_cycle_end.lock() = Instant::now();
    }

    pub(crate) fn record_collection(&self, kind: CollectionKind, concurrent: bool) {
        self.total_gcs.fetch_add(1, Ordering::AcqRel);
        match kind {
            CollectionKind::Minor(_) => self.minor_gcs.fetch_add(1, Ordering::Relaxed),
            CollectionKind::Major => self.major_gcs.fetch_add(1, Ordering::Relaxed),
        };
        if concurrent {
            self.concurrent_gcs.fetch_add(1, Ordering::Relaxed);
        }
        self.last_collection.store(Some(kind), Ordering::Release);
    }

    pub(crate) fn record_pause(&self, record: PauseRecord) {
        self.total_pause_nanos
            .fetch_add(record.duration.as_nanos() as u64, Ordering::Relaxed);
        self.pauses.push(record);
    }

    /// Applies the space tuner's pending transfer. Needs a quiescent heap.
    pub(crate) fn apply_pending_transfer(&self, _stw: &StopTheWorld<'_>) -> Option<Transfer> {
        let transfer = self.tuner.lock().take_transfer()?;
        let (giver, taker) = match transfer.direction {
            TransferDirection::IntoLarge => (RegionKind::Mature, RegionKind::LargeObject),
            TransferDirection::IntoMature => (RegionKind::LargeObject, RegionKind::Mature),
        };
        let giver = &self.regions[giver];
        let taker = &self.regions[taker];
        let view = RegionView::of(giver);
        let size = align_down(
            transfer
                .size
                .min(view.tail_free)
                .min(view.committed.saturating_sub(view.minimum)),
            self.config.block_size,
        );
        if size == 0 {
            return None;
        }
        giver.resize(giver.committed() - size);
        taker.resize(taker.committed() + size);
        let applied = Transfer {
            direction: transfer.direction,
            size,
        };
        *self.last_transfer.lock() = Some(applied);
        logln_if!(
            self.config.verbose,
            "[gc] Moved {} from the {} region to the {} region",
            formatted_size(size),
            giver.kind().name(),
            taker.kind().name()
        );
        Some(applied)
    }

    /// Resizes the nursery after a minor collection left it empty.
    pub(crate) fn resize_nursery(&self, _stw: &StopTheWorld<'_>) {
        let young = &self.regions[RegionKind::Young];
        let mature = &self.regions[RegionKind::Mature];
        if young.used() != 0 {
            return;
        }
        let current = young.committed();
        let target = self
            .nursery
            .target(current, mature.free(), young.survive_ratio());
        if target > current {
            let view = RegionView::of(mature);
            let grow = align_down(
                (target - current)
                    .min(view.tail_free)
                    .min(view.committed.saturating_sub(view.minimum)),
                self.config.block_size,
            );
            if grow == 0 {
                return;
            }
            mature.resize(mature.committed() - grow);
            young.resize(current + grow);
        } else if target < current {
            let shrink = current - target;
            young.resize(target);
            mature.resize(mature.committed() + shrink);
        } else {
            return;
        }
        log::debug!(
            "[gc] nursery resized {} -> {}",
            formatted_size(current),
            formatted_size(young.committed())
        );
    }

    /// Grows or shrinks the committed heap after a major collection. New
    /// capacity is given to, and taken from, the mature region.
    pub(crate) fn resize_heap(&self, _stw: &StopTheWorld<'_>) {
        let committed = self.heap_committed.load(Ordering::Acquire);
        let used = self.used_per_region().total();
        let occupancy = used as f64 / committed.max(1) as f64;
        let tuning = &self.config.tuning;
        let block = self.config.block_size;
        let mature = &self.regions[RegionKind::Mature];

        if occupancy > tuning.grow_threshold {
            let target = align_down(
                ((committed as f64 * tuning.growth_rate) as usize).min(self.config.max_heap_size),
                block,
            );
            if target <= committed {
                return;
            }
            let delta = target - committed;
            if !self.memory.commit(committed, delta) {
                log::warn!("[gc] failed to commit {} more heap", formatted_size(delta));
                return;
            }
            mature.resize(mature.committed() + delta);
            self.heap_committed.store(target, Ordering::Release);
            logln_if!(
                self.config.verbose,
                "[gc] Heap grown to {} ({:.1}% occupied)",
                formatted_size(target),
                occupancy * 100.0
            );
        } else if occupancy < tuning.shrink_threshold {
            let target = align_up(
                ((committed as f64 / tuning.growth_rate) as usize).max(self.config.min_heap_size),
                block,
            );
            if target >= committed {
                return;
            }
            let view = RegionView::of(mature);
            let delta = align_down(
                (committed - target)
                    .min(view.tail_free)
                    .min(view.committed.saturating_sub(view.minimum)),
                block,
            );
            if delta == 0 {
                return;
            }
            mature.resize(mature.committed() - delta);
            self.memory.decommit(committed - delta, delta);
            self.heap_committed.store(committed - delta, Ordering::Release);
            logln_if!(
                self.config.verbose,
                "[gc] Heap shrunk to {} ({:.1}% occupied)",
                formatted_size(committed - delta),
                occupancy * 100.0
            );
        }
    }

    pub fn register_finalizer(&self, object: ObjectRef) -> bool {
        self.finalization.lock().register_finalizer(object)
    }

    pub fn register_reference(&self, kind: ReferenceKind, reference: ObjectRef, referent: ObjectRef) {
        self.finalization
            .lock()
            .register_reference(kind, reference, referent);
    }

    /// Objects whose finalizers are due. Each object is returned once per death.
    pub fn take_finalizable(&self) -> Vec<ObjectRef> {
        self.finalization.lock().take_finalizable()
    }

    pub fn take_cleared(&self, kind: ReferenceKind) -> Vec<ReferenceEntry> {
        self.finalization.lock().take_cleared(kind)
    }

    pub fn finalizers_pending(&self) -> bool {
        self.finalization.lock().finalizers_pending()
    }

    /// Switches concurrent collection off once the cycle in flight is over.
    /// Waits without the scheduling lock, which the drivers of the cycle take.
    pub fn disable_concurrent(&self) {
        if self.concurrent.is_none() {
            return;
        }
        let backoff = crossbeam_utils::Backoff::new();
        loop {
            match self.phase.current() {
                ConcurrentPhase::Disabled => return,
                ConcurrentPhase::Idle => {
                    if self
                        .phase
                        .try_transition(ConcurrentPhase::Idle, ConcurrentPhase::Disabled)
                    {
                        return;
                    }
                }
                _ => backoff.snooze(),
            }
        }
    }

    pub fn enable_concurrent(&self) -> bool {
        self.concurrent.is_some()
            && self
                .phase
                .try_transition(ConcurrentPhase::Disabled, ConcurrentPhase::Idle)
    }

    /// Stops the background threads. Collections afterwards run stop-the-world.
    pub fn shutdown(&self) {
        if let Some(collector) = &self.concurrent {
            self.disable_concurrent();
            collector.shutdown();
        }
    }

    pub fn collection_count(&self) -> usize {
        self.total_gcs.load(Ordering::Acquire)
    }

    /// Used bytes over committed bytes, over all regions.
    pub fn utilization(&self) -> f64 {
        let committed = self.heap_committed.load(Ordering::Acquire);
        if committed == 0 {
            return 0.0;
        }
        self.used_per_region().total() as f64 / committed as f64
    }

    pub fn committed(&self) -> usize {
        self.heap_committed.load(Ordering::Acquire)
    }

    pub fn current_phase(&self) -> ConcurrentPhase {
        self.phase.current()
    }

    pub fn phase_cell(&self) -> &PhaseCell {
        &self.phase
    }

    pub fn last_collection(&self) -> Option<CollectionKind> {
        self.last_collection.load(Ordering::Acquire)
    }

    pub fn last_transfer(&self) -> Option<Transfer> {
        *self.last_transfer.lock()
    }

    pub fn generational_mode(&self) -> GenMode {
        self.adaptor.lock().active()
    }

    pub fn completion_in_progress(&self) -> bool {
        self.concurrent
            .as_ref()
            .map(|collector| collector.completion_in_progress())
            .unwrap_or(false)
    }

    /// Threads blocked in [`Heap::reclaim_heap`] behind a running collection.
    pub fn waiting_collectors(&self) -> usize {
        self.collection_barrier.waiters()
    }

    pub fn pauses(&self) -> Vec<PauseRecord> {
        self.pauses.records()
    }

    pub fn statistics(&self) -> HeapStatistics {
        let regions = &self.regions;
        HeapStatistics {
            committed: PerRegion::new(
                regions[RegionKind::Young].committed(),
                regions[RegionKind::Mature].committed(),
                regions[RegionKind::LargeObject].committed(),
            ),
            used: self.used_per_region(),
            survive_ratio: PerRegion::new(
                regions[RegionKind::Young].survive_ratio(),
                regions[RegionKind::Mature].survive_ratio(),
                regions[RegionKind::LargeObject].survive_ratio(),
            ),
            allocated_total: self.allocated_total(),
            heap_limit: self.config.max_heap_size,
            total_gc_cycles_count: self.collection_count(),
            minor_collections: self.minor_gcs.load(Ordering::Relaxed),
            major_collections: self.major_gcs.load(Ordering::Relaxed),
            concurrent_cycles: self.concurrent_gcs.load(Ordering::Relaxed),
            last_collection: self.last_collection(),
            phase: self.current_phase(),
            total_pause: Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed)),
            last_concurrent_cycle: self.cycle_stats.last_cycle(),
        }
    }
}
