//! Collection cycles that run next to the mutators.
//!
//! Whoever finishes a piece of work moves the phase on: the initiator starts
//! the markers, the last marker ends tracing, a driver holding the scheduling
//! lock prepares and finishes the sweep, the last sweeper ends sweeping. When
//! the heap runs out of memory in the middle of a cycle the orchestrator takes
//! the scheduling lock and completes the cycle itself.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::collector::{CompletionPath, GcCause};
use crate::config::{Config, ConcurrentVariant};
use crate::error::{fatal, IllegalState};
use crate::finalization::ResurrectionEngine;
use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::phase::ConcurrentPhase;
use crate::runtime::{CollectionScope, ReclaimSummary, ScopedLiveness, SweepStep, TraceMode, TraceRequest};
use crate::space::{PerRegion, RegionKind};
use crate::statistics::{PauseKind, PauseRecord};
use crate::util::millis;

pub mod barrier;
pub mod worker;

use worker::{Terminator, WorkerRole, WorkerTask};

/// Bookkeeping of the cycle in flight.
#[derive(Clone, Debug)]
pub(crate) struct CycleState {
    pub(crate) number: usize,
    pub(crate) cause: GcCause,
    pub(crate) started: Instant,
    pub(crate) used_before: PerRegion<usize>,
    pub(crate) allocated_at_start: usize,
}

#[derive(Default)]
struct SweepResults {
    freed: PerRegion<usize>,
    holes: PerRegion<Vec<usize>>,
}

impl SweepResults {
    fn absorb_step(&mut self, step: SweepStep) {
        for kind in RegionKind::ALL {
            self.freed[kind] += step.freed[kind];
        }
        for (kind, hole) in step.holes {
            self.holes[kind].push(hole);
        }
    }

    fn absorb_reclaim(&mut self, summary: ReclaimSummary) {
        for kind in RegionKind::ALL {
            self.freed[kind] += summary.freed[kind];
        }
        for (kind, region) in summary.regions.iter() {
            self.holes[kind].extend_from_slice(&region.holes);
        }
    }
}

pub struct ConcurrentCollector {
    variant: ConcurrentVariant,
    markers: usize,
    sweepers: usize,
    marker_tx: Sender<WorkerTask>,
    sweeper_tx: Sender<WorkerTask>,
    receivers: Mutex<Option<(Receiver<WorkerTask>, Receiver<WorkerTask>)>>,
    dirty_tx: Sender<Vec<ObjectRef>>,
    dirty_rx: Receiver<Vec<ObjectRef>>,
    overflow: Mutex<Vec<Vec<ObjectRef>>>,
    active_markers: CachePadded<AtomicUsize>,
    active_sweepers: CachePadded<AtomicUsize>,
    terminator: Terminator,
    sweep_results: Mutex<SweepResults>,
    cycle: Mutex<Option<CycleState>>,
    drive_requested: AtomicBool,
    completion_in_progress: AtomicBool,
    mark_started: Mutex<Option<Instant>>,
    mark_busy_nanos: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrentCollector {
    pub(crate) fn new(config: &Config, variant: ConcurrentVariant) -> Self {
        let (marker_tx, marker_rx) = crossbeam_channel::unbounded();
        let (sweeper_tx, sweeper_rx) = crossbeam_channel::unbounded();
        let (dirty_tx, dirty_rx) =
            crossbeam_channel::bounded(config.tuning.dirty_channel_capacity);
        let sweepers = match variant {
            ConcurrentVariant::MarkAndSweep => config.sweeper_threads,
            ConcurrentVariant::MarkOnly => 0,
        };
        Self {
            variant,
            markers: config.marker_threads,
            sweepers,
            marker_tx,
            sweeper_tx,
            receivers: Mutex::new(Some((marker_rx, sweeper_rx))),
            dirty_tx,
            dirty_rx,
            overflow: Mutex::new(Vec::new()),
            active_markers: CachePadded::new(AtomicUsize::new(0)),
            active_sweepers: CachePadded::new(AtomicUsize::new(0)),
            terminator: Terminator::new(config.marker_threads),
            sweep_results: Mutex::new(SweepResults::default()),
            cycle: Mutex::new(None),
            drive_requested: AtomicBool::new(false),
            completion_in_progress: AtomicBool::new(false),
            mark_started: Mutex::new(None),
            mark_busy_nanos: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn variant(&self) -> ConcurrentVariant {
        self.variant
    }

    pub fn active_markers(&self) -> usize {
        self.active_markers.load(Ordering::Acquire)
    }

    pub fn active_sweepers(&self) -> usize {
        self.active_sweepers.load(Ordering::Acquire)
    }

    /// The orchestrator is bringing a cycle to its end.
    pub fn completion_in_progress(&self) -> bool {
        self.completion_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn spawn_workers(&self, heap: &Arc<Heap>) -> std::io::Result<()> {
        let (marker_rx, sweeper_rx) = match self.receivers.lock().take() {
            Some(receivers) => receivers,
            None => return Ok(()),
        };
        let mut handles = self.handles.lock();
        for index in 0..self.markers {
            handles.push(worker::spawn(
                WorkerRole::Marker,
                index,
                Arc::downgrade(heap),
                marker_rx.clone(),
            )?);
        }
        for index in 0..self.sweepers {
            handles.push(worker::spawn(
                WorkerRole::Sweeper,
                index,
                Arc::downgrade(heap),
                sweeper_rx.clone(),
            )?);
        }
        Ok(())
    }

    /// Stops every worker and waits for them.
    pub(crate) fn shutdown(&self) {
        for _ in 0..self.markers {
            let _ = self.marker_tx.send(WorkerTask::Shutdown);
        }
        for _ in 0..self.sweepers {
            let _ = self.sweeper_tx.send(WorkerTask::Shutdown);
        }
        let current = std::thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// Hands a batch of modified objects to the markers.
    pub(crate) fn submit_dirty(&self, batch: Vec<ObjectRef>) {
        match self.dirty_tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => self.overflow.lock().push(batch),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn drain_dirty(&self, heap: &Heap) -> usize {
        let metadata = &*heap.metadata;
        let mut drained = 0;
        while let Ok(batch) = self.dirty_rx.try_recv() {
            drained += batch.len();
            heap.graph.process_dirty(&batch, metadata);
        }
        let spilled = std::mem::take(&mut *self.overflow.lock());
        for batch in spilled {
            drained += batch.len();
            heap.graph.process_dirty(&batch, metadata);
        }
        drained
    }

    /// Root enumeration and marker start. Called by the thread that holds the
    /// collection ticket. Returns `false` if no cycle was started.
    pub(crate) fn start(&self, heap: &Heap, cause: GcCause) -> bool {
        let scheduling = heap.scheduling_lock.lock();
        if !heap.phase.try_transition(ConcurrentPhase::Idle, ConcurrentPhase::StopTheWorldEnumerate) {
            return false;
        }
        let stw = heap.safepoint.stop_the_world();
        heap.apply_pending_transfer(&stw);
        heap.metadata.begin_cycle();
        let roots = heap.enumerate_roots();
        let used_before = heap.used_per_region();
        let allocated = heap.allocated_total();
        let number = heap.collection_count();

        if !heap.phase.try_transition(
            ConcurrentPhase::StopTheWorldEnumerate,
            ConcurrentPhase::MarkersStarting,
        ) {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "starting markers",
            });
        }
        heap.cycle_stats
            .set_alloc_before_tracking(heap.allocated_since_last_cycle());
        *self.cycle.lock() = Some(CycleState {
            number,
            cause,
            started: Instant::now(),
            used_before,
            allocated_at_start: allocated,
        });
        self.active_markers.store(self.markers, Ordering::Release);
        self.terminator.reset(self.markers);
        self.mark_busy_nanos.store(0, Ordering::Relaxed);
        *self.mark_started.lock() = Some(Instant::now());
        heap.graph.begin_concurrent_mark(&roots, &*heap.metadata);
        if !heap.phase.try_transition(ConcurrentPhase::MarkersStarting, ConcurrentPhase::Tracing) {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "starting markers",
            });
        }
        let pause = stw.elapsed();
        drop(stw);
        // the last marker drives the cycle on and needs the lock
        drop(scheduling);

        for _ in 0..self.markers {
            if self.marker_tx.send(WorkerTask::Mark).is_err() {
                fatal(IllegalState::Invariant("marker threads are gone"));
            }
        }

        heap.record_pause(PauseRecord {
            cycle: number,
            cause,
            kind: PauseKind::ConcurrentStart,
            duration: pause,
        });
        logln_if!(
            heap.config.verbose,
            "[gc] GC({}) Pause Init Mark ({:?}) {} roots {:.4}ms",
            number,
            cause,
            roots.len(),
            millis(pause)
        );
        true
    }

    pub(crate) fn run_marker(&self, heap: &Heap) {
        let budget = heap.config.tuning.mark_step_budget;
        let started = Instant::now();
        loop {
            let step = {
                let _marking = heap.mark_lock.read();
                self.drain_dirty(heap);
                heap.graph.mark_step(budget, &*heap.metadata)
            };
            heap.cycle_stats.add_marked(step.marked_bytes);
            if step.done && self.terminator.try_terminate() {
                break;
            }
        }
        self.mark_busy_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if self.active_markers.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !heap
                .phase
                .try_transition(ConcurrentPhase::Tracing, ConcurrentPhase::TraceDone)
            {
                fatal(IllegalState::UnexpectedPhase {
                    observed: heap.phase.current(),
                    expected: "the last marker finished",
                });
            }
            self.record_mark_rates(heap);
            self.kick(heap);
        }
    }

    pub(crate) fn run_sweeper(&self, heap: &Heap) {
        let budget = heap.config.tuning.sweep_step_budget;
        loop {
            let step = {
                let _sweeping = heap.sweep_lock.read();
                heap.graph.sweep_step(budget, &*heap.metadata)
            };
            let done = step.done;
            self.sweep_results.lock().absorb_step(step);
            if done {
                break;
            }
        }

        if self.active_sweepers.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !heap
                .phase
                .try_transition(ConcurrentPhase::Sweeping, ConcurrentPhase::SweepDone)
            {
                fatal(IllegalState::UnexpectedPhase {
                    observed: heap.phase.current(),
                    expected: "the last sweeper finished",
                });
            }
            self.kick(heap);
        }
    }

    fn record_mark_rates(&self, heap: &Heap) {
        let elapsed = match *self.mark_started.lock() {
            Some(started) => started.elapsed().as_secs_f64().max(1e-9),
            None => return,
        };
        let marked = heap.cycle_stats.snapshot().live_bytes_marked as f64;
        let allocated = match &*self.cycle.lock() {
            Some(cycle) => heap.allocated_total().saturating_sub(cycle.allocated_at_start) as f64,
            None => 0.0,
        };
        let busy = self.mark_busy_nanos.load(Ordering::Relaxed) as f64 / 1e9;
        let utilization = (busy / (elapsed * self.markers.max(1) as f64)).min(1.0);
        heap.cycle_stats
            .record_rates(marked / elapsed, allocated / elapsed, utilization);
    }

    /// Asks for the phase to be advanced. Only one thread drives at a time; a
    /// request that arrives while another thread drives is picked up by it.
    pub(crate) fn kick(&self, heap: &Heap) {
        self.drive_requested.store(true, Ordering::Release);
        while self.drive_requested.load(Ordering::Acquire) {
            let _scheduling = match heap.scheduling_lock.try_lock() {
                Some(guard) => guard,
                None => return,
            };
            self.drive_requested.store(false, Ordering::Release);
            // a completing orchestrator drives the rest of the cycle itself
            while !self.completion_in_progress() && self.drive_step(heap, false) {}
        }
    }

    /// Performs the next driver transition, if the phase has one. `takeover`
    /// makes the sweep run inline instead of on the sweepers.
    /// Must be called with the scheduling lock held.
    fn drive_step(&self, heap: &Heap, takeover: bool) -> bool {
        match heap.phase.current() {
            ConcurrentPhase::TraceDone => {
                self.finish_marking(heap);
                true
            }
            ConcurrentPhase::BeforeSweep => {
                self.start_sweeping(heap, takeover);
                true
            }
            ConcurrentPhase::SweepDone => {
                self.merge_sweep(heap);
                true
            }
            ConcurrentPhase::BeforeFinish => {
                self.finish_cycle(heap);
                true
            }
            ConcurrentPhase::Resetting => {
                heap.phase
                    .try_transition(ConcurrentPhase::Resetting, ConcurrentPhase::Idle);
                true
            }
            _ => false,
        }
    }

    fn finish_marking(&self, heap: &Heap) {
        let _marking = heap.mark_lock.write();
        self.drain_dirty(heap);
        heap.flush_mutator_dirty();
        self.drain_dirty(heap);
        if !heap
            .phase
            .try_transition(ConcurrentPhase::TraceDone, ConcurrentPhase::BeforeSweep)
        {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "finishing marking",
            });
        }
        self.drain_dirty(heap);

        let request = TraceRequest {
            roots: &[],
            scope: CollectionScope::Full,
            mode: TraceMode::Mark,
            remembered: None,
        };
        let liveness = ScopedLiveness {
            metadata: &*heap.metadata,
            graph: &*heap.graph,
            scope: CollectionScope::Full,
        };
        let mut pools = heap.finalization.lock();
        let resolved = ResurrectionEngine::resolve(&mut pools, &liveness, &mut |object| {
            heap.graph.retrace(object, &request, &*heap.metadata)
        });
        drop(pools);
        match resolved {
            Ok(report) => heap
                .cycle_stats
                .add_marked(report.resurrected.live.total()),
            Err(_) => fatal(IllegalState::FallbackOutsideMinor("concurrent")),
        }
    }

    fn start_sweeping(&self, heap: &Heap, takeover: bool) {
        if self.variant == ConcurrentVariant::MarkOnly || takeover {
            let stw = heap.safepoint.stop_the_world();
            if !heap
                .phase
                .try_transition(ConcurrentPhase::BeforeSweep, ConcurrentPhase::Sweeping)
            {
                fatal(IllegalState::UnexpectedPhase {
                    observed: heap.phase.current(),
                    expected: "sweeping inline",
                });
            }
            let summary = heap.graph.sweep(CollectionScope::Full, &*heap.metadata);
            self.sweep_results.lock().absorb_reclaim(summary);
            heap.phase
                .try_transition(ConcurrentPhase::Sweeping, ConcurrentPhase::SweepDone);
            log::trace!("[gc] inline sweep took {:.4}ms", millis(stw.elapsed()));
            return;
        }

        self.active_sweepers.store(self.sweepers, Ordering::Release);
        heap.graph.begin_concurrent_sweep(&*heap.metadata);
        if !heap
            .phase
            .try_transition(ConcurrentPhase::BeforeSweep, ConcurrentPhase::Sweeping)
        {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "starting sweepers",
            });
        }
        for _ in 0..self.sweepers {
            if self.sweeper_tx.send(WorkerTask::Sweep).is_err() {
                fatal(IllegalState::Invariant("sweeper threads are gone"));
            }
        }
    }

    fn merge_sweep(&self, heap: &Heap) {
        let _sweeping = heap.sweep_lock.write();
        if self.active_sweepers() != 0 {
            fatal(IllegalState::Invariant("sweepers active after sweeping finished"));
        }
        let results = std::mem::take(&mut *self.sweep_results.lock());
        for kind in RegionKind::ALL {
            heap.regions[kind].merge_swept(results.freed[kind], &results.holes[kind]);
        }
        if !heap
            .phase
            .try_transition(ConcurrentPhase::SweepDone, ConcurrentPhase::BeforeFinish)
        {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "merging sweep results",
            });
        }
    }

    fn finish_cycle(&self, heap: &Heap) {
        let (markers, sweepers) = (self.active_markers(), self.active_sweepers());
        if markers != 0 || sweepers != 0 {
            fatal(IllegalState::Invariant("workers active while finishing a cycle"));
        }
        heap.graph.end_concurrent_cycle(&*heap.metadata);
        let snapshot = heap.cycle_stats.snapshot();
        heap.cycle_stats.reset_if_drained(markers, sweepers);
        if let Some(cycle) = self.cycle.lock().take() {
            heap.finish_concurrent_cycle(&cycle, snapshot);
        }
        if !heap
            .phase
            .try_transition(ConcurrentPhase::BeforeFinish, ConcurrentPhase::Resetting)
        {
            fatal(IllegalState::UnexpectedPhase {
                observed: heap.phase.current(),
                expected: "finishing a cycle",
            });
        }
    }

    /// Brings the cycle in flight to Idle on the calling thread.
    pub(crate) fn complete(&self, heap: &Heap, cause: GcCause) -> CompletionPath {
        let entry = heap.phase.current();
        let path = CompletionPath::for_phase(entry).unwrap_or(CompletionPath::StopTheWorld);
        let started = Instant::now();
        let number = self
            .cycle
            .lock()
            .as_ref()
            .map(|cycle| cycle.number)
            .unwrap_or_else(|| heap.collection_count());

        self.completion_in_progress.store(true, Ordering::Release);
        let scheduling = heap.scheduling_lock.lock();
        let backoff = Backoff::new();
        loop {
            if heap.phase.current() == ConcurrentPhase::Idle {
                break;
            }
            if self.drive_step(heap, true) {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        self.completion_in_progress.store(false, Ordering::Release);
        drop(scheduling);

        let duration = started.elapsed();
        heap.record_pause(PauseRecord {
            cycle: number,
            cause,
            kind: PauseKind::Completion(path),
            duration,
        });
        logln_if!(
            heap.config.verbose,
            "[gc] GC({}) Pause Complete ({:?}) {:?} entered at {:?} {:.4}ms",
            number,
            cause,
            path,
            entry,
            millis(duration)
        );
        path
    }
}
