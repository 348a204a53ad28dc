use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::collector::{CollectionKind, CompletionPath, GcCause};
use crate::config::{AlgorithmKind, ConcurrentVariant, Config};
use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::phase::ConcurrentPhase;
use crate::space::RegionKind;
use crate::statistics::{ConcurrentCycleStatistics, PauseKind};

use super::support::{fixture, small_config, wait_for, Fixture, MockGraph};

const KB: usize = 1024;
const PATIENCE: Duration = Duration::from_secs(10);

fn concurrent_config(variant: ConcurrentVariant) -> Config {
    Config {
        algorithm: AlgorithmKind::MarkSweep,
        generational: false,
        concurrent: Some(variant),
        ..small_config()
    }
}

fn wait_for_cycles(f: &Fixture, cycles: usize) {
    assert!(
        wait_for(PATIENCE, || {
            f.heap.collection_count() == cycles && f.heap.current_phase() == ConcurrentPhase::Idle
        }),
        "cycle did not finish, phase {:?}",
        f.heap.current_phase()
    );
}

/// Root -> two objects, plus unreachable garbage. Returns the live objects.
fn populate(f: &Fixture, garbage: usize) -> Vec<ObjectRef> {
    let leaf = f.alloc(8 * KB, Vec::new());
    let middle = f.alloc(8 * KB, vec![leaf]);
    let root = f.alloc(8 * KB, vec![middle]);
    f.runtime.add_root(root);
    for _ in 0..garbage {
        f.alloc(8 * KB, Vec::new());
    }
    vec![root, middle, leaf]
}

/// Releases `gate` once the orchestrator has taken over the cycle.
fn release_on_completion(f: &Fixture, gate: fn(&MockGraph) -> &AtomicBool) -> JoinHandle<bool> {
    let heap = f.heap.clone();
    let graph = f.graph.clone();
    thread::spawn(move || {
        let taken_over = wait_for(PATIENCE, || heap.completion_in_progress());
        gate(&graph).store(false, Ordering::Release);
        taken_over
    })
}

fn has_pause(f: &Fixture, kind: PauseKind) -> bool {
    f.heap.pauses().iter().any(|pause| pause.kind == kind)
}

#[test]
pub fn test_background_cycle_reclaims_garbage() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    let live = populate(&f, 10);
    assert_eq!(f.used()[RegionKind::Mature], 104 * KB);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    wait_for_cycles(&f, 1);

    assert_eq!(f.graph.len(), 3);
    assert!(live.iter().all(|&object| f.graph.contains(object)));
    assert_eq!(f.used()[RegionKind::Mature], 24 * KB);
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 0);

    let statistics = f.heap.statistics();
    assert_eq!(statistics.concurrent_cycles, 1);
    assert_eq!(statistics.last_collection, Some(CollectionKind::Major));
    assert_eq!(
        statistics.last_concurrent_cycle.map(|cycle| cycle.live_bytes_marked),
        Some(24 * KB)
    );
    assert!(has_pause(&f, PauseKind::ConcurrentStart));

    let cell = f.heap.phase_cell();
    for (from, to) in [
        (ConcurrentPhase::Idle, ConcurrentPhase::StopTheWorldEnumerate),
        (ConcurrentPhase::Tracing, ConcurrentPhase::TraceDone),
        (ConcurrentPhase::Sweeping, ConcurrentPhase::SweepDone),
        (ConcurrentPhase::BeforeFinish, ConcurrentPhase::Resetting),
        (ConcurrentPhase::Resetting, ConcurrentPhase::Idle),
    ] {
        assert_eq!(cell.transition_count(from, to), 1);
    }
    let collector = f.heap.concurrent().unwrap();
    assert_eq!(collector.active_markers(), 0);
    assert_eq!(collector.active_sweepers(), 0);
}

#[test]
pub fn test_mark_only_cycle_sweeps_in_a_pause() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkOnly));
    populate(&f, 6);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    wait_for_cycles(&f, 1);

    assert_eq!(f.graph.len(), 3);
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 0);
    assert_eq!(f.used()[RegionKind::Mature], 24 * KB);
}

#[test]
pub fn test_occupancy_starts_a_cycle() {
    let mut config = concurrent_config(ConcurrentVariant::MarkAndSweep);
    config.tuning.concurrent_trigger_ratio = 0.25;
    let f = fixture(config);
    for _ in 0..31 {
        f.alloc(8 * KB, Vec::new());
    }
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 0);
    f.alloc(8 * KB, Vec::new());
    wait_for_cycles(&f, 1);
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.used()[RegionKind::Mature], f.graph.bytes_in(RegionKind::Mature));
}

/// The mature region runs out while markers are stuck. The allocating thread
/// finishes the marking, sweeps in a pause and retries.
#[test]
pub fn test_exhaustion_while_tracing_finishes_marking() {
    let mut config = concurrent_config(ConcurrentVariant::MarkAndSweep);
    config.tuning.concurrent_trigger_ratio = 0.5;
    let f = fixture(config);
    f.graph.hold_marking.store(true, Ordering::Release);

    let mut allocated = 0;
    while f.heap.current_phase() == ConcurrentPhase::Idle {
        f.alloc(8 * KB, Vec::new());
        allocated += 1;
    }
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Tracing);
    let releaser = release_on_completion(&f, |graph| &graph.hold_marking);

    // 768K of mature capacity, 8K each
    for _ in allocated..97 {
        f.alloc(8 * KB, Vec::new());
    }
    assert!(releaser.join().unwrap());

    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Idle);
    assert!(has_pause(&f, PauseKind::Completion(CompletionPath::FinishMarking)));
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 0);
    assert_eq!(f.heap.collection_count(), 1);
    assert!(f.graph.len() < 97);
    assert_eq!(f.used()[RegionKind::Mature], f.graph.bytes_in(RegionKind::Mature));
    assert!(!f.heap.completion_in_progress());
}

#[test]
pub fn test_exhaustion_while_sweeping_finishes_sweeping() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    populate(&f, 10);
    f.graph.hold_sweeping.store(true, Ordering::Release);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert!(wait_for(PATIENCE, || f.heap.current_phase() == ConcurrentPhase::Sweeping));
    let releaser = release_on_completion(&f, |graph| &graph.hold_sweeping);

    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert!(releaser.join().unwrap());

    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Idle);
    assert!(has_pause(&f, PauseKind::Completion(CompletionPath::FinishSweeping)));
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 0);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.len(), 3);
    assert_eq!(f.used()[RegionKind::Mature], 24 * KB);
    assert_eq!(f.heap.collection_count(), 1);
}

/// The driver is still retracing a resurrected object when the heap runs out.
/// The orchestrator enters before sweeping and sweeps in its own pause.
#[test]
pub fn test_exhaustion_before_sweep_sweeps_now() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    populate(&f, 4);
    let doomed = f.alloc(8 * KB, Vec::new());
    assert!(f.heap.register_finalizer(doomed));
    f.graph.hold_retrace.store(true, Ordering::Release);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert!(wait_for(PATIENCE, || f.heap.current_phase() == ConcurrentPhase::BeforeSweep));
    let releaser = release_on_completion(&f, |graph| &graph.hold_retrace);

    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert!(releaser.join().unwrap());

    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Idle);
    assert!(has_pause(&f, PauseKind::Completion(CompletionPath::SweepNow)));
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 0);
    assert_eq!(f.heap.collection_count(), 1);
    assert_eq!(f.graph.len(), 4);
    assert!(f.graph.contains(doomed));
    assert_eq!(f.used()[RegionKind::Mature], 32 * KB);
    assert_eq!(f.heap.take_finalizable(), vec![doomed]);
    assert!(!f.heap.completion_in_progress());
}

/// The sweep results are merged but the cycle has not been wrapped up yet.
#[test]
pub fn test_exhaustion_while_finishing_resets() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    populate(&f, 6);
    f.graph.hold_cycle_end.store(true, Ordering::Release);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert!(wait_for(PATIENCE, || f.heap.current_phase() == ConcurrentPhase::BeforeFinish));
    let releaser = release_on_completion(&f, |graph| &graph.hold_cycle_end);

    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert!(releaser.join().unwrap());

    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Idle);
    assert!(has_pause(&f, PauseKind::Completion(CompletionPath::FinishReset)));
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 0);
    assert_eq!(f.graph.concurrent_sweep_starts.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.cycle_ends.load(Ordering::Acquire), 1);
    assert_eq!(f.heap.collection_count(), 1);
    assert_eq!(f.graph.len(), 3);
    assert_eq!(f.used()[RegionKind::Mature], 24 * KB);
}

#[test]
pub fn test_idle_collection_passes_through_the_phase_machine() {
    let f = fixture(Config {
        concurrent: Some(ConcurrentVariant::MarkAndSweep),
        ..small_config()
    });
    f.alloc_root(8 * KB);
    f.heap.reclaim_heap(GcCause::ExplicitRequest);

    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Idle);
    let cell = f.heap.phase_cell();
    assert_eq!(
        cell.transition_count(ConcurrentPhase::StopTheWorldEnumerate, ConcurrentPhase::Resetting),
        1
    );
    assert_eq!(
        cell.transition_count(ConcurrentPhase::StopTheWorldEnumerate, ConcurrentPhase::MarkersStarting),
        0
    );
    assert!(has_pause(&f, PauseKind::Collection(CollectionKind::Major)));
}

#[test]
pub fn test_write_barrier_feeds_markers() {
    let mut config = concurrent_config(ConcurrentVariant::MarkAndSweep);
    config.tuning.barrier_batch_size = 2;
    let f = fixture(config);
    let live = populate(&f, 0);
    let unreferenced = f.alloc(8 * KB, Vec::new());
    f.graph.hold_marking.store(true, Ordering::Release);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Tracing);
    let mutator = f.heap.attach_mutator();
    f.graph.set_refs(live[2], vec![unreferenced]);
    for &object in &live {
        mutator.record_write(object);
    }
    f.graph.hold_marking.store(false, Ordering::Release);
    wait_for_cycles(&f, 1);

    assert_eq!(f.graph.dirty_processed.load(Ordering::Acquire), 3);
    assert!(f.graph.contains(unreferenced));
    assert_eq!(f.graph.len(), 4);
    drop(mutator);

    // outside of a cycle the barrier records nothing for a non-generational heap
    let mutator = f.heap.attach_mutator();
    mutator.record_write(live[0]);
    mutator.flush();
    assert_eq!(f.graph.dirty_processed.load(Ordering::Acquire), 3);
}

#[test]
pub fn test_disabled_concurrency_collects_stop_the_world() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    populate(&f, 4);
    f.heap.disable_concurrent();
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Disabled);

    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert_eq!(f.heap.collection_count(), 0);
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 0);

    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert_eq!(f.heap.collection_count(), 1);
    assert_eq!(f.graph.stw_sweeps.load(Ordering::Acquire), 1);
    assert_eq!(f.graph.len(), 3);

    assert!(f.heap.enable_concurrent());
    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    wait_for_cycles(&f, 2);
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 1);

    f.heap.shutdown();
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Disabled);
    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert_eq!(f.heap.collection_count(), 3);
}

/// Runs `action` on another thread and returns a flag raised once it returns.
fn in_background(f: &Fixture, action: fn(&Heap)) -> Arc<AtomicBool> {
    let done = Arc::new(AtomicBool::new(false));
    let heap = f.heap.clone();
    let flag = done.clone();
    thread::spawn(move || {
        action(&*heap);
        flag.store(true, Ordering::Release);
    });
    done
}

#[test]
pub fn test_disable_and_shutdown_wait_for_the_cycle_in_flight() {
    let f = fixture(concurrent_config(ConcurrentVariant::MarkAndSweep));
    populate(&f, 4);
    f.graph.hold_marking.store(true, Ordering::Release);
    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Tracing);

    let disabled = in_background(&f, Heap::disable_concurrent);
    thread::sleep(Duration::from_millis(20));
    assert!(!disabled.load(Ordering::Acquire));
    f.graph.hold_marking.store(false, Ordering::Release);
    assert!(wait_for(PATIENCE, || disabled.load(Ordering::Acquire)));
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Disabled);
    assert_eq!(f.heap.collection_count(), 1);
    assert_eq!(f.graph.len(), 3);

    assert!(f.heap.enable_concurrent());
    f.alloc(8 * KB, Vec::new());
    f.graph.hold_marking.store(true, Ordering::Release);
    f.heap.reclaim_heap(GcCause::ConcurrentTrigger);
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Tracing);

    let stopped = in_background(&f, Heap::shutdown);
    f.graph.hold_marking.store(false, Ordering::Release);
    assert!(wait_for(PATIENCE, || stopped.load(Ordering::Acquire)));
    assert_eq!(f.heap.current_phase(), ConcurrentPhase::Disabled);
    assert_eq!(f.heap.collection_count(), 2);
    assert_eq!(f.graph.len(), 3);

    f.heap.reclaim_heap(GcCause::ExplicitRequest);
    assert_eq!(f.heap.collection_count(), 3);
    assert_eq!(f.graph.concurrent_mark_starts.load(Ordering::Acquire), 2);
}

#[test]
pub fn test_cycle_statistics_reset_once() {
    let statistics = ConcurrentCycleStatistics::new();
    assert!(!statistics.reset_if_drained(0, 0));
    assert_eq!(statistics.last_cycle(), None);

    statistics.add_marked(4096);
    statistics.set_alloc_before_tracking(1024);
    statistics.record_rates(10.0, 5.0, 0.5);
    assert!(!statistics.reset_if_drained(1, 0));
    assert!(!statistics.reset_if_drained(0, 2));
    assert_eq!(statistics.snapshot().live_bytes_marked, 4096);

    assert!(statistics.reset_if_drained(0, 0));
    assert!(!statistics.reset_if_drained(0, 0));
    let last = statistics.last_cycle().unwrap();
    assert_eq!(last.live_bytes_marked, 4096);
    assert_eq!(last.alloc_before_live_tracking, 1024);
    assert_eq!(last.utilization, 0.5);
    assert_eq!(statistics.snapshot().live_bytes_marked, 0);
    assert_eq!(statistics.snapshot().trace_rate, 0.0);
}
