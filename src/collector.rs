//! Top-level collection decisions.
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::collection_barrier::Admission;
use crate::concurrent::CycleState;
use crate::error::{fatal, CollectionFailure, IllegalState};
use crate::finalization::{ResurrectionEngine, ResurrectionReport};
use crate::gen_mode::GenMode;
use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::phase::ConcurrentPhase;
use crate::runtime::{ReclaimSummary, ScopedLiveness, TraceMode, TraceRequest, TraceSummary};
use crate::safepoint::StopTheWorld;
use crate::space::{PerRegion, RegionKind};
use crate::statistics::{CycleSnapshot, PauseKind, PauseRecord};
use crate::tuner::{RegionView, TunerSample};
use crate::util::{formatted_size, millis};

/// Why a collection was requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum GcCause {
    YoungRegionFull,
    MatureRegionFull,
    LargeObjectRegionFull,
    ExplicitRequest,
    /// Old generation occupancy crossed the concurrent start threshold.
    ConcurrentTrigger,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum CollectionKind {
    /// Collects the young region only.
    Minor(GenMode),
    /// Collects every region.
    Major,
}

/// How the orchestrator brings a concurrent cycle in flight to its end.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum CompletionPath {
    /// No cycle in flight: a plain stop-the-world collection.
    StopTheWorld,
    /// Wait for the markers, then sweep stop-the-world.
    FinishMarking,
    /// Marking is over, sweep stop-the-world right away.
    SweepNow,
    /// Wait for the sweepers, then merge their results.
    FinishSweeping,
    /// Only the reset is left.
    FinishReset,
}

impl CompletionPath {
    /// Path for a cycle observed in `phase`. `None` when concurrent collection is off.
    pub fn for_phase(phase: ConcurrentPhase) -> Option<Self> {
        use ConcurrentPhase::*;
        Some(match phase {
            Idle => Self::StopTheWorld,
            StopTheWorldEnumerate | MarkersStarting | Tracing | TraceDone => Self::FinishMarking,
            BeforeSweep => Self::SweepNow,
            Sweeping | SweepDone => Self::FinishSweeping,
            BeforeFinish | Resetting => Self::FinishReset,
            Disabled => return None,
        })
    }
}

/// Result of the trace, resurrection and reclaim phases of one collection.
struct CycleOutcome {
    kind: CollectionKind,
    mode: TraceMode,
    trace: TraceSummary,
    reclaim: ReclaimSummary,
    resurrection: ResurrectionReport,
    escalated: bool,
}

impl Heap {
    /// Reclaims memory for `cause`. Returns once a collection, possibly run by
    /// another thread, has finished. A concurrent trigger only starts a cycle.
    pub fn reclaim_heap(&self, cause: GcCause) {
        let epoch = self.collection_barrier.epoch();
        self.reclaim_heap_observed(cause, epoch, 0);
    }

    /// `epoch` is the collection epoch the caller saw before deciding to
    /// collect, `requested` the size of the allocation that failed.
    pub(crate) fn reclaim_heap_observed(&self, cause: GcCause, epoch: usize, requested: usize) {
        let _ticket = match self.collection_barrier.request_gc(epoch) {
            Admission::Collect(ticket) => ticket,
            Admission::Joined => return,
        };

        let phase = self.phase.current();
        if let Some(collector) = self.concurrent() {
            if cause == GcCause::ConcurrentTrigger {
                if phase == ConcurrentPhase::Idle {
                    collector.start(self, cause);
                }
                return;
            }
            if phase.is_active() {
                collector.complete(self, cause);
                return;
            }
        } else if cause == GcCause::ConcurrentTrigger {
            return;
        }
        self.collect_stop_the_world(cause, requested);
    }

    fn choose_kind(&self, cause: GcCause) -> CollectionKind {
        let forced = self.force_major_request.swap(false, Ordering::AcqRel);
        if forced || self.config.force_major || !self.strategy.supports_minor() {
            return CollectionKind::Major;
        }
        if cause != GcCause::YoungRegionFull {
            return CollectionKind::Major;
        }
        let young = &self.regions[RegionKind::Young];
        let mature = &self.regions[RegionKind::Mature];
        let expected_ratio = if young.collections() == 0 {
            1.0
        } else {
            young.survive_ratio()
        };
        let expected_promotion = (young.used() as f64 * expected_ratio) as usize;
        if expected_promotion > mature.free() {
            log::debug!(
                "[gc] expected promotion of {} exceeds free mature space {}, collecting everything",
                formatted_size(expected_promotion),
                formatted_size(mature.free())
            );
            return CollectionKind::Major;
        }
        CollectionKind::Minor(self.adaptor.lock().mode_for(false))
    }

    fn collect_stop_the_world(&self, cause: GcCause, requested: usize) {
        // keeps concurrent cycles out while the world is stopped
        let through_phase = self.concurrent().is_some()
            && self
                .phase
                .try_transition(ConcurrentPhase::Idle, ConcurrentPhase::StopTheWorldEnumerate);

        let stw = self.safepoint.stop_the_world();
        let started = Instant::now();
        let number = self.collection_count();

        let mut kind = self.choose_kind(cause);
        // minor cycles leave the mature/large object boundary alone
        if kind == CollectionKind::Major {
            self.apply_pending_transfer(&stw);
            self.tuner.lock().begin_major_cycle();
        }
        let used_before = self.used_per_region();
        let mature_before = RegionView::of(&self.regions[RegionKind::Mature]);
        let large_before = RegionView::of(&self.regions[RegionKind::LargeObject]);

        self.metadata.begin_cycle();
        let roots = self.enumerate_roots();
        let remembered = if matches!(kind, CollectionKind::Minor(_)) {
            self.drain_remembered(&stw)
        } else {
            Vec::new()
        };

        let outcome = match self.run_cycle(kind, &roots, &remembered) {
            Ok(outcome) => outcome,
            Err(failure) => {
                if kind == CollectionKind::Major {
                    fatal(IllegalState::FallbackOutsideMinor("major"));
                }
                log::warn!(
                    "[gc] GC({}) minor collection failed: {}, escalating to a full collection",
                    number,
                    failure
                );
                kind = CollectionKind::Major;
                self.tuner.lock().begin_major_cycle();
                self.metadata.begin_cycle();
                self.run_escalation(&roots)
            }
        };

        self.install(&outcome, &used_before);
        let pause = started.elapsed();
        self.adapt(&outcome, &used_before, pause, &stw);

        let sample = TunerSample {
            cause,
            interval: self.last_cycle_end.lock().elapsed(),
            allocated_mature: self.regions[RegionKind::Mature].begin_cycle(),
            allocated_large: self.regions[RegionKind::LargeObject].begin_cycle(),
            mature_before,
            large_before,
            mature: RegionView::of(&self.regions[RegionKind::Mature]),
            large: RegionView::of(&self.regions[RegionKind::LargeObject]),
            requested,
        };
        self.regions[RegionKind::Young].begin_cycle();
        self.tuner.lock().observe(&sample);
        if kind == CollectionKind::Major {
            self.apply_pending_transfer(&stw);
            self.resize_heap(&stw);
        }

        self.record_collection(kind, false);
        self.mark_cycle_end();
        let duration = started.elapsed();
        self.record_pause(PauseRecord {
            cycle: number,
            cause,
            kind: PauseKind::Collection(kind),
            duration,
        });
        self.log_collection(number, cause, &outcome, &used_before, duration);

        if through_phase {
            self.phase
                .try_transition(ConcurrentPhase::StopTheWorldEnumerate, ConcurrentPhase::Resetting);
            self.phase
                .try_transition(ConcurrentPhase::Resetting, ConcurrentPhase::Idle);
        }
        drop(stw);
    }

    fn run_cycle(
        &self,
        kind: CollectionKind,
        roots: &[ObjectRef],
        remembered: &[ObjectRef],
    ) -> Result<CycleOutcome, CollectionFailure> {
        let request = self.strategy.trace_request(kind, roots, remembered);
        let mut trace = self.graph.trace(&request, &*self.metadata)?;
        let resurrection = self.resurrect(&request)?;
        trace.merge(&resurrection.resurrected);
        if trace.promoted != 0 && !self.regions[RegionKind::Mature].allocate(trace.promoted) {
            // the escalation resolves finalizers and references again
            self.finalization.lock().restore(&resurrection);
            return Err(CollectionFailure::PromotionFailed(trace.promoted));
        }
        let reclaim = self.strategy.reclaim(kind, &*self.graph, &*self.metadata);
        Ok(CycleOutcome {
            kind,
            mode: request.mode,
            trace,
            reclaim,
            resurrection,
            escalated: false,
        })
    }

    fn run_escalation(&self, roots: &[ObjectRef]) -> CycleOutcome {
        let request = self.strategy.escalation_request(roots);
        let mut trace = match self.graph.trace(&request, &*self.metadata) {
            Ok(trace) => trace,
            Err(_) => fatal(IllegalState::Invariant("full collection failed to trace")),
        };
        let resurrection = match self.resurrect(&request) {
            Ok(report) => report,
            Err(_) => fatal(IllegalState::FallbackOutsideMinor("full")),
        };
        trace.merge(&resurrection.resurrected);
        let reclaim = self
            .strategy
            .escalation_reclaim(&*self.graph, &*self.metadata);
        CycleOutcome {
            kind: CollectionKind::Major,
            mode: request.mode,
            trace,
            reclaim,
            resurrection,
            escalated: true,
        }
    }

    fn resurrect(&self, request: &TraceRequest<'_>) -> Result<ResurrectionReport, CollectionFailure> {
        let liveness = ScopedLiveness {
            metadata: &*self.metadata,
            graph: &*self.graph,
            scope: request.scope,
        };
        let mut pools = self.finalization.lock();
        ResurrectionEngine::resolve(&mut pools, &liveness, &mut |object| {
            self.graph.retrace(object, request, &*self.metadata)
        })
    }

    /// Installs reclaimed capacity and survive ratios for the collected regions.
    fn install(&self, outcome: &CycleOutcome, used_before: &PerRegion<usize>) {
        match outcome.kind {
            CollectionKind::Minor(_) => {
                let young = &self.regions[RegionKind::Young];
                let survived = outcome.trace.promoted
                    + outcome.reclaim.regions[RegionKind::Young].live;
                young.install(&outcome.reclaim.regions[RegionKind::Young]);
                young.record_collection(survived, used_before[RegionKind::Young]);
            }
            CollectionKind::Major => {
                for kind in RegionKind::ALL {
                    let region = &self.regions[kind];
                    region.install(&outcome.reclaim.regions[kind]);
                    region.record_collection(
                        outcome.reclaim.regions[kind].live,
                        used_before[kind],
                    );
                }
            }
        }
    }

    fn adapt(
        &self,
        outcome: &CycleOutcome,
        used_before: &PerRegion<usize>,
        pause: std::time::Duration,
        stw: &StopTheWorld<'_>,
    ) {
        match outcome.kind {
            CollectionKind::Minor(mode) => {
                let reclaimed = used_before[RegionKind::Young]
                    .saturating_sub(outcome.trace.promoted);
                self.adaptor.lock().record_minor(mode, reclaimed, pause);
                if matches!(outcome.mode, TraceMode::Evacuate { .. }) {
                    self.resize_nursery(stw);
                }
            }
            CollectionKind::Major => self.adaptor.lock().record_major(),
        }
    }

    fn log_collection(
        &self,
        number: usize,
        cause: GcCause,
        outcome: &CycleOutcome,
        used_before: &PerRegion<usize>,
        duration: std::time::Duration,
    ) {
        match outcome.kind {
            CollectionKind::Minor(mode) => logln_if!(
                self.config.verbose,
                "[gc] GC({}) Pause Young ({:?}, {:?}) Promoted {}(old space: {}) {:.4}ms",
                number,
                cause,
                mode,
                formatted_size(outcome.trace.promoted),
                formatted_size(
                    self.regions[RegionKind::Mature].used()
                        + self.regions[RegionKind::LargeObject].used()
                ),
                millis(duration)
            ),
            CollectionKind::Major => logln_if!(
                self.config.verbose,
                "[gc] GC({}) Pause Full ({:?}{}) {}->{}({}) finalizable {} cleared {} {:.4}ms",
                number,
                cause,
                if outcome.escalated { ", escalated" } else { "" },
                formatted_size(used_before.total()),
                formatted_size(self.used_per_region().total()),
                formatted_size(self.committed()),
                outcome.resurrection.finalizable,
                outcome.resurrection.cleared,
                millis(duration)
            ),
        }
    }

    /// End-of-cycle bookkeeping of a concurrent cycle. Runs on the driver
    /// between BeforeFinish and Resetting.
    pub(crate) fn finish_concurrent_cycle(&self, cycle: &CycleState, snapshot: CycleSnapshot) {
        for kind in [RegionKind::Mature, RegionKind::LargeObject] {
            let region = &self.regions[kind];
            region.record_collection(region.used(), cycle.used_before[kind]);
        }
        self.adaptor.lock().record_major();
        let elapsed = cycle.started.elapsed();
        let mature = &self.regions[RegionKind::Mature];
        let large = &self.regions[RegionKind::LargeObject];
        let sample = TunerSample {
            cause: cycle.cause,
            interval: self.last_cycle_end.lock().elapsed(),
            allocated_mature: mature.begin_cycle(),
            allocated_large: large.begin_cycle(),
            mature_before: RegionView::of(mature),
            large_before: RegionView::of(large),
            mature: RegionView::of(mature),
            large: RegionView::of(large),
            requested: 0,
        };
        self.tuner.lock().observe(&sample);
        self.record_collection(CollectionKind::Major, true);
        self.mark_cycle_end();
        logln_if!(
            self.config.verbose,
            "[gc] GC({}) Concurrent Cycle ({:?}) {}->{} marked {} {:.4}ms",
            cycle.number,
            cycle.cause,
            formatted_size(cycle.used_before.total()),
            formatted_size(self.used_per_region().total()),
            formatted_size(snapshot.live_bytes_marked),
            millis(elapsed)
        );
    }
}
