use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use atomic::Atomic;
use parking_lot::Mutex;

use crate::collector::{CollectionKind, CompletionPath, GcCause};
use crate::phase::ConcurrentPhase;
use crate::space::{PerRegion, RegionKind};
use crate::util::{formatted_size, millis};

/// Counters of the running concurrent cycle. Workers add to them, the driver
/// resets them once every worker has drained.
#[derive(Default)]
pub struct ConcurrentCycleStatistics {
    live_bytes_marked: AtomicUsize,
    alloc_before_live_tracking: AtomicUsize,
    trace_rate: Atomic<f64>,
    alloc_rate: Atomic<f64>,
    utilization: Atomic<f64>,
    dirty: AtomicBool,
    last_cycle: Mutex<Option<CycleSnapshot>>,
}

/// Values of [`ConcurrentCycleStatistics`] at the end of a cycle.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct CycleSnapshot {
    pub live_bytes_marked: usize,
    pub alloc_before_live_tracking: usize,
    pub trace_rate: f64,
    pub alloc_rate: f64,
    pub utilization: f64,
}

impl ConcurrentCycleStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_marked(&self, bytes: usize) {
        self.live_bytes_marked.fetch_add(bytes, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    /// Bytes mutators allocated before markers started counting live bytes.
    pub fn set_alloc_before_tracking(&self, bytes: usize) {
        self.alloc_before_live_tracking
            .store(bytes, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn record_rates(&self, trace_rate: f64, alloc_rate: f64, utilization: f64) {
        self.trace_rate.store(trace_rate, Ordering::Relaxed);
        self.alloc_rate.store(alloc_rate, Ordering::Relaxed);
        self.utilization.store(utilization, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            live_bytes_marked: self.live_bytes_marked.load(Ordering::Relaxed),
            alloc_before_live_tracking: self.alloc_before_live_tracking.load(Ordering::Relaxed),
            trace_rate: self.trace_rate.load(Ordering::Relaxed),
            alloc_rate: self.alloc_rate.load(Ordering::Relaxed),
            utilization: self.utilization.load(Ordering::Relaxed),
        }
    }

    pub fn last_cycle(&self) -> Option<CycleSnapshot> {
        *self.last_cycle.lock()
    }

    /// Clears the counters once no marker and no sweeper is active. Resetting an
    /// already reset set of counters does nothing. Returns `true` if this call reset.
    pub fn reset_if_drained(&self, active_markers: usize, active_sweepers: usize) -> bool {
        if active_markers != 0 || active_sweepers != 0 {
            return false;
        }
        let mut last = self.last_cycle.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        *last = Some(self.snapshot());
        self.live_bytes_marked.store(0, Ordering::Relaxed);
        self.alloc_before_live_tracking.store(0, Ordering::Relaxed);
        self.trace_rate.store(0.0, Ordering::Relaxed);
        self.alloc_rate.store(0.0, Ordering::Relaxed);
        self.utilization.store(0.0, Ordering::Relaxed);
        true
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PauseKind {
    Collection(CollectionKind),
    /// A concurrent cycle brought to its end by the orchestrator.
    Completion(CompletionPath),
    /// Root enumeration that starts a concurrent cycle.
    ConcurrentStart,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PauseRecord {
    pub cycle: usize,
    pub cause: GcCause,
    pub kind: PauseKind,
    pub duration: Duration,
}

/// Bounded log of the most recent pauses.
pub struct PauseLog {
    records: Mutex<VecDeque<PauseRecord>>,
    capacity: usize,
}

impl PauseLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: PauseRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn records(&self) -> Vec<PauseRecord> {
        self.records.lock().iter().copied().collect()
    }
}

/// Snapshot returned by [`crate::heap::Heap::statistics`].
#[derive(Clone, Debug)]
pub struct HeapStatistics {
    pub committed: PerRegion<usize>,
    pub used: PerRegion<usize>,
    pub survive_ratio: PerRegion<f64>,
    pub allocated_total: usize,
    pub heap_limit: usize,
    pub total_gc_cycles_count: usize,
    pub minor_collections: usize,
    pub major_collections: usize,
    pub concurrent_cycles: usize,
    pub last_collection: Option<CollectionKind>,
    pub phase: ConcurrentPhase,
    pub total_pause: Duration,
    pub last_concurrent_cycle: Option<CycleSnapshot>,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        for kind in RegionKind::ALL {
            writeln!(
                f,
                "  {} region: {} of {} (survive ratio {:.2})",
                kind.name(),
                formatted_size(self.used[kind]),
                formatted_size(self.committed[kind]),
                self.survive_ratio[kind]
            )?;
        }
        writeln!(
            f,
            "  Current memory usage: {} of {} (limit {})",
            formatted_size(self.used.total()),
            formatted_size(self.committed.total()),
            formatted_size(self.heap_limit)
        )?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.allocated_total)
        )?;
        writeln!(
            f,
            "  Total GC cycles count: {} ({} minor, {} major, {} concurrent)",
            self.total_gc_cycles_count,
            self.minor_collections,
            self.major_collections,
            self.concurrent_cycles
        )?;
        writeln!(f, "  Last collection: {:?}", self.last_collection)?;
        writeln!(f, "  Concurrent phase: {:?}", self.phase)?;
        writeln!(f, "  Total pause time: {:.4}ms", millis(self.total_pause))?;
        if let Some(cycle) = self.last_concurrent_cycle {
            writeln!(
                f,
                "  Last concurrent cycle: {} marked live, {} allocated before tracking",
                formatted_size(cycle.live_bytes_marked),
                formatted_size(cycle.alloc_before_live_tracking)
            )?;
        }
        Ok(())
    }
}
