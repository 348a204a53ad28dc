//! Phase of the concurrent collection cycle.
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;

/// Position of the heap in the concurrent collection cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum ConcurrentPhase {
    Idle,
    StopTheWorldEnumerate,
    MarkersStarting,
    Tracing,
    TraceDone,
    BeforeSweep,
    Sweeping,
    SweepDone,
    BeforeFinish,
    Resetting,
    /// Concurrent collection is switched off.
    Disabled,
}

const NUM_PHASES: usize = 11;

impl ConcurrentPhase {
    pub const ALL: [ConcurrentPhase; NUM_PHASES] = [
        Self::Idle,
        Self::StopTheWorldEnumerate,
        Self::MarkersStarting,
        Self::Tracing,
        Self::TraceDone,
        Self::BeforeSweep,
        Self::Sweeping,
        Self::SweepDone,
        Self::BeforeFinish,
        Self::Resetting,
        Self::Disabled,
    ];

    /// `true` while markers may be running.
    pub fn is_marking(self) -> bool {
        matches!(
            self,
            Self::StopTheWorldEnumerate | Self::MarkersStarting | Self::Tracing | Self::TraceDone
        )
    }

    /// `true` when a concurrent cycle is in flight.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Disabled)
    }
}

/// Whether `from -> to` is a declared edge of the phase machine.
pub fn is_legal_edge(from: ConcurrentPhase, to: ConcurrentPhase) -> bool {
    use ConcurrentPhase::*;
    matches!(
        (from, to),
        (Idle, StopTheWorldEnumerate)
            | (StopTheWorldEnumerate, MarkersStarting)
            | (MarkersStarting, Tracing)
            | (Tracing, TraceDone)
            | (TraceDone, BeforeSweep)
            | (BeforeSweep, Sweeping)
            | (Sweeping, SweepDone)
            | (SweepDone, BeforeFinish)
            | (BeforeFinish, Resetting)
            | (Resetting, Idle)
            | (StopTheWorldEnumerate, Resetting)
            | (Idle, Disabled)
            | (Disabled, Idle)
    )
}

/// The heap's single concurrent phase.
///
/// Only [`PhaseCell::try_transition`] writes it: one compare-and-swap per edge,
/// so of several agents racing for the same edge exactly one wins.
pub struct PhaseCell {
    phase: Atomic<ConcurrentPhase>,
    transitions: [[AtomicUsize; NUM_PHASES]; NUM_PHASES],
}

impl PhaseCell {
    pub fn new() -> Self {
        Self {
            phase: Atomic::new(ConcurrentPhase::Idle),
            transitions: Default::default(),
        }
    }

    #[inline]
    pub fn current(&self) -> ConcurrentPhase {
        self.phase.load(Ordering::Acquire)
    }

    /// Moves `from -> to`. Returns `false` if another agent got there first or
    /// the edge is not part of the phase machine.
    pub fn try_transition(&self, from: ConcurrentPhase, to: ConcurrentPhase) -> bool {
        if !is_legal_edge(from, to) {
            log::warn!("[gc] refused illegal phase edge {:?} -> {:?}", from, to);
            return false;
        }
        match self
            .phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.transitions[from as usize][to as usize].fetch_add(1, Ordering::Relaxed);
                log::trace!("[gc] phase {:?} -> {:?}", from, to);
                true
            }
            Err(_) => false,
        }
    }

    /// How many times `from -> to` was taken.
    pub fn transition_count(&self, from: ConcurrentPhase, to: ConcurrentPhase) -> usize {
        self.transitions[from as usize][to as usize].load(Ordering::Relaxed)
    }

    /// Every edge taken so far with its count.
    pub fn taken_edges(&self) -> Vec<(ConcurrentPhase, ConcurrentPhase, usize)> {
        let mut edges = Vec::new();
        for from in ConcurrentPhase::ALL {
            for to in ConcurrentPhase::ALL {
                let count = self.transition_count(from, to);
                if count != 0 {
                    edges.push((from, to, count));
                }
            }
        }
        edges
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}
