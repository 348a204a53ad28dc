use thiserror::Error;

use crate::{config::AlgorithmKind, phase::ConcurrentPhase, space::RegionKind};

/// Rejected start-up configuration. Fatal: no heap is created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("heap sizes must satisfy min <= initial <= max (min: {min}, initial: {initial}, max: {max})")]
    InvalidHeapSize {
        min: usize,
        initial: usize,
        max: usize,
    },
    #[error("block size {0} is not a power of two")]
    InvalidBlockSize(usize),
    #[error("young region size must satisfy min <= size <= max and hold one block (min: {min}, size: {size}, max: {max})")]
    InvalidYoungSize { min: usize, size: usize, max: usize },
    #[error("{0} region minimum is larger than its initial size")]
    InvalidRegionMinimum(&'static str),
    #[error("initial heap of {initial} bytes cannot hold the {required} bytes the regions need")]
    HeapTooSmall { required: usize, initial: usize },
    #[error("{algorithm:?} does not support {feature}")]
    UnsupportedCombination {
        algorithm: AlgorithmKind,
        feature: &'static str,
    },
    #[error("concurrent collection needs at least one {0} thread")]
    NoWorkers(&'static str),
    #[error("tuning value {name} = {value} is out of range")]
    InvalidKnob { name: &'static str, value: f64 },
    #[error("failed to reserve {0} bytes of address space")]
    ReservationFailed(usize),
}

/// Memory is still unavailable after a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("out of memory: {requested} bytes requested from the {region:?} region")]
    OutOfMemory { region: RegionKind, requested: usize },
}

/// A minor collection that cannot finish. Never leaves the collector: the cycle is
/// escalated to a full compacting collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectionFailure {
    #[error("resurrection needs slots that were already discarded")]
    ResurrectionFallback,
    #[error("promotion of {0} bytes failed, mature region is full")]
    PromotionFailed(usize),
}

/// The heap is in a state no agent should ever observe. Unrecoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IllegalState {
    #[error("observed phase {observed:?} while {expected}")]
    UnexpectedPhase {
        observed: ConcurrentPhase,
        expected: &'static str,
    },
    #[error("resurrection fallback during a {0} collection")]
    FallbackOutsideMinor(&'static str),
    #[error("{0}")]
    Invariant(&'static str),
}

/// Logs `error` with a backtrace and aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(error: IllegalState) -> ! {
    let backtrace = backtrace::Backtrace::new();
    log::error!("[gc] fatal: {}\n{:?}", error, backtrace);
    eprintln!("[gc] fatal: {}", error);
    std::process::abort();
}
