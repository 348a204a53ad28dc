use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runtime::MutatorRuntime;

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed.
pub struct GlobalSafepoint {
    runtime: Arc<dyn MutatorRuntime>,
    active_safepoint_scopes: AtomicI32,
    total_scopes: AtomicUsize,
}

impl GlobalSafepoint {
    pub fn new(runtime: Arc<dyn MutatorRuntime>) -> Self {
        Self {
            runtime,
            active_safepoint_scopes: AtomicI32::new(0),
            total_scopes: AtomicUsize::new(0),
        }
    }

    /// Suspends every mutator until the returned scope is dropped.
    pub fn stop_the_world(&self) -> StopTheWorld<'_> {
        let previous = self.active_safepoint_scopes.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "nested stop-the-world scope");
        self.runtime.suspend_mutators();
        self.total_scopes.fetch_add(1, Ordering::Relaxed);
        StopTheWorld {
            safepoint: self,
            started: Instant::now(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.active_safepoint_scopes.load(Ordering::Acquire) > 0
    }

    /// Number of stop-the-world scopes entered so far.
    pub fn total_scopes(&self) -> usize {
        self.total_scopes.load(Ordering::Relaxed)
    }
}

/// Proof that every mutator is suspended. Operations that need a quiescent heap
/// take a reference to it.
pub struct StopTheWorld<'a> {
    safepoint: &'a GlobalSafepoint,
    started: Instant,
}

impl StopTheWorld<'_> {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        self.safepoint.runtime.resume_mutators();
        self.safepoint
            .active_safepoint_scopes
            .fetch_sub(1, Ordering::AcqRel);
    }
}
