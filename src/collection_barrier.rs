use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Admits one collection at a time. Threads that request a collection while one
/// is running wait for it and do not start another.
pub struct CollectionBarrier {
    mutex: Mutex<()>,
    cv_wakeup: Condvar,
    collection_requested: AtomicBool,
    /// Number of collections finished so far.
    epoch: AtomicUsize,
    waiters: AtomicUsize,
}

/// Outcome of [`CollectionBarrier::request_gc`].
pub enum Admission<'a> {
    /// The caller runs the collection. Dropping the ticket lets waiters go.
    Collect(CollectionTicket<'a>),
    /// Another thread ran a collection while the caller waited.
    Joined,
}

pub struct CollectionTicket<'a> {
    barrier: &'a CollectionBarrier,
}

impl Drop for CollectionTicket<'_> {
    fn drop(&mut self) {
        self.barrier.resume_threads_awaiting_collection();
    }
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv_wakeup: Condvar::new(),
            collection_requested: AtomicBool::new(false),
            epoch: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn was_gc_requested(&self) -> bool {
        self.collection_requested.load(Ordering::Relaxed)
    }

    /// Threads blocked behind the running collection.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// `observed_epoch` is the epoch the caller saw when it decided to collect.
    /// If a collection finished since then, the caller joins it.
    pub fn request_gc(&self, observed_epoch: usize) -> Admission<'_> {
        let mut guard = self.mutex.lock();
        loop {
            if self.epoch() != observed_epoch {
                return Admission::Joined;
            }
            let was_already_requested = self.collection_requested.swap(true, Ordering::AcqRel);
            if !was_already_requested {
                return Admission::Collect(CollectionTicket { barrier: self });
            }
            self.waiters.fetch_add(1, Ordering::AcqRel);
            self.cv_wakeup.wait(&mut guard);
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn resume_threads_awaiting_collection(&self) {
        let guard = self.mutex.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.collection_requested.store(false, Ordering::Release);
        self.cv_wakeup.notify_all();
        drop(guard);
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
