use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::heap::Heap;

/// Work handed to a background thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerTask {
    Mark,
    Sweep,
    Shutdown,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerRole {
    Marker,
    Sweeper,
}

impl WorkerRole {
    fn name(self) -> &'static str {
        match self {
            Self::Marker => "marker",
            Self::Sweeper => "sweeper",
        }
    }
}

/// Decides when a group of markers is done: every marker ran out of work at
/// the same time.
pub struct Terminator {
    const_nworkers: AtomicUsize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: AtomicUsize::new(number_workers),
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    /// Arms the terminator for a new cycle with `number_workers` participants.
    pub fn reset(&self, number_workers: usize) {
        self.const_nworkers.store(number_workers, Ordering::Relaxed);
        self.nworkers.store(number_workers, Ordering::Release);
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers.load(Ordering::Relaxed) == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // another worker still has work, keep going
                Ok(_) => return false,
                Err(prev_nworkers) => nworkers = prev_nworkers,
            }
        }
    }
}

/// Starts a background thread serving `tasks` until shutdown or until the heap is gone.
pub(crate) fn spawn(
    role: WorkerRole,
    index: usize,
    heap: Weak<Heap>,
    tasks: Receiver<WorkerTask>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("gc-{}-{}", role.name(), index))
        .spawn(move || {
            log::trace!("[gc] {} {} started", role.name(), index);
            while let Ok(task) = tasks.recv() {
                let heap = match heap.upgrade() {
                    Some(heap) => heap,
                    None => break,
                };
                let collector = match heap.concurrent() {
                    Some(collector) => collector,
                    None => break,
                };
                match task {
                    WorkerTask::Mark => collector.run_marker(&heap),
                    WorkerTask::Sweep => collector.run_sweeper(&heap),
                    WorkerTask::Shutdown => break,
                }
            }
            log::trace!("[gc] {} {} stopped", role.name(), index);
        })
}
