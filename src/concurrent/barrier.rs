//! Write-barrier buffers owned by mutators.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::space::RegionKind;

#[derive(Default)]
pub(crate) struct LocalBuffers {
    /// Old objects that may now point into the young region.
    pub(crate) remembered: Vec<ObjectRef>,
    /// Objects modified while markers run.
    pub(crate) dirty: Vec<ObjectRef>,
}

/// Per-mutator buffer returned by [`Heap::attach_mutator`]. The mutator calls
/// [`MutatorBuffer::record_write`] after storing a reference into an object.
pub struct MutatorBuffer {
    heap: Arc<Heap>,
    local: Arc<Mutex<LocalBuffers>>,
    batch_size: usize,
}

impl MutatorBuffer {
    pub(crate) fn new(heap: Arc<Heap>, local: Arc<Mutex<LocalBuffers>>) -> Self {
        let batch_size = heap.config().tuning.barrier_batch_size;
        Self {
            heap,
            local,
            batch_size,
        }
    }

    pub fn record_write(&self, source: ObjectRef) {
        let heap = &*self.heap;
        let remember = heap.maintains_remembered_set()
            && heap.graph().region_of(source) != Some(RegionKind::Young);
        let dirty = heap.current_phase().is_marking();
        if !remember && !dirty {
            return;
        }

        let mut local = self.local.lock();
        if remember {
            local.remembered.push(source);
            if local.remembered.len() >= self.batch_size {
                let block = std::mem::take(&mut local.remembered);
                heap.push_remembered(block);
            }
        }
        if dirty {
            local.dirty.push(source);
            if local.dirty.len() >= self.batch_size {
                let batch = std::mem::take(&mut local.dirty);
                if let Some(collector) = heap.concurrent() {
                    collector.submit_dirty(batch);
                }
            }
        }
    }

    /// Hands every buffered entry to the collector.
    pub fn flush(&self) {
        let mut local = self.local.lock();
        let block = std::mem::take(&mut local.remembered);
        let batch = std::mem::take(&mut local.dirty);
        drop(local);
        if !block.is_empty() {
            self.heap.push_remembered(block);
        }
        if !batch.is_empty() {
            if let Some(collector) = self.heap.concurrent() {
                collector.submit_dirty(batch);
            }
        }
    }
}

impl Drop for MutatorBuffer {
    fn drop(&mut self) {
        self.flush();
    }
}
