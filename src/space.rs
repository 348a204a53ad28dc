//! Heap regions and their free-area buckets.
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum RegionKind {
    Young,
    Mature,
    LargeObject,
}

impl RegionKind {
    pub const ALL: [RegionKind; 3] = [Self::Young, Self::Mature, Self::LargeObject];

    #[inline(always)]
    pub const fn index(self) -> usize {
        match self {
            Self::Young => 0,
            Self::Mature => 1,
            Self::LargeObject => 2,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Young => "young",
            Self::Mature => "mature",
            Self::LargeObject => "large object",
        }
    }
}

/// One value per region.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PerRegion<T> {
    values: [T; 3],
}

impl<T> PerRegion<T> {
    pub const fn new(young: T, mature: T, large: T) -> Self {
        Self {
            values: [young, mature, large],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionKind, &T)> {
        RegionKind::ALL.iter().copied().zip(self.values.iter())
    }
}

impl<T: Copy + std::iter::Sum<T>> PerRegion<T> {
    pub fn total(&self) -> T {
        self.values.iter().copied().sum()
    }
}

impl<T> Index<RegionKind> for PerRegion<T> {
    type Output = T;
    fn index(&self, kind: RegionKind) -> &T {
        &self.values[kind.index()]
    }
}

impl<T> IndexMut<RegionKind> for PerRegion<T> {
    fn index_mut(&mut self, kind: RegionKind) -> &mut T {
        &mut self.values[kind.index()]
    }
}

const NUM_BUCKETS: usize = 16;

/// Free holes left behind by sweeping, bucketed by size class.
///
/// Bucket `i` holds holes of at least `min_hole << i` bytes. Each bucket has its
/// own lock so mutators allocating different sizes do not contend.
pub struct FreeAreaPool {
    min_hole: usize,
    buckets: Vec<Mutex<Vec<usize>>>,
    bytes: AtomicUsize,
}

impl FreeAreaPool {
    pub fn new(min_hole: usize) -> Self {
        Self {
            min_hole: min_hole.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            bytes: AtomicUsize::new(0),
        }
    }

    fn bucket_for(&self, size: usize) -> usize {
        let classes = size / self.min_hole;
        if classes == 0 {
            return 0;
        }
        ((usize::BITS - 1 - classes.leading_zeros()) as usize).min(NUM_BUCKETS - 1)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn add(&self, hole: usize) {
        if hole < self.min_hole {
            return;
        }
        self.buckets[self.bucket_for(hole)].lock().push(hole);
        self.bytes.fetch_add(hole, Ordering::AcqRel);
    }

    /// Takes `size` bytes out of the first hole that fits, returning the rest of the hole.
    pub fn take(&self, size: usize) -> bool {
        for index in self.bucket_for(size)..NUM_BUCKETS {
            let mut bucket = self.buckets[index].lock();
            if let Some(position) = bucket.iter().position(|&hole| hole >= size) {
                let hole = bucket.swap_remove(position);
                drop(bucket);
                self.bytes.fetch_sub(hole, Ordering::AcqRel);
                if hole > size {
                    self.add(hole - size);
                }
                return true;
            }
        }
        false
    }

    pub fn largest(&self) -> usize {
        self.buckets
            .iter()
            .rev()
            .find_map(|bucket| bucket.lock().iter().copied().max())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
        self.bytes.store(0, Ordering::Release);
    }
}

/// Result of the reclaim phase for one region.
#[derive(Clone, Debug, Default)]
pub struct RegionReclaim {
    pub live: usize,
    pub holes: Vec<usize>,
    pub compacted: bool,
}

/// Capacity account of one region.
///
/// Allocation bumps `frontier` inside the committed capacity, or reuses a hole
/// from the free-area pool. Only the free tail above the frontier can be given
/// away by a boundary move.
pub struct Region {
    kind: RegionKind,
    committed: AtomicUsize,
    minimum: usize,
    used: AtomicUsize,
    frontier: AtomicUsize,
    free_areas: FreeAreaPool,
    allocated_total: AtomicUsize,
    allocated_cycle: AtomicUsize,
    survive_ratio: Atomic<f64>,
    collections: AtomicUsize,
}

impl Region {
    pub fn new(kind: RegionKind, committed: usize, minimum: usize, min_hole: usize) -> Self {
        Self {
            kind,
            committed: AtomicUsize::new(committed),
            minimum,
            used: AtomicUsize::new(0),
            frontier: AtomicUsize::new(0),
            free_areas: FreeAreaPool::new(min_hole),
            allocated_total: AtomicUsize::new(0),
            allocated_cycle: AtomicUsize::new(0),
            survive_ratio: Atomic::new(0.0),
            collections: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }
    pub fn minimum(&self) -> usize {
        self.minimum
    }
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
    pub fn free(&self) -> usize {
        self.committed().saturating_sub(self.used())
    }
    /// Contiguous free capacity above the bump frontier.
    pub fn tail_free(&self) -> usize {
        self.committed()
            .saturating_sub(self.frontier.load(Ordering::Acquire))
    }
    pub fn free_areas(&self) -> &FreeAreaPool {
        &self.free_areas
    }
    pub fn allocated_total(&self) -> usize {
        self.allocated_total.load(Ordering::Relaxed)
    }
    pub fn allocated_this_cycle(&self) -> usize {
        self.allocated_cycle.load(Ordering::Relaxed)
    }
    pub fn survive_ratio(&self) -> f64 {
        self.survive_ratio.load(Ordering::Relaxed)
    }
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }
    pub fn occupancy(&self) -> f64 {
        let committed = self.committed();
        if committed == 0 {
            return 1.0;
        }
        self.used() as f64 / committed as f64
    }

    /// Accounts `size` bytes. Returns `false` when neither the tail nor a hole fits.
    pub fn allocate(&self, size: usize) -> bool {
        let committed = self.committed();
        let mut frontier = self.frontier.load(Ordering::Relaxed);
        loop {
            if frontier + size > committed {
                break;
            }
            match self.frontier.compare_exchange_weak(
                frontier,
                frontier + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.account(size);
                    return true;
                }
                Err(current) => frontier = current,
            }
        }
        if self.free_areas.take(size) {
            self.account(size);
            return true;
        }
        false
    }

    fn account(&self, size: usize) {
        self.used.fetch_add(size, Ordering::AcqRel);
        self.allocated_total.fetch_add(size, Ordering::Relaxed);
        self.allocated_cycle.fetch_add(size, Ordering::Relaxed);
    }

    /// Installs the outcome of a stop-the-world reclaim phase.
    pub(crate) fn install(&self, reclaim: &RegionReclaim) {
        self.used.store(reclaim.live, Ordering::Release);
        if reclaim.compacted {
            self.free_areas.clear();
            self.frontier.store(reclaim.live, Ordering::Release);
        } else {
            for &hole in &reclaim.holes {
                self.free_areas.add(hole);
            }
        }
    }

    /// Folds the result of a concurrent sweep. Mutators keep allocating meanwhile.
    pub(crate) fn merge_swept(&self, freed: usize, holes: &[usize]) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(freed))
            });
        for &hole in holes {
            self.free_areas.add(hole);
        }
    }

    pub(crate) fn record_collection(&self, survived: usize, used_before: usize) {
        let ratio = if used_before == 0 {
            0.0
        } else {
            (survived as f64 / used_before as f64).min(1.0)
        };
        self.survive_ratio.store(ratio, Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn begin_cycle(&self) -> usize {
        self.allocated_cycle.swap(0, Ordering::AcqRel)
    }

    /// Changes the committed capacity. Shrinking is limited to the free tail.
    pub(crate) fn resize(&self, committed: usize) {
        debug_assert!(committed >= self.frontier.load(Ordering::Acquire));
        self.committed.store(committed, Ordering::Release);
    }
}
