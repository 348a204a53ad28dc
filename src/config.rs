use crate::error::ConfigError;

/// Collection algorithm used by the heap. Chosen once at start-up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AlgorithmKind {
    /// Copies live objects out of the collected area. Minor cycles evacuate the nursery.
    SemispaceCopy,
    /// Non-moving mark & sweep over the whole heap. No nursery.
    MarkSweep,
    /// Mark followed by sliding compaction over the whole heap. No nursery.
    MoveCompact,
    /// Nursery evacuation for minor cycles, mark & compact for major cycles.
    Generational,
}

impl AlgorithmKind {
    pub fn has_young_region(self) -> bool {
        matches!(self, Self::SemispaceCopy | Self::Generational)
    }

    /// Concurrent marking needs a non-moving mature space.
    pub fn supports_concurrent(self) -> bool {
        matches!(self, Self::MarkSweep | Self::Generational)
    }
}

/// Flavour of the concurrent cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConcurrentVariant {
    /// Markers and sweepers both run in the background.
    MarkAndSweep,
    /// Markers run in the background, sweeping happens in a short pause.
    MarkOnly,
}

/// Feedback-loop knobs. None of these values are load-bearing, they are workload tuned.
#[derive(Clone, Debug)]
pub struct Tuning {
    /// Allow the mode adaptor to switch between generational and non-generational minor cycles.
    pub mode_adaptation: bool,
    /// Weight of the newest throughput sample.
    pub throughput_smoothing: f64,
    /// Relative throughput gap the active mode must trail by to count as "behind".
    pub flip_threshold: f64,
    /// Consecutive "behind" minor cycles before flipping.
    pub flip_after: u32,
    /// Minor cycles after a flip (or a major cycle) during which no flip happens.
    pub min_dwell: u32,
    /// Minor cycles before trying a mode that has no throughput estimate yet. 0 disables trials.
    pub trial_interval: u32,
    /// Weight of the newest allocation speed sample in the space tuner.
    pub speed_smoothing: f64,
    /// Waste difference, as a fraction of mature + large object capacity, that triggers a transfer.
    pub waste_threshold: f64,
    /// Resize the nursery after minor cycles.
    pub nursery_adaptation: bool,
    /// Fraction of free mature capacity the next promotion may consume.
    pub promotion_headroom: f64,
    /// Heap occupancy after a major cycle above which the committed heap grows.
    pub grow_threshold: f64,
    /// Heap occupancy after a major cycle below which the committed heap shrinks.
    pub shrink_threshold: f64,
    /// How fast the committed heap grows.
    pub growth_rate: f64,
    /// Mature occupancy that starts a concurrent cycle.
    pub concurrent_trigger_ratio: f64,
    /// Objects a marker processes per step.
    pub mark_step_budget: usize,
    /// Objects a sweeper processes per step.
    pub sweep_step_budget: usize,
    /// Entries a mutator buffers before handing a block to the collector.
    pub barrier_batch_size: usize,
    /// Capacity of the dirty-set channel, in blocks.
    pub dirty_channel_capacity: usize,
    /// Number of pause records kept for diagnostics.
    pub pause_log_capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            mode_adaptation: true,
            throughput_smoothing: 0.3,
            flip_threshold: 0.15,
            flip_after: 3,
            min_dwell: 4,
            trial_interval: 16,
            speed_smoothing: 0.5,
            waste_threshold: 0.05,
            nursery_adaptation: true,
            promotion_headroom: 0.5,
            grow_threshold: 0.7,
            shrink_threshold: 0.3,
            growth_rate: 1.4,
            concurrent_trigger_ratio: 0.75,
            mark_step_budget: 256,
            sweep_step_budget: 256,
            barrier_batch_size: 64,
            dirty_channel_capacity: 256,
            pause_log_capacity: 64,
        }
    }
}

/// Start-up configuration of the heap.
#[derive(Clone, Debug)]
pub struct Config {
    /// Committed heap size at start-up.
    pub initial_heap_size: usize,
    /// The heap never shrinks below this.
    pub min_heap_size: usize,
    /// Reserved heap size. The heap never grows past this.
    pub max_heap_size: usize,
    /// Initial nursery size. Ignored by algorithms without a nursery.
    pub young_size: usize,
    pub young_size_min: usize,
    pub young_size_max: usize,
    /// Initial capacity of the large object region.
    pub large_object_region_size: usize,
    pub large_object_region_min: usize,
    pub mature_region_min: usize,
    /// Allocations of this size and above go to the large object region.
    pub large_object_size: usize,
    /// Granularity of every region boundary move.
    pub block_size: usize,
    pub marker_threads: usize,
    pub sweeper_threads: usize,
    pub algorithm: AlgorithmKind,
    /// `None` runs every collection stop-the-world.
    pub concurrent: Option<ConcurrentVariant>,
    /// Start in generational mode.
    pub generational: bool,
    /// Every collection is a major collection.
    pub force_major: bool,
    /// Enables summary logging at `info` level.
    pub verbose: bool,
    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_heap_size: 64 * 1024 * 1024,
            min_heap_size: 32 * 1024 * 1024,
            max_heap_size: 256 * 1024 * 1024,
            young_size: 8 * 1024 * 1024,
            young_size_min: 2 * 1024 * 1024,
            young_size_max: 32 * 1024 * 1024,
            large_object_region_size: 8 * 1024 * 1024,
            large_object_region_min: 1024 * 1024,
            mature_region_min: 4 * 1024 * 1024,
            large_object_size: 16 * 1024,
            block_size: 32 * 1024,
            marker_threads: 2,
            sweeper_threads: 1,
            algorithm: AlgorithmKind::Generational,
            concurrent: None,
            generational: true,
            force_major: false,
            verbose: false,
            tuning: Tuning::default(),
        }
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidKnob { name, value })
    }
}

impl Config {
    /// Young region size the heap starts with. Zero for algorithms without a nursery.
    pub fn initial_young_size(&self) -> usize {
        if self.algorithm.has_young_region() {
            self.young_size
        } else {
            0
        }
    }

    /// Rejects configurations the collector cannot run. Called once by [`crate::heap::Heap::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        if self.min_heap_size > self.initial_heap_size || self.initial_heap_size > self.max_heap_size
        {
            return Err(ConfigError::InvalidHeapSize {
                min: self.min_heap_size,
                initial: self.initial_heap_size,
                max: self.max_heap_size,
            });
        }
        if self.algorithm.has_young_region()
            && (self.young_size < self.block_size
                || self.young_size_min > self.young_size
                || self.young_size > self.young_size_max)
        {
            return Err(ConfigError::InvalidYoungSize {
                min: self.young_size_min,
                size: self.young_size,
                max: self.young_size_max,
            });
        }
        if self.large_object_region_min > self.large_object_region_size {
            return Err(ConfigError::InvalidRegionMinimum("large object"));
        }
        let fixed = self.initial_young_size() + self.large_object_region_size;
        if fixed + self.mature_region_min > self.initial_heap_size {
            return Err(ConfigError::HeapTooSmall {
                required: fixed + self.mature_region_min,
                initial: self.initial_heap_size,
            });
        }
        if self.generational && self.algorithm != AlgorithmKind::Generational {
            return Err(ConfigError::UnsupportedCombination {
                algorithm: self.algorithm,
                feature: "generational mode",
            });
        }
        if let Some(variant) = self.concurrent {
            if !self.algorithm.supports_concurrent() {
                return Err(ConfigError::UnsupportedCombination {
                    algorithm: self.algorithm,
                    feature: "concurrent collection",
                });
            }
            if self.marker_threads == 0 {
                return Err(ConfigError::NoWorkers("marker"));
            }
            if variant == ConcurrentVariant::MarkAndSweep && self.sweeper_threads == 0 {
                return Err(ConfigError::NoWorkers("sweeper"));
            }
        }
        let t = &self.tuning;
        check_fraction("throughput_smoothing", t.throughput_smoothing)?;
        check_fraction("flip_threshold", t.flip_threshold)?;
        check_fraction("speed_smoothing", t.speed_smoothing)?;
        check_fraction("waste_threshold", t.waste_threshold)?;
        check_fraction("promotion_headroom", t.promotion_headroom)?;
        check_fraction("grow_threshold", t.grow_threshold)?;
        check_fraction("concurrent_trigger_ratio", t.concurrent_trigger_ratio)?;
        if t.shrink_threshold < 0.0 || t.shrink_threshold >= t.grow_threshold {
            return Err(ConfigError::InvalidKnob {
                name: "shrink_threshold",
                value: t.shrink_threshold,
            });
        }
        if t.growth_rate <= 1.0 {
            return Err(ConfigError::InvalidKnob {
                name: "growth_rate",
                value: t.growth_rate,
            });
        }
        if t.flip_after == 0
            || t.mark_step_budget == 0
            || t.sweep_step_budget == 0
            || t.barrier_batch_size == 0
            || t.dirty_channel_capacity == 0
        {
            return Err(ConfigError::InvalidKnob {
                name: "zero-sized tuning value",
                value: 0.0,
            });
        }
        Ok(())
    }
}
