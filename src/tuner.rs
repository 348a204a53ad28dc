//! Moves capacity between the mature and the large object region.
//!
//! Whenever one of the two regions fills up while the other one still has free
//! capacity, that free capacity counts as wasted. Once the wasted capacity of
//! one side exceeds the other by more than a threshold, a transfer is proposed
//! that gives each region a share of the free capacity proportional to its
//! allocation speed. Running out of large object space forces a transfer.
use std::time::Duration;

use crate::collector::GcCause;
use crate::config::Tuning;
use crate::space::Region;
use crate::util::{align_down, align_up, smooth};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferDirection {
    /// Mature region gives capacity to the large object region.
    IntoLarge,
    /// Large object region gives capacity to the mature region.
    IntoMature,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub size: usize,
}

/// Capacity figures of one region at the end of a cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RegionView {
    pub committed: usize,
    pub minimum: usize,
    pub free: usize,
    pub tail_free: usize,
}

impl RegionView {
    pub fn of(region: &Region) -> Self {
        Self {
            committed: region.committed(),
            minimum: region.minimum(),
            free: region.free(),
            tail_free: region.tail_free(),
        }
    }

    /// Capacity the region can give away right now.
    fn givable(&self) -> usize {
        self.tail_free
            .min(self.committed.saturating_sub(self.minimum))
    }
}

/// What the tuner learns from one cycle.
#[derive(Clone, Copy, Debug)]
pub struct TunerSample {
    pub cause: GcCause,
    /// Mutator time since the previous cycle.
    pub interval: Duration,
    pub allocated_mature: usize,
    pub allocated_large: usize,
    /// Free capacity when the cycle was triggered.
    pub mature_before: RegionView,
    pub large_before: RegionView,
    /// Capacity after the cycle reclaimed memory.
    pub mature: RegionView,
    pub large: RegionView,
    /// Size of the large allocation that failed, if any.
    pub requested: usize,
}

pub struct SpaceTuner {
    block_size: usize,
    speed_smoothing: f64,
    waste_threshold: f64,
    mature_speed: Option<f64>,
    large_speed: Option<f64>,
    wasted_mature: usize,
    wasted_large: usize,
    force: bool,
    need: usize,
    pending: Option<Transfer>,
}

impl SpaceTuner {
    pub fn new(block_size: usize, tuning: &Tuning) -> Self {
        Self {
            block_size,
            speed_smoothing: tuning.speed_smoothing,
            waste_threshold: tuning.waste_threshold,
            mature_speed: None,
            large_speed: None,
            wasted_mature: 0,
            wasted_large: 0,
            force: false,
            need: 0,
            pending: None,
        }
    }

    pub fn wasted(&self) -> (usize, usize) {
        (self.wasted_mature, self.wasted_large)
    }

    pub fn speeds(&self) -> (f64, f64) {
        (
            self.mature_speed.unwrap_or(0.0),
            self.large_speed.unwrap_or(0.0),
        )
    }

    pub fn pending(&self) -> Option<Transfer> {
        self.pending
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Drops the proposal of the previous cycle. Accumulated waste survives.
    pub fn begin_major_cycle(&mut self) {
        self.pending = None;
        self.force = false;
        self.need = 0;
    }

    /// Takes the pending transfer for application at a quiescent point.
    pub fn take_transfer(&mut self) -> Option<Transfer> {
        let transfer = self.pending.take()?;
        self.wasted_mature = 0;
        self.wasted_large = 0;
        self.force = false;
        self.need = 0;
        Some(transfer)
    }

    pub fn observe(&mut self, sample: &TunerSample) -> Option<Transfer> {
        let seconds = sample.interval.as_secs_f64().max(1e-6);
        self.mature_speed = Some(smooth(
            self.mature_speed,
            sample.allocated_mature as f64 / seconds,
            self.speed_smoothing,
        ));
        self.large_speed = Some(smooth(
            self.large_speed,
            sample.allocated_large as f64 / seconds,
            self.speed_smoothing,
        ));

        match sample.cause {
            GcCause::MatureRegionFull => self.wasted_large += sample.large_before.free,
            GcCause::LargeObjectRegionFull => {
                self.wasted_mature += sample.mature_before.free;
                self.force = true;
                self.need = self.need.max(align_up(sample.requested, self.block_size));
            }
            _ => {}
        }

        self.pending = self.propose(&sample.mature, &sample.large);
        if let Some(transfer) = self.pending {
            log::debug!(
                "[gc] space tuner proposes {:?} of {} bytes (waste mature {}, large {})",
                transfer.direction,
                transfer.size,
                self.wasted_mature,
                self.wasted_large
            );
        }
        self.pending
    }

    fn propose(&self, mature: &RegionView, large: &RegionView) -> Option<Transfer> {
        let threshold = ((self.waste_threshold * (mature.committed + large.committed) as f64)
            as usize)
            .max(self.block_size);
        let difference = self.wasted_mature as i64 - self.wasted_large as i64;

        let direction = if self.force || difference > threshold as i64 {
            TransferDirection::IntoLarge
        } else if difference < -(threshold as i64) {
            TransferDirection::IntoMature
        } else {
            return None;
        };

        let (mature_speed, large_speed) = self.speeds();
        let total_tail = (mature.tail_free + large.tail_free) as f64;
        let large_share = if mature_speed + large_speed > 0.0 {
            total_tail * large_speed / (mature_speed + large_speed)
        } else {
            total_tail / 2.0
        };
        let imbalance = large_share - large.tail_free as f64;

        let mut size = match direction {
            TransferDirection::IntoLarge => imbalance.max(0.0) as usize,
            TransferDirection::IntoMature => (-imbalance).max(0.0) as usize,
        };
        size = size.min(difference.unsigned_abs() as usize);
        if self.force {
            size = size.max(self.need);
        }

        let giver = match direction {
            TransferDirection::IntoLarge => mature,
            TransferDirection::IntoMature => large,
        };
        size = align_down(size.min(giver.givable()), self.block_size);
        if size == 0 {
            return None;
        }
        Some(Transfer { direction, size })
    }
}
