//! Switches minor collections between generational and non-generational mode,
//! and sizes the nursery.
use std::time::Duration;

use crate::config::Tuning;
use crate::util::{align_down, align_up, smooth};

/// How a minor collection finds old-to-young references.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum GenMode {
    /// Scans only the remembered set maintained by the write barrier.
    Generational,
    /// Scans the whole old generation.
    NonGenerational,
}

impl GenMode {
    pub fn other(self) -> Self {
        match self {
            Self::Generational => Self::NonGenerational,
            Self::NonGenerational => Self::Generational,
        }
    }
}

pub struct GenModeAdaptor {
    enabled: bool,
    smoothing: f64,
    flip_threshold: f64,
    flip_after: u32,
    min_dwell: u32,
    trial_interval: u32,
    active: GenMode,
    generational: Option<f64>,
    non_generational: Option<f64>,
    behind: u32,
    dwell: u32,
    trial_countdown: u32,
    flips: usize,
}

impl GenModeAdaptor {
    /// `enabled` is false when the algorithm has a single minor mode.
    pub fn new(initial: GenMode, enabled: bool, tuning: &Tuning) -> Self {
        Self {
            enabled: enabled && tuning.mode_adaptation,
            smoothing: tuning.throughput_smoothing,
            flip_threshold: tuning.flip_threshold,
            flip_after: tuning.flip_after,
            min_dwell: tuning.min_dwell,
            trial_interval: tuning.trial_interval,
            active: initial,
            generational: None,
            non_generational: None,
            behind: 0,
            dwell: 0,
            trial_countdown: tuning.trial_interval,
            flips: 0,
        }
    }

    pub fn active(&self) -> GenMode {
        self.active
    }

    pub fn flips(&self) -> usize {
        self.flips
    }

    /// Smoothed throughput of `mode` in bytes reclaimed per microsecond of pause.
    pub fn throughput(&self, mode: GenMode) -> Option<f64> {
        match mode {
            GenMode::Generational => self.generational,
            GenMode::NonGenerational => self.non_generational,
        }
    }

    fn estimate_mut(&mut self, mode: GenMode) -> &mut Option<f64> {
        match mode {
            GenMode::Generational => &mut self.generational,
            GenMode::NonGenerational => &mut self.non_generational,
        }
    }

    /// Mode of the next collection. Major collections always scan everything.
    pub fn mode_for(&self, major: bool) -> GenMode {
        if major {
            GenMode::NonGenerational
        } else {
            self.active
        }
    }

    /// Feeds a finished minor collection. Returns the new mode if it flipped.
    pub fn record_minor(
        &mut self,
        mode: GenMode,
        reclaimed: usize,
        pause: Duration,
    ) -> Option<GenMode> {
        let micros = (pause.as_secs_f64() * 1e6).max(1.0);
        let sample = reclaimed as f64 / micros;
        let smoothing = self.smoothing;
        let estimate = self.estimate_mut(mode);
        *estimate = Some(smooth(*estimate, sample, smoothing));

        if !self.enabled {
            return None;
        }
        if self.dwell > 0 {
            self.dwell -= 1;
            return None;
        }

        let alternative = self.active.other();
        match self.throughput(alternative) {
            None => {
                if self.trial_interval == 0 {
                    return None;
                }
                self.trial_countdown = self.trial_countdown.saturating_sub(1);
                if self.trial_countdown == 0 {
                    self.trial_countdown = self.trial_interval;
                    return Some(self.flip("trial"));
                }
                None
            }
            Some(other) => {
                let current = self.throughput(self.active).unwrap_or(0.0);
                if current < other * (1.0 - self.flip_threshold) {
                    self.behind += 1;
                } else {
                    self.behind = 0;
                }
                if self.behind >= self.flip_after {
                    return Some(self.flip("throughput"));
                }
                None
            }
        }
    }

    /// A major collection restarts the dwell period.
    pub fn record_major(&mut self) {
        self.dwell = self.min_dwell;
        self.behind = 0;
    }

    fn flip(&mut self, reason: &str) -> GenMode {
        let from = self.active;
        self.active = from.other();
        self.behind = 0;
        self.dwell = self.min_dwell;
        self.flips += 1;
        log::debug!(
            "[gc] minor collection mode {:?} -> {:?} ({})",
            from,
            self.active,
            reason
        );
        self.active
    }
}

/// Picks a nursery size whose expected promotion volume fits into the mature
/// region.
pub struct NurserySizer {
    enabled: bool,
    min: usize,
    max: usize,
    block_size: usize,
    headroom: f64,
}

impl NurserySizer {
    pub fn new(min: usize, max: usize, block_size: usize, tuning: &Tuning) -> Self {
        Self {
            enabled: tuning.nursery_adaptation,
            min: align_up(min.max(block_size), block_size),
            max: align_down(max, block_size),
            block_size,
            headroom: tuning.promotion_headroom,
        }
    }

    /// Young region size for the next cycle.
    pub fn target(&self, current: usize, mature_free: usize, survive_ratio: f64) -> usize {
        if !self.enabled {
            return current;
        }
        let budget = mature_free as f64 * self.headroom;
        let target = if survive_ratio <= f64::EPSILON {
            self.max
        } else {
            (budget / survive_ratio).min(self.max as f64) as usize
        };
        align_down(target, self.block_size).clamp(self.min, self.max.max(self.min))
    }
}
