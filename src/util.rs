use std::time::Duration;

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    align_down(value + align - 1, align)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & align.wrapping_sub(1) == 0
}

/// Exponentially weighted moving average. The first sample seeds the average.
#[inline]
pub fn smooth(previous: Option<f64>, sample: f64, weight: f64) -> f64 {
    match previous {
        Some(previous) => previous + weight * (sample - previous),
        None => sample,
    }
}

/// Milliseconds with microsecond precision, for log lines.
#[inline]
pub fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
