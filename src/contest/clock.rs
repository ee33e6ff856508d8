// =============================================================================
// Replay Clock — wall-clock elapsed time to market-time windows
// =============================================================================
//
// The contest compresses the corpus span into the contest duration with a
// fixed ratio. Every mapping is computed from the base-interval index k, not
// from accumulated ticker fires, so scheduler jitter can never drift the
// replay position relative to the source data.
// =============================================================================

use std::time::Duration;

/// Pure mapping between real contest time and market (corpus) time.
#[derive(Debug, Clone, Copy)]
pub struct ReplayClock {
    pub data_start_ms: i64,
    /// Market milliseconds per real millisecond.
    pub compression_ratio: f64,
    pub base_interval_secs: u64,
    pub duration_secs: u64,
}

impl ReplayClock {
    pub fn new(
        data_start_ms: i64,
        data_end_ms: i64,
        duration_secs: u64,
        base_interval_secs: u64,
    ) -> Self {
        Self {
            data_start_ms,
            compression_ratio: compression_ratio(data_start_ms, data_end_ms, duration_secs),
            base_interval_secs,
            duration_secs,
        }
    }

    /// Index of the base interval containing the given real elapsed time.
    pub fn base_index(&self, elapsed: Duration) -> u64 {
        elapsed.as_millis() as u64 / (self.base_interval_secs * 1000)
    }

    /// Market-time window `[start_ms, end_ms)` replayed during base tick `k`.
    ///
    /// Both bounds derive from k alone, so `window(k).1 == window(k + 1).0`
    /// exactly and the windows tile the corpus without gap or overlap.
    pub fn window(&self, k: u64) -> (i64, i64) {
        (self.window_start(k), self.window_start(k + 1))
    }

    fn window_start(&self, k: u64) -> i64 {
        let real_ms = (k * self.base_interval_secs * 1000) as f64;
        self.data_start_ms + (real_ms * self.compression_ratio).round() as i64
    }

    /// Real elapsed milliseconds at the start of base tick `k`.
    pub fn elapsed_ms(&self, k: u64) -> u64 {
        k * self.base_interval_secs * 1000
    }

    /// Fraction of the contest completed as of base tick `k`, in `[0, 1]`.
    pub fn progress(&self, k: u64) -> f64 {
        let total = self.total_base_ticks();
        if total == 0 {
            return 1.0;
        }
        ((k as f64 + 1.0) / total as f64).min(1.0)
    }

    /// Number of base ticks in a full contest.
    pub fn total_base_ticks(&self) -> u64 {
        self.duration_secs / self.base_interval_secs
    }

    /// True once base tick `k` would replay past the contest duration.
    pub fn is_exhausted(&self, k: u64) -> bool {
        k >= self.total_base_ticks()
    }
}

/// Market-time span divided by real-time duration.
pub fn compression_ratio(data_start_ms: i64, data_end_ms: i64, duration_secs: u64) -> f64 {
    (data_end_ms - data_start_ms) as f64 / (duration_secs * 1000) as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
