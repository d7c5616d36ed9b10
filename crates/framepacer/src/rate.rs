//! Sliding-window throughput estimation over observed clock ticks.
//!
//! The estimator keeps the timestamps of every tick seen within a trailing
//! window (one second by default) and answers "how many ticks per window are
//! we actually observing?". During warm-up — before a full window of clock
//! time has elapsed — the rate is extrapolated from the samples collected so
//! far, so throttling decisions self-correct through startup transients
//! instead of assuming the clock's nominal rate.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// =============================================================================
// RateWindow
// =============================================================================

/// Tick-throughput estimator over a trailing time window.
///
/// Timestamps are injected by the caller (milliseconds on any monotonic
/// origin); the estimator never reads a wall clock.
///
/// # Example
///
/// ```ignore
/// let mut window = RateWindow::new(1_000);
/// window.record_tick(100);
/// window.record_tick(200);
/// let rate = window.current_rate(200, 0); // 2 samples / 0.2s => 10.0
/// ```
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// Window length in milliseconds.
    window_ms: u64,
    /// Tick timestamps within the window, newest first.
    samples: VecDeque<u64>,
}

impl RateWindow {
    /// Create an estimator over a `window_ms` trailing window.
    ///
    /// # Panics
    ///
    /// Panics if `window_ms` is zero.
    #[must_use]
    pub fn new(window_ms: u64) -> Self {
        assert!(window_ms > 0, "window_ms must be positive");
        Self {
            window_ms,
            samples: VecDeque::new(),
        }
    }

    /// Record a tick observed at `now_ms` and evict samples that have fallen
    /// out of the trailing window.
    ///
    /// Timestamps are expected to be non-decreasing; the newest sample always
    /// lands at the front.
    pub fn record_tick(&mut self, now_ms: u64) {
        self.samples.push_front(now_ms);
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self.samples.back().is_some_and(|&t| t < cutoff) {
            self.samples.pop_back();
        }
    }

    /// Observed throughput in ticks per window.
    ///
    /// Once a full window has elapsed since `start_ms` the sample count *is*
    /// the rate. Before that, the count is extrapolated over the elapsed
    /// fraction of the window. Elapsed time is clamped to at least one
    /// millisecond so a same-millisecond first tick cannot divide by zero.
    #[must_use]
    pub fn current_rate(&self, now_ms: u64, start_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(start_ms).max(1);
        if elapsed_ms >= self.window_ms {
            self.samples.len() as f64
        } else {
            self.samples.len() as f64 * self.window_ms as f64 / elapsed_ms as f64
        }
    }

    /// Number of samples currently inside the window.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    /// Whether no ticks have been observed within the window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Window length in milliseconds.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Drop every sample, returning the window to its initial state.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Serializable snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> RateWindowStats {
        RateWindowStats {
            window_ms: self.window_ms,
            samples: self.samples.len(),
            newest_ms: self.samples.front().copied(),
            oldest_ms: self.samples.back().copied(),
        }
    }
}

/// Serializable statistics about a rate window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowStats {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Samples currently retained.
    pub samples: usize,
    /// Newest retained timestamp, if any.
    pub newest_ms: Option<u64>,
    /// Oldest retained timestamp, if any.
    pub oldest_ms: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_newest_first() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(100);
        w.record_tick(200);
        let stats = w.stats();
        assert_eq!(stats.newest_ms, Some(200));
        assert_eq!(stats.oldest_ms, Some(100));
        assert_eq!(w.samples(), 2);
    }

    #[test]
    fn evicts_outside_window() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(0);
        w.record_tick(500);
        w.record_tick(1_400);
        // 0 is older than 1_400 - 1_000; 500 is retained.
        assert_eq!(w.samples(), 2);
        assert_eq!(w.stats().oldest_ms, Some(500));
    }

    #[test]
    fn boundary_sample_is_retained() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(200);
        w.record_tick(1_200);
        // 200 == 1_200 - 1_000: exactly on the boundary stays.
        assert_eq!(w.samples(), 2);
    }

    #[test]
    fn warmup_rate_is_extrapolated() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(250);
        w.record_tick(500);
        // 2 samples over half a window extrapolate to 4 per window.
        let rate = w.current_rate(500, 0);
        assert!((rate - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn steady_state_rate_is_sample_count() {
        let mut w = RateWindow::new(1_000);
        for i in 1..=20 {
            w.record_tick(i * 100);
        }
        // Full window elapsed: samples within (1_000, 2_000] count directly.
        let rate = w.current_rate(2_000, 0);
        assert!((rate - w.samples() as f64).abs() < f64::EPSILON);
        assert_eq!(w.samples(), 11); // 1_000..=2_000 inclusive boundary
    }

    #[test]
    fn same_millisecond_tick_does_not_divide_by_zero() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(0);
        let rate = w.current_rate(0, 0);
        assert!(rate.is_finite());
    }

    #[test]
    fn clear_resets_samples() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(100);
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.window_ms(), 1_000);
    }

    #[test]
    fn stats_serde_roundtrip() {
        let mut w = RateWindow::new(1_000);
        w.record_tick(100);
        let stats = w.stats();
        let json = serde_json::to_string(&stats).unwrap();
        let back: RateWindowStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }

    #[test]
    #[should_panic(expected = "window_ms must be positive")]
    fn zero_window_panics() {
        let _ = RateWindow::new(0);
    }
}
