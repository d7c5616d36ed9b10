//! Property tests for the sliding-window rate estimator.

use framepacer::RateWindow;
use proptest::prelude::*;

proptest! {
    /// After every recorded tick, the retained sample count equals a naive
    /// filter of all timestamps against the trailing window.
    #[test]
    fn retained_count_matches_naive_filter(
        deltas in prop::collection::vec(0_u64..500, 1..200),
    ) {
        let mut window = RateWindow::new(1_000);
        let mut all_ticks = Vec::new();
        let mut now = 0_u64;
        for delta in deltas {
            now += delta;
            all_ticks.push(now);
            window.record_tick(now);
            let cutoff = now.saturating_sub(1_000);
            let expected = all_ticks.iter().filter(|&&t| t >= cutoff).count();
            prop_assert_eq!(window.samples(), expected);
        }
    }

    /// During warm-up the rate is the sample count extrapolated over the
    /// elapsed fraction of the window.
    #[test]
    fn warmup_rate_matches_extrapolation(
        deltas in prop::collection::vec(1_u64..40, 1..20),
    ) {
        let mut window = RateWindow::new(1_000);
        let mut now = 0_u64;
        let mut count = 0_usize;
        for delta in deltas {
            now += delta;
            count += 1;
            window.record_tick(now);
        }
        // Max possible elapsed time is 19 * 39 < 1_000: still warming up.
        prop_assert!(now < 1_000);
        let rate = window.current_rate(now, 0);
        let expected = count as f64 * 1_000.0 / now as f64;
        prop_assert!((rate - expected).abs() < 1e-9);
    }

    /// Once a full window has elapsed, the rate is exactly the sample count.
    #[test]
    fn steady_state_rate_is_sample_count(
        deltas in prop::collection::vec(1_u64..200, 10..100),
    ) {
        let mut window = RateWindow::new(1_000);
        let mut now = 0_u64;
        for delta in deltas {
            now += delta;
            window.record_tick(now);
        }
        prop_assume!(now >= 1_000);
        let rate = window.current_rate(now, 0);
        prop_assert!((rate - window.samples() as f64).abs() < f64::EPSILON);
    }
}
