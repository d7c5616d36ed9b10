//! Fire-and-forget launch helpers with panic isolation.
//!
//! These wrappers sit *around* a pacer rather than inside it: the pacer
//! deliberately lets a queued job's panic fail the tick, while work launched
//! through this module is isolated — a panic is caught, logged, and never
//! reaches the caller.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::clock::ClockSource;

/// Run `job` on the runtime, catching and logging a panic instead of
/// propagating it. `label` identifies the job in the log line.
pub fn spawn_isolated(
    label: impl Into<String>,
    job: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    let label = label.into();
    tokio::spawn(async move {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let reason = panic_reason(panic.as_ref());
            error!(task = %label, %reason, "background job panicked");
        }
    })
}

/// Run `job` once at least `delay_ms` of clock time has accumulated.
///
/// The delay is counted in clock ticks, not wall time: a paused or throttled
/// clock stretches the delay with it. A zero delay runs on the first tick.
/// If the clock closes before the delay elapses, the job never runs.
pub fn delay(
    clock: &dyn ClockSource,
    delay_ms: u64,
    job: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    let mut ticks = clock.subscribe();
    tokio::spawn(async move {
        let mut waited_ms = 0_u64;
        loop {
            match ticks.recv().await {
                Ok(tick) => {
                    waited_ms = waited_ms.saturating_add(tick.delta_ms);
                    if waited_ms >= delay_ms {
                        break;
                    }
                }
                Err(_) => {
                    debug!(delay_ms, waited_ms, "clock closed before delay elapsed");
                    return;
                }
            }
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let reason = panic_reason(panic.as_ref());
            error!(%reason, "delayed job panicked");
        }
    })
}

/// Bounded retry for a fallible async operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Base backoff between attempts; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted,
/// returning the final error in that case.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                debug!(attempt, max_attempts, error = %err, "retrying after failure");
                let backoff = policy.backoff_ms.saturating_mul(u64::from(attempt));
                if backoff > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrameTicker;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    };

    #[tokio::test]
    async fn spawn_isolated_runs_job() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        spawn_isolated("test", move || flag.store(true, Ordering::SeqCst))
            .await
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_isolated_contains_panic() {
        let handle = spawn_isolated("boom", || panic!("deliberate"));
        // The panic was caught inside the task, so the join succeeds.
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn delay_waits_for_accumulated_ticks() {
        let ticker = Arc::new(FrameTicker::new());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = delay(ticker.as_ref(), 100, move || {
            flag.store(true, Ordering::SeqCst);
        });

        ticker.step(50);
        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));

        ticker.step(50);
        handle.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delay_zero_runs_on_first_tick() {
        let ticker = Arc::new(FrameTicker::new());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = delay(ticker.as_ref(), 0, move || {
            flag.store(true, Ordering::SeqCst);
        });
        ticker.step(1);
        handle.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delay_aborts_when_clock_closes() {
        let ticker = FrameTicker::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = delay(&ticker, 100, move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(ticker);
        handle.await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 0,
        };
        let counter = Arc::clone(&calls);
        let result: Result<u32, String> = retry(&policy, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        };
        let counter = Arc::clone(&calls);
        let result: Result<(), String> = retry(&policy, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("always fails".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
