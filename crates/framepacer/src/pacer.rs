//! Rate-governed cooperative task pacing.
//!
//! A [`Pacer`] owns a FIFO queue of zero-argument jobs and drains it from a
//! clock-driven run loop: one admission decision per tick, at most one job
//! dequeued per tick. Throttling is adaptive — the admission decision
//! consults the *observed* tick throughput over a trailing window rather
//! than an assumed nominal frame rate, so a host whose frame rate dips
//! defers queued work instead of piling it onto slow frames.
//!
//! # Lifecycle
//!
//! ```text
//! Sleeping --queue()--> Running --queue empties--> Sleeping
//! {Sleeping,Running} --pause()--> Paused --resume()--> Running
//! any state --disconnect()--> Destroyed (terminal)
//! ```
//!
//! The run-loop task is alive exactly while the pacer is Running; its tick
//! subscription is released whenever the loop exits.
//!
//! # Job failures
//!
//! Job execution is synchronous and, by default, unguarded: a panicking job
//! fails the current tick's processing. The run loop unwinds, the pacer
//! parks itself Sleeping with the rest of the queue intact, and the next
//! `queue()` re-enters the loop. Set [`PacerConfig::isolate_failures`] to
//! catch-and-log per job instead.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{ClockSource, Tick, TickStream};
use crate::error::{Error, Result};
use crate::rate::RateWindow;

/// A queued unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`Pacer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Target executions per window. Negative selects unthrottled mode:
    /// jobs drain as fast as ticks arrive, one per tick.
    pub target_rate: f64,
    /// Trailing window length for throughput estimation, in milliseconds.
    pub window_ms: u64,
    /// Catch panicking jobs and log them instead of failing the tick.
    pub isolate_failures: bool,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_rate: 60.0,
            window_ms: 1_000,
            isolate_failures: false,
        }
    }
}

impl PacerConfig {
    /// Configuration with the given target rate and defaults elsewhere.
    #[must_use]
    pub fn with_target_rate(target_rate: f64) -> Self {
        Self {
            target_rate,
            ..Self::default()
        }
    }

    /// Unthrottled configuration: drain one job per tick, ungated.
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::with_target_rate(-1.0)
    }

    fn validate(&self) -> Result<()> {
        if !self.target_rate.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "target_rate must be a finite number, got {}",
                self.target_rate
            )));
        }
        if self.target_rate == 0.0 {
            return Err(Error::InvalidArgument(
                "target_rate must be non-zero (negative means unthrottled)".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(Error::InvalidArgument(
                "window_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// State and snapshots
// =============================================================================

/// Lifecycle state of a pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacerState {
    /// Idle: no run loop, queue may or may not be empty.
    Sleeping,
    /// Run loop is live and consuming ticks.
    Running,
    /// Explicitly halted by the caller; queue retained, no tick subscription.
    Paused,
    /// Terminal: disconnected, every operation fails.
    Destroyed,
}

/// Counters for observability and triage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacerMetrics {
    /// Ticks consumed by the run loop.
    pub ticks_observed: u64,
    /// Jobs dequeued for execution.
    pub jobs_executed: u64,
    /// Ticks on which admission deferred dequeuing.
    pub admissions_deferred: u64,
    /// Jobs that panicked under failure isolation.
    pub jobs_failed: u64,
    /// Transitions into the Sleeping state.
    pub sleep_transitions: u64,
}

/// Point-in-time view of a pacer for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerSnapshot {
    /// Current lifecycle state.
    pub state: PacerState,
    /// Configured target rate.
    pub target_rate: f64,
    /// Jobs waiting in the queue.
    pub queue_depth: usize,
    /// Observed tick throughput (ticks per window).
    pub observed_rate: f64,
    /// Counters since construction.
    pub metrics: PacerMetrics,
}

// =============================================================================
// Pacer
// =============================================================================

struct PacerInner {
    state: PacerState,
    queue: VecDeque<Job>,
    window: RateWindow,
    start_ms: u64,
    /// Timestamp of the most recent dequeue, for target-period spacing.
    last_run_ms: Option<u64>,
    /// Generation counter: a run loop only acts while its epoch is current.
    loop_epoch: u64,
    /// Join handle of the live run loop; present iff state is Running.
    loop_handle: Option<JoinHandle<()>>,
    metrics: PacerMetrics,
}

struct Shared {
    inner: Mutex<PacerInner>,
    clock: Arc<dyn ClockSource>,
    config: PacerConfig,
    /// Bumped whenever the run loop exits; wakes `wait()` callers.
    idle_tx: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PacerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn observed_rate(&self, inner: &PacerInner) -> f64 {
        inner.window.current_rate(self.clock.now_ms(), inner.start_ms)
    }
}

/// A frame-governed task pacer. Clones share the same underlying pacer.
///
/// Methods that (re)enter the run loop (`queue`, `resume`) must be called
/// from within a tokio runtime.
#[derive(Clone)]
pub struct Pacer {
    shared: Arc<Shared>,
}

impl Pacer {
    /// Create a pacer bound to `clock`, starting Sleeping.
    ///
    /// The construction instant is the baseline for warm-up rate
    /// extrapolation; the first admission decision always happens after the
    /// first tick has been recorded against that baseline.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the target rate is non-finite or zero, or the
    /// window is empty. Nothing is allocated or subscribed on failure.
    pub fn new(clock: Arc<dyn ClockSource>, config: PacerConfig) -> Result<Self> {
        config.validate()?;
        let start_ms = clock.now_ms();
        let window = RateWindow::new(config.window_ms);
        let (idle_tx, _idle_rx) = watch::channel(0_u64);
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(PacerInner {
                    state: PacerState::Sleeping,
                    queue: VecDeque::new(),
                    window,
                    start_ms,
                    last_run_ms: None,
                    loop_epoch: 0,
                    loop_handle: None,
                    metrics: PacerMetrics::default(),
                }),
                clock,
                config,
                idle_tx,
            }),
        })
    }

    /// Create a pacer with the default configuration (60 per second).
    pub fn with_defaults(clock: Arc<dyn ClockSource>) -> Result<Self> {
        Self::new(clock, PacerConfig::default())
    }

    /// Enqueue a job.
    ///
    /// Queueing while Sleeping immediately re-enters the run loop by
    /// subscribing to the clock. Queueing while Paused only appends; it does
    /// not auto-resume.
    ///
    /// # Errors
    ///
    /// `Destroyed` after `disconnect()`.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut inner = self.shared.lock();
        match inner.state {
            PacerState::Destroyed => Err(Error::Destroyed),
            PacerState::Paused | PacerState::Running => {
                inner.queue.push_back(Box::new(job));
                Ok(())
            }
            PacerState::Sleeping => {
                inner.queue.push_back(Box::new(job));
                self.enter_run_loop(&mut inner);
                Ok(())
            }
        }
    }

    /// Halt dequeuing and release the tick subscription; the queue is kept.
    ///
    /// Returns the current observed rate as a diagnostic value. No-op (rate
    /// only) if already Paused.
    ///
    /// # Errors
    ///
    /// `Destroyed` after `disconnect()`.
    pub fn pause(&self) -> Result<f64> {
        let mut inner = self.shared.lock();
        let rate = self.shared.observed_rate(&inner);
        match inner.state {
            PacerState::Destroyed => Err(Error::Destroyed),
            PacerState::Paused => Ok(rate),
            PacerState::Sleeping => {
                inner.state = PacerState::Paused;
                info!(rate, "pacer paused while sleeping");
                Ok(rate)
            }
            PacerState::Running => {
                inner.state = PacerState::Paused;
                inner.loop_epoch += 1;
                let handle = inner.loop_handle.take();
                drop(inner);
                if let Some(handle) = handle {
                    handle.abort();
                }
                info!(rate, "pacer paused");
                Ok(rate)
            }
        }
    }

    /// Leave the Paused state and re-enter the run loop.
    ///
    /// Re-subscribes unconditionally — even with an empty queue, in which
    /// case the loop costs one tick before sleeping itself again. Returns
    /// the current observed rate; no-op (rate only) if not Paused.
    ///
    /// # Errors
    ///
    /// `Destroyed` after `disconnect()`.
    pub fn resume(&self) -> Result<f64> {
        let mut inner = self.shared.lock();
        let rate = self.shared.observed_rate(&inner);
        match inner.state {
            PacerState::Destroyed => Err(Error::Destroyed),
            PacerState::Paused => {
                self.enter_run_loop(&mut inner);
                info!(rate, queue_depth = inner.queue.len(), "pacer resumed");
                Ok(rate)
            }
            PacerState::Sleeping | PacerState::Running => Ok(rate),
        }
    }

    /// Wait until the pacer is idle (Sleeping or Paused).
    ///
    /// Completion is signalled by the run loop itself when it exits, not by
    /// polling ticks. Returns the current observed rate.
    ///
    /// # Errors
    ///
    /// `Destroyed` if the pacer is, or becomes, disconnected while waiting.
    pub async fn wait(&self) -> Result<f64> {
        let mut idle_rx = self.shared.idle_tx.subscribe();
        loop {
            {
                let inner = self.shared.lock();
                match inner.state {
                    PacerState::Destroyed => return Err(Error::Destroyed),
                    PacerState::Sleeping | PacerState::Paused => {
                        return Ok(self.shared.observed_rate(&inner));
                    }
                    PacerState::Running => {}
                }
            }
            if idle_rx.changed().await.is_err() {
                return Err(Error::Destroyed);
            }
        }
    }

    /// Whether the pacer will accept and (eventually) run queued work.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.shared.lock().state,
            PacerState::Sleeping | PacerState::Running
        )
    }

    /// Tear the pacer down: force-pause, drop the queue and tick history,
    /// wait for the run loop to confirm idle, and poison the handle.
    ///
    /// # Errors
    ///
    /// `Destroyed` on every call after the first.
    pub async fn disconnect(&self) -> Result<()> {
        let handle = {
            let mut inner = self.shared.lock();
            if inner.state == PacerState::Destroyed {
                return Err(Error::Destroyed);
            }
            inner.state = PacerState::Destroyed;
            inner.loop_epoch += 1;
            inner.queue.clear();
            inner.window.clear();
            inner.loop_handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            // Confirmed idle: the loop has fully unwound before we return.
            let _ = handle.await;
        }
        self.shared.idle_tx.send_modify(|generation| *generation += 1);
        info!("pacer disconnected");
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PacerState {
        self.shared.lock().state
    }

    /// Jobs currently queued.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Point-in-time snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> PacerSnapshot {
        let inner = self.shared.lock();
        PacerSnapshot {
            state: inner.state,
            target_rate: self.shared.config.target_rate,
            queue_depth: inner.queue.len(),
            observed_rate: self.shared.observed_rate(&inner),
            metrics: inner.metrics.clone(),
        }
    }

    /// Counters since construction.
    #[must_use]
    pub fn metrics(&self) -> PacerMetrics {
        self.shared.lock().metrics.clone()
    }

    /// Transition to Running and spawn a fresh run loop.
    ///
    /// The tick subscription is opened synchronously, before the loop task is
    /// spawned, so no tick emitted after this call can be missed.
    fn enter_run_loop(&self, inner: &mut PacerInner) {
        inner.loop_epoch += 1;
        inner.state = PacerState::Running;
        let epoch = inner.loop_epoch;
        let ticks = self.shared.clock.subscribe();
        debug!(epoch, queue_depth = inner.queue.len(), "entering run loop");
        let shared = Arc::clone(&self.shared);
        inner.loop_handle = Some(tokio::spawn(run_loop(shared, epoch, ticks)));
    }
}

// =============================================================================
// Run loop
// =============================================================================

/// What the run loop should do with the tick it just received.
enum TickOutcome {
    /// Run this job, then continue.
    Run(Job),
    /// Budget says not yet; hold for the next tick.
    Hold,
    /// The loop is no longer current (slept, paused, destroyed, superseded).
    Exit,
}

/// Throttled-mode admission: enough budget to dequeue on this tick?
///
/// Three gates, all required:
/// - the windowed throughput keeps pace with the target, so queued work is
///   deferred while the host is below its frame budget;
/// - the gap to the previous tick does not exceed the target period
///   (instantaneous form of the same pacing check);
/// - at least one target period has elapsed since the previous dequeue, so
///   executions never exceed the target rate at steady state.
fn admit(config: &PacerConfig, rate: f64, tick: Tick, last_run_ms: Option<u64>) -> bool {
    let period_ms = config.window_ms as f64 / config.target_rate;
    rate >= config.target_rate
        && tick.delta_ms as f64 <= period_ms
        && last_run_ms.is_none_or(|last| tick.now_ms.saturating_sub(last) as f64 >= period_ms)
}

/// Consume one tick: record it, decide admission, pop at most one job.
fn process_tick(shared: &Shared, epoch: u64, tick: Tick) -> TickOutcome {
    let mut inner = shared.lock();
    if inner.loop_epoch != epoch || inner.state != PacerState::Running {
        return TickOutcome::Exit;
    }

    inner.metrics.ticks_observed += 1;
    inner.window.record_tick(tick.now_ms);

    let admitted = if shared.config.target_rate < 0.0 {
        true
    } else {
        let rate = inner.window.current_rate(tick.now_ms, inner.start_ms);
        admit(&shared.config, rate, tick, inner.last_run_ms)
    };
    if !admitted {
        inner.metrics.admissions_deferred += 1;
        return TickOutcome::Hold;
    }

    match inner.queue.pop_front() {
        Some(job) => {
            inner.last_run_ms = Some(tick.now_ms);
            inner.metrics.jobs_executed += 1;
            TickOutcome::Run(job)
        }
        None => {
            inner.state = PacerState::Sleeping;
            inner.metrics.sleep_transitions += 1;
            inner.loop_handle = None;
            debug!(epoch, "queue empty; pacer going to sleep");
            TickOutcome::Exit
        }
    }
}

async fn run_loop(shared: Arc<Shared>, epoch: u64, mut ticks: TickStream) {
    let _guard = LoopGuard {
        shared: Arc::clone(&shared),
        epoch,
    };
    loop {
        let tick = match ticks.recv().await {
            Ok(tick) => tick,
            // Clock source hung up; the guard parks the pacer.
            Err(_) => break,
        };
        match process_tick(&shared, epoch, tick) {
            TickOutcome::Exit => break,
            TickOutcome::Hold => {}
            TickOutcome::Run(job) => {
                if shared.config.isolate_failures {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        let reason = panic_reason(panic.as_ref());
                        error!(%reason, "queued job panicked (isolated)");
                        shared.lock().metrics.jobs_failed += 1;
                    }
                } else {
                    // A panic here fails this tick's processing and unwinds
                    // through the guard below.
                    job();
                }
            }
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

/// Restores pacer invariants however the run loop exits: normal sleep,
/// abort on pause/disconnect, clock closure, or a job panic unwinding.
struct LoopGuard {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            if inner.loop_epoch == self.epoch {
                if inner.state == PacerState::Running {
                    // Abnormal exit path: the loop died while still the
                    // current owner (job panic or clock closure).
                    inner.state = PacerState::Sleeping;
                    inner.metrics.sleep_transitions += 1;
                    if std::thread::panicking() {
                        warn!(
                            epoch = self.epoch,
                            queue_depth = inner.queue.len(),
                            "queued job panicked; tick processing aborted"
                        );
                    }
                }
                inner.loop_handle = None;
            }
        }
        self.shared.idle_tx.send_modify(|generation| *generation += 1);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrameTicker;

    fn test_clock() -> Arc<FrameTicker> {
        Arc::new(FrameTicker::new())
    }

    // -- Config validation ------------------------------------------------------

    #[test]
    fn default_config_is_valid() {
        assert!(PacerConfig::default().validate().is_ok());
        assert!(PacerConfig::unthrottled().validate().is_ok());
    }

    #[test]
    fn nan_target_rate_is_rejected() {
        let config = PacerConfig::with_target_rate(f64::NAN);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn infinite_target_rate_is_rejected() {
        let config = PacerConfig::with_target_rate(f64::INFINITY);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_target_rate_is_rejected() {
        let config = PacerConfig::with_target_rate(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = PacerConfig {
            window_ms: 0,
            ..PacerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    // -- Admission --------------------------------------------------------------

    fn tick(now_ms: u64, delta_ms: u64) -> Tick {
        Tick { now_ms, delta_ms }
    }

    #[test]
    fn admission_requires_rate_at_target() {
        let config = PacerConfig::with_target_rate(60.0);
        // Observed rate below target: defer.
        assert!(!admit(&config, 30.0, tick(100, 16), None));
        assert!(admit(&config, 60.0, tick(100, 16), None));
    }

    #[test]
    fn admission_rejects_slow_frames() {
        let config = PacerConfig::with_target_rate(60.0);
        // A 100ms frame gap exceeds the ~16.7ms target period.
        assert!(!admit(&config, 60.0, tick(100, 100), None));
    }

    #[test]
    fn admission_enforces_target_period_spacing() {
        let config = PacerConfig::with_target_rate(10.0);
        // Previous dequeue 50ms ago: below the 100ms period, defer.
        assert!(!admit(&config, 10.0, tick(150, 50), Some(100)));
        // Exactly one period since the previous dequeue: admit.
        assert!(admit(&config, 10.0, tick(200, 100), Some(100)));
    }

    #[test]
    fn admission_boundary_at_exact_target_cadence() {
        // A clock pacing exactly at the target rate admits every tick.
        let config = PacerConfig::with_target_rate(10.0);
        assert!(admit(&config, 10.0, tick(100, 100), None));
        assert!(admit(&config, 10.0, tick(200, 100), Some(100)));
    }

    // -- Construction -----------------------------------------------------------

    #[tokio::test]
    async fn new_pacer_starts_sleeping() {
        let pacer = Pacer::with_defaults(test_clock()).unwrap();
        assert_eq!(pacer.state(), PacerState::Sleeping);
        assert_eq!(pacer.queue_depth(), 0);
        assert!(pacer.is_enabled());
    }

    #[tokio::test]
    async fn invalid_config_fails_construction() {
        let result = Pacer::new(test_clock(), PacerConfig::with_target_rate(f64::NAN));
        assert!(result.is_err());
    }

    // -- Snapshots --------------------------------------------------------------

    #[tokio::test]
    async fn snapshot_serde_roundtrip() {
        let pacer = Pacer::with_defaults(test_clock()).unwrap();
        let snapshot = pacer.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: PacerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, PacerState::Sleeping);
        assert_eq!(back.queue_depth, 0);
        assert_eq!(back.metrics, snapshot.metrics);
    }
}
