//! Clock source contract and the `FrameTicker` fan-out hub.
//!
//! A clock source is anything that emits a repeating notification carrying
//! the elapsed time since the previous notification — a rendered frame, a
//! physics step, or a synthetic test clock. Subscribers receive every tick
//! emitted while their subscription is live; dropping the [`TickStream`]
//! cancels the subscription, and re-subscribing later is always allowed.
//!
//! The concrete [`FrameTicker`] keeps a millisecond origin and broadcasts
//! ticks to all live subscriptions. It can be stepped by hand (tests, hosts
//! that own their own frame loop) or driven at a fixed cadence by
//! [`FrameTicker::spawn_driver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

/// Buffered ticks per subscription before a slow subscriber starts lagging.
const TICK_CHANNEL_CAPACITY: usize = 64;

/// One notification from a clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Clock time at this notification (milliseconds since the clock origin).
    pub now_ms: u64,
    /// Elapsed time since the previous notification.
    pub delta_ms: u64,
}

/// A repeating elapsed-time notification source.
///
/// Subscriptions are cheap and repeatable: one subscriber may subscribe,
/// drop the stream, and subscribe again any number of times within the
/// lifetime of the source.
pub trait ClockSource: Send + Sync {
    /// Open a new subscription delivering every tick from now on.
    fn subscribe(&self) -> TickStream;

    /// Current clock time in milliseconds since the clock origin.
    fn now_ms(&self) -> u64;
}

/// A live, cancellable tick subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct TickStream {
    rx: broadcast::Receiver<Tick>,
}

impl TickStream {
    /// Receive the next tick.
    ///
    /// A subscriber that falls behind the channel capacity skips the missed
    /// ticks and resumes with the next live one; ticks carry absolute clock
    /// time, so skipping is safe for rate estimation.
    pub async fn recv(&mut self) -> Result<Tick> {
        loop {
            match self.rx.recv().await {
                Ok(tick) => return Ok(tick),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "tick subscriber lagged; skipping missed ticks");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ClockClosed),
            }
        }
    }
}

/// A steppable frame clock that fans ticks out to all subscribers.
///
/// # Example
///
/// ```ignore
/// let ticker = Arc::new(FrameTicker::new());
/// let mut ticks = ticker.subscribe();
/// ticker.step(16);
/// let tick = ticks.recv().await?; // Tick { now_ms: 16, delta_ms: 16 }
/// ```
#[derive(Debug)]
pub struct FrameTicker {
    now_ms: AtomicU64,
    tx: broadcast::Sender<Tick>,
}

impl Default for FrameTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTicker {
    /// Create a ticker with its origin at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_origin_ms(0)
    }

    /// Create a ticker whose clock starts at `origin_ms`.
    #[must_use]
    pub fn with_origin_ms(origin_ms: u64) -> Self {
        let (tx, _rx) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            now_ms: AtomicU64::new(origin_ms),
            tx,
        }
    }

    /// Advance the clock by `delta_ms` and notify all live subscriptions.
    ///
    /// Returns the tick that was delivered. Emitting with no subscribers is
    /// not an error; the tick simply advances the clock.
    pub fn step(&self, delta_ms: u64) -> Tick {
        let now_ms = self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms;
        let tick = Tick { now_ms, delta_ms };
        let _ = self.tx.send(tick);
        tick
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Drive the ticker at a fixed cadence until the returned handle is
    /// aborted or the ticker is dropped by every other holder.
    ///
    /// Each interval elapse steps the clock by `period_ms`. Under
    /// `tokio::time::pause` the cadence is deterministic.
    pub fn spawn_driver(self: Arc<Self>, period_ms: u64) -> JoinHandle<()> {
        let ticker = self;
        let period = Duration::from_millis(period_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first interval tick completes immediately; skip it so the
            // clock only advances after a full period has elapsed.
            interval.tick().await;
            loop {
                interval.tick().await;
                ticker.step(period_ms.max(1));
            }
        })
    }
}

impl ClockSource for FrameTicker {
    fn subscribe(&self) -> TickStream {
        TickStream {
            rx: self.tx.subscribe(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
