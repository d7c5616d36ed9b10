//! framepacer: frame-governed cooperative task pacing.
//!
//! This crate provides a rate-governed work queue for per-frame update loops:
//! queued jobs drain one per clock tick, throttled against the *observed*
//! frame rate rather than an assumed nominal one.
//!
//! # Architecture
//!
//! ```text
//! FrameTicker (clock source) ──ticks──► Pacer run loop
//!                                          │
//!                                 RateWindow (trailing window)
//!                                          │
//!                                 admission decision ──► pop one job
//! ```
//!
//! # Modules
//!
//! - `clock`: clock source contract and the `FrameTicker` fan-out hub
//! - `rate`: sliding-window throughput estimator
//! - `pacer`: the rate-governed task pacer and its lifecycle
//! - `registry`: keyed connection bookkeeping for bulk fire/disconnect
//! - `launch`: fire-and-forget helpers with panic isolation
//! - `logging`: tracing subscriber setup
//! - `error`: crate error taxonomy
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod launch;
pub mod logging;
pub mod pacer;
pub mod rate;
pub mod registry;

pub use clock::{ClockSource, FrameTicker, Tick, TickStream};
pub use error::{Error, Result};
pub use pacer::{Pacer, PacerConfig, PacerMetrics, PacerSnapshot, PacerState};
pub use rate::RateWindow;
pub use registry::{ConnectionId, KeyedConnections};
