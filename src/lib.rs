//! Tickwheel: a hierarchical timing-wheel timer facility.
//!
//! # Overview
//!
//! Tickwheel manages very large timer populations (100k+ armed timers) at
//! tick granularity (typically 10-100 ms) with O(1) amortised insertion
//! and expiration. Four cascading wheels (Varghese & Lauck) partition a
//! 48-bit wrap-safe tick space; entries live on intrusive lists threaded
//! through the timers themselves, so arming a timer allocates nothing
//! beyond the entry the user already holds.
//!
//! # Core guarantees
//!
//! - **Approximate, never early**: expirations are computed against a
//!   wall-clock reference and rounded up to whole ticks; scheduling latency
//!   can delay a timer but never fire it before its real deadline.
//! - **Safe cancellation**: a timer can be deleted while its callback runs
//!   on another thread: the delete is latched, any rearm suppressed, and
//!   [`WheelTimer::del_wait`] can busy-wait for the callback to finish.
//! - **Bounded dispatch**: expired entries fan out over run queues drained
//!   by a fixed worker pool; [`Timer::FAST`] callbacks run inline on the
//!   tick task and [`Timer::SPAWN`] callbacks get an ephemeral thread.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::{TimerDecision, WheelTimer};
//!
//! # fn main() -> Result<(), tickwheel::TimerError> {
//! let wt = WheelTimer::new(Duration::from_millis(10))?;
//! wt.start();
//!
//! let tick = wt.new_timer(0)?;
//! wt.add(&tick, Duration::from_millis(250), |_, _| {
//!     println!("tick");
//!     TimerDecision::Periodic
//! })?;
//!
//! std::thread::sleep(Duration::from_secs(1));
//! wt.del(&tick)?;
//! wt.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Module structure
//!
//! - [`ticks`]: wrap-safe logical time
//! - [`clock`]: pluggable time sources (wall clock, virtual test clock)
//! - [`error`]: the error taxonomy
//! - `timer` / `sched` (re-exported at the root): timer entries and the
//!   wheel scheduler

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod clock;
pub mod error;
pub mod ticks;

mod info;
mod list;
mod sched;
mod timer;
mod wheel;

pub use clock::{TimeSource, VirtualClock, WallClock};
pub use error::TimerError;
pub use sched::{DelStatus, WheelTimer};
pub use ticks::{Ticks, MAX_TICKS_DIFF, TICKS_BITS, TICKS_MASK};
pub use timer::{Timer, TimerDecision};
