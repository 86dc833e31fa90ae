//! Error types for timer operations.
//!
//! Every public operation reports failures synchronously through
//! [`TimerError`]; the scheduler itself never panics on a user error.
//! Impossible internal states (corrupted links, wheel-tag mismatches) are
//! treated as fatal bugs in debug builds instead.

use thiserror::Error;

/// The error kinds returned by timer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TimerError {
    /// The operation requires an armed timer.
    #[error("called on inactive timer")]
    Inactive,
    /// The timer finished or was removed and must be re-initialised before
    /// it can be armed again.
    #[error("called on not reset/init timer")]
    NotReset,
    /// The operation would clobber a live timer.
    #[error("called on active timer")]
    Active,
    /// The timer callback is currently executing.
    #[error("called on running timer")]
    Running,
    /// The timer is already marked for deletion.
    #[error("called on already delete-marked timer")]
    Deleted,
    /// The timer is already physically off all lists.
    #[error("called on already removed timer")]
    AlreadyRemoved,
    /// The timer links or wheel tag are structurally corrupted.
    #[error("called on invalid timer handle")]
    Invalid,
    /// The requested tick delta exceeds the addressable range.
    #[error("ticks delta too high")]
    TicksTooHigh,
    /// The duration is smaller than one tick. Operations round up instead of
    /// returning this; it exists for diagnostics.
    #[error("duration smaller than tick")]
    DurationTooSmall,
    /// Out-of-range configuration or invalid arguments.
    #[error("invalid parameters")]
    InvalidParameters,
}
