//! Timer entries and callback types.
//!
//! A [`Timer`] is the per-timer record the scheduler links onto its wheels:
//! a pair of intrusive list links, the absolute expiration tick, the
//! configured interval, two packed atomic state words and the boxed user
//! callback. Users hold timers as `Arc<Timer>`, embedded in their own
//! structures or created through the scheduler, and the scheduler keeps
//! exactly one additional strong reference per armed entry.
//!
//! # Locking discipline
//!
//! The link cells and the callback slot are not atomic. They are only ever
//! touched while holding the lock that owns the entry's current list (the
//! operations lock for wheels and the expired list, the per-queue lock for
//! run queues), or, for the callback, while the `RUNNING` flag grants
//! exclusive access. The `Sync` impl below relies on that discipline.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::info::PackedInfo;
use crate::sched::WheelTimer;
use crate::ticks::Ticks;
use crate::wheel::{NO_IDX, WHEEL_NONE};

/// List-head sentinel marker.
pub(crate) const FLAG_HEAD: u8 = 1;
/// The timer is armed.
pub(crate) const FLAG_ACTIVE: u8 = 2;
/// The timer was delete-marked while its callback was running.
pub(crate) const FLAG_DELETE: u8 = 4;
/// The timer callback is executing.
pub(crate) const FLAG_RUNNING: u8 = 8;
/// The timer has been taken off all lists.
pub(crate) const FLAG_REMOVED: u8 = 16;
/// All flags reserved for the scheduler; users must never set these.
pub(crate) const INTERNAL_FLAGS: u8 =
    FLAG_HEAD | FLAG_ACTIVE | FLAG_DELETE | FLAG_RUNNING | FLAG_REMOVED;
/// All user-settable flags.
pub(crate) const USER_FLAGS: u8 = Timer::FAST | Timer::SPAWN;

/// What the scheduler should do with a timer after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDecision {
    /// Finish the timer. The scheduler drops its reference immediately and
    /// never touches the entry again; re-initialise it before reuse.
    Stop,
    /// Re-arm with the originally configured interval.
    Periodic,
    /// Re-arm with a new interval (rounded up to whole ticks on placement).
    After(Duration),
}

/// The timer callback.
///
/// Invoked with the owning scheduler and the expired timer's handle; the
/// returned [`TimerDecision`] controls re-arming. From inside the callback
/// the only scheduler operation permitted on the *running* timer itself is
/// [`WheelTimer::del`]: `add`/`reset` fail harmlessly, `del_try` reports the
/// timer as running, and `del_wait` would deadlock waiting on itself.
pub(crate) type BoxedCallback =
    Box<dyn FnMut(&WheelTimer, &Arc<Timer>) -> TimerDecision + Send + 'static>;

/// A timer entry.
///
/// Create one with [`Timer::new`] (or [`WheelTimer::new_timer`]), arm it
/// with one of the `add` operations, and cancel it with one of the `del`
/// operations. A timer that fired without re-arming, or whose delete was
/// latched while it ran, must pass through [`WheelTimer::init_timer`]
/// before it can be armed again.
pub struct Timer {
    next: Cell<Option<NonNull<Timer>>>,
    prev: Cell<Option<NonNull<Timer>>>,
    /// Absolute expiration, in ticks.
    expire: AtomicU64,
    /// Configured relative interval, in nanoseconds.
    interval_ns: AtomicU64,
    /// Flags plus current wheel/slot.
    pub(crate) info: PackedInfo,
    /// Wheel/queue the callback is currently running from (`del_wait`).
    pub(crate) rctx: PackedInfo,
    callback: std::cell::UnsafeCell<Option<BoxedCallback>>,
}

// SAFETY: the non-atomic fields (links, callback slot) follow the locking
// discipline in the module docs; everything else is atomic.
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// Run the callback inline on the tick task. The callback must be fast
    /// and must never block: it delays every other timer.
    pub const FAST: u8 = 32;
    /// Run the callback on its own ephemeral thread. Such timers cannot be
    /// waited on with [`WheelTimer::del_wait`].
    pub const SPAWN: u8 = 64;

    /// Creates a fresh, detached, flagless timer entry.
    #[must_use]
    pub fn new() -> Self {
        let t = Self {
            next: Cell::new(None),
            prev: Cell::new(None),
            expire: AtomicU64::new(0),
            interval_ns: AtomicU64::new(0),
            info: PackedInfo::new(),
            rctx: PackedInfo::new(),
            callback: std::cell::UnsafeCell::new(None),
        };
        t.info.set_wheel(WHEEL_NONE, NO_IDX);
        t.rctx.set_wheel(WHEEL_NONE, NO_IDX);
        t
    }

    /// Returns `true` if this entry is not linked on any list.
    ///
    /// Detached entries are either self-linked (just removed) or have null
    /// links (never linked, or fully re-initialised).
    #[must_use]
    pub fn detached(&self) -> bool {
        let this = NonNull::from(self);
        match (self.next.get(), self.prev.get()) {
            (None, None) => true,
            (Some(n), _) => n == this,
            _ => false,
        }
    }

    /// The absolute expiration tick set by the last arm operation.
    #[must_use]
    pub fn expire_ticks(&self) -> Ticks {
        Ticks::new(self.expire.load(Ordering::Acquire))
    }

    /// The configured relative interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns.load(Ordering::Acquire))
    }

    pub(crate) fn set_expire(&self, t: Ticks) {
        self.expire.store(t.val(), Ordering::Release);
    }

    pub(crate) fn set_interval(&self, d: Duration) {
        let ns = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.interval_ns.store(ns, Ordering::Release);
    }

    pub(crate) fn next_link(&self) -> Option<NonNull<Timer>> {
        self.next.get()
    }

    pub(crate) fn prev_link(&self) -> Option<NonNull<Timer>> {
        self.prev.get()
    }

    pub(crate) fn set_next(&self, p: Option<NonNull<Timer>>) {
        self.next.set(p);
    }

    pub(crate) fn set_prev(&self, p: Option<NonNull<Timer>>) {
        self.prev.set(p);
    }

    /// Marks the entry as detached by linking it to itself.
    pub(crate) fn self_link(&self) {
        let this = Some(NonNull::from(self));
        self.next.set(this);
        self.prev.set(this);
    }

    /// Nulls both links of a just-removed entry.
    pub(crate) fn clear_links(&self) {
        self.next.set(None);
        self.prev.set(None);
    }

    /// Returns `true` if both links are null (required by `reset`).
    pub(crate) fn links_null(&self) -> bool {
        self.next.get().is_none() && self.prev.get().is_none()
    }

    /// Installs the user callback.
    ///
    /// # Safety
    ///
    /// The caller must hold the operations lock and the entry must not be
    /// armed or running.
    pub(crate) unsafe fn set_callback(&self, cb: BoxedCallback) {
        *self.callback.get() = Some(cb);
    }

    /// Returns the raw callback slot for invocation.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to the slot: either the
    /// `RUNNING` flag for this entry, or the reinitialisation contract of
    /// `init_timer`.
    pub(crate) unsafe fn callback_slot(&self) -> *mut Option<BoxedCallback> {
        self.callback.get()
    }

    /// Resets the entry to the fresh state: null links, no flags, no wheel,
    /// no callback.
    ///
    /// # Safety
    ///
    /// Per the `init_timer` contract the entry must not be linked anywhere
    /// and its callback must not be executing.
    pub(crate) unsafe fn reinit(&self) {
        self.clear_links();
        self.expire.store(0, Ordering::Release);
        self.interval_ns.store(0, Ordering::Release);
        self.info.set_all(0, WHEEL_NONE, NO_IDX);
        self.rctx.set_all(0, WHEEL_NONE, NO_IDX);
        *self.callback.get() = None;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("next", &self.next.get().map(NonNull::as_ptr))
            .field("prev", &self.prev.get().map(NonNull::as_ptr))
            .field("expire", &self.expire_ticks())
            .field("interval", &self.interval())
            .field("info", &self.info)
            .field("rctx", &self.rctx)
            .finish_non_exhaustive()
    }
}
