//! The timing-wheel scheduler.
//!
//! [`WheelTimer`] owns four cascading wheels over the 48-bit tick space, an
//! expired list, `Q` run queues consumed by a fixed worker pool, and a tick
//! task that advances logical time from the wall clock. The public surface
//! is `new`/`start`/`shutdown`, the `add*`/`del*`/`reset` timer operations
//! and the tick/duration conversions.
//!
//! # Locking
//!
//! One operations lock guards the wheels, the expired list and the
//! add/del/reset data paths. Each run queue carries its own lock so
//! cancellation can race safely with dispatch. When both are needed the
//! operations lock is acquired first; the delete path instead *releases*
//! the operations lock before taking a queue lock and re-observes the
//! timer's packed state afterwards.

mod del;
mod expire;
mod workers;

#[cfg(test)]
mod tests;

pub use del::DelStatus;

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use parking_lot::Mutex;
use std::cell::Cell;
use tracing::{debug, error};

use crate::clock::{TimeSource, WallClock};
use crate::error::TimerError;
use crate::list::TimerList;
use crate::ticks::{Ticks, MAX_TICKS_DIFF, TICKS_MASK};
use crate::timer::{
    Timer, TimerDecision, FLAG_ACTIVE, FLAG_REMOVED, FLAG_RUNNING, INTERNAL_FLAGS, USER_FLAGS,
};
use crate::wheel::{
    wheel_pos, NO_IDX, TOTAL_ENTRIES, WHEELS, WHEEL_ENTRIES, WHEEL_EXPIRED, WHEEL_NONE,
    WHEEL_OFFSET, WHEEL_RUN_QUEUE,
};

/// Run queues used to spread dispatch and avoid lock contention.
pub(crate) const RUN_QUEUES: usize = 8;
/// Worker threads consuming the run queues.
pub(crate) const WORKERS: usize = 8;

/// Smallest accepted tick duration.
const MIN_TICK: Duration = Duration::from_micros(1);
/// Largest accepted tick duration.
const MAX_TICK: Duration = Duration::from_secs(24 * 60 * 60);

/// A hierarchical timing-wheel timer scheduler.
///
/// `WheelTimer` is a cheap clone of a shared handle; clones drive the same
/// scheduler. The lifecycle is construct → [`start`] → … → [`shutdown`].
///
/// Tick durations that are very low cause high idle CPU usage (the tick
/// task wakes on every tick even when no timer is armed): roughly, 100 ms
/// ticks are free, 10 ms ticks cost ~1% of a core and every halving from
/// 1 ms down roughly doubles the busy-work. Under load the tick duration
/// has little effect on throughput; pick the coarsest precision the
/// application tolerates, typically 10–100 ms.
///
/// [`start`]: WheelTimer::start
/// [`shutdown`]: WheelTimer::shutdown
#[derive(Clone)]
pub struct WheelTimer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelTimer")
            .field("tick", &self.inner.tick)
            .field("now", &self.now())
            .field(
                "rq_head",
                &self.inner.rq_head.load(Ordering::Relaxed),
            )
            .field(
                "rq_tail",
                &self.inner.rq_tail.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

pub(crate) struct Inner {
    /// Operations lock: wheels, expired list, add/del/reset paths.
    pub(crate) state: Mutex<WheelState>,
    pub(crate) run_queues: [Mutex<RunQueue>; RUN_QUEUES],
    /// Producer cursor over the run queues; never decremented.
    pub(crate) rq_head: AtomicU32,
    /// Consumer cursor; CAS-incremented by workers, always `<= rq_head`.
    pub(crate) rq_tail: AtomicU32,
    /// Current logical time; masked through [`Ticks::new`] on read.
    pub(crate) now_ticks: AtomicU64,
    pub(crate) tick: Duration,
    pub(crate) clock: Arc<dyn TimeSource>,
    /// Worker wake signals; overflow is harmless, workers re-poll.
    pub(crate) wake_tx: Sender<()>,
    pub(crate) wake_rx: Receiver<()>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
}

pub(crate) struct WheelState {
    /// All wheel slots, wheel-major (`WHEEL_OFFSET` indexes the wheels).
    pub(crate) wlists: Box<[TimerList]>,
    pub(crate) expired: TimerList,
    /// Entry whose callback currently runs inline on the tick task.
    pub(crate) running_main: Cell<Option<NonNull<Timer>>>,
    /// Wall-clock reference for expire computation.
    pub(crate) ref_ts: Cell<Duration>,
    /// Tick value at `ref_ts`.
    pub(crate) ref_ticks: Cell<Ticks>,
}

// SAFETY: the raw pointers inside are only dereferenced under the
// operations lock (see module docs).
unsafe impl Send for WheelState {}

pub(crate) struct RunQueue {
    pub(crate) lst: TimerList,
    /// Entry whose callback currently runs from this queue.
    pub(crate) running: Cell<Option<NonNull<Timer>>>,
}

// SAFETY: guarded by the queue's own mutex.
unsafe impl Send for RunQueue {}

#[derive(Default)]
pub(crate) struct Lifecycle {
    /// Dropping the sender closes the cancel channel; tasks observe the
    /// disconnect and exit.
    pub(crate) cancel_tx: Option<Sender<()>>,
    pub(crate) wait: Option<WaitGroup>,
}

impl WheelState {
    pub(crate) fn wheel_list(&self, wheel: u8, idx: u16) -> &TimerList {
        &self.wlists[WHEEL_OFFSET[wheel as usize] + idx as usize]
    }
}

impl WheelTimer {
    /// Creates a scheduler with the given tick duration, driven by the wall
    /// clock. Returns [`TimerError::InvalidParameters`] unless
    /// 1 µs ≤ `tick` ≤ 24 h.
    pub fn new(tick: Duration) -> Result<Self, TimerError> {
        Self::with_clock(tick, Arc::new(WallClock::new()))
    }

    /// Creates a scheduler sampling time from `clock` instead of the wall
    /// clock. Useful with [`crate::VirtualClock`] for deterministic tests.
    pub fn with_clock(tick: Duration, clock: Arc<dyn TimeSource>) -> Result<Self, TimerError> {
        if !(MIN_TICK..=MAX_TICK).contains(&tick) {
            error!(?tick, "tick duration out of range");
            return Err(TimerError::InvalidParameters);
        }

        let mut wlists = Vec::with_capacity(TOTAL_ENTRIES);
        for (w, &entries) in WHEEL_ENTRIES.iter().enumerate() {
            for idx in 0..entries {
                wlists.push(TimerList::new(w as u8, idx as u16));
            }
        }

        let (wake_tx, wake_rx) = bounded(WORKERS * 4);
        let now_ts = clock.now();
        let inner = Arc::new(Inner {
            state: Mutex::new(WheelState {
                wlists: wlists.into_boxed_slice(),
                expired: TimerList::new(WHEEL_EXPIRED, NO_IDX),
                running_main: Cell::new(None),
                ref_ts: Cell::new(now_ts),
                ref_ticks: Cell::new(Ticks::new(0)),
            }),
            run_queues: std::array::from_fn(|q| {
                Mutex::new(RunQueue {
                    lst: TimerList::new(WHEEL_RUN_QUEUE, q as u16),
                    running: Cell::new(None),
                })
            }),
            rq_head: AtomicU32::new(0),
            rq_tail: AtomicU32::new(0),
            now_ticks: AtomicU64::new(0),
            tick,
            clock,
            wake_tx,
            wake_rx,
            lifecycle: Mutex::new(Lifecycle::default()),
        });

        // The sentinel heads are self-referential; link them only now that
        // the state has reached its final address inside the Arc.
        {
            let state = inner.state.lock();
            for lst in state.wlists.iter() {
                lst.init_head();
            }
            state.expired.init_head();
        }
        for q in &inner.run_queues {
            q.lock().lst.init_head();
        }

        Ok(Self { inner })
    }

    /// The current scheduler time, in ticks.
    #[must_use]
    pub fn now(&self) -> Ticks {
        Ticks::new(self.inner.now_ticks.load(Ordering::Acquire))
    }

    pub(crate) fn inc_time(&self) {
        self.inner.now_ticks.fetch_add(1, Ordering::AcqRel);
    }

    /// The configured tick duration.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        self.inner.tick
    }

    /// Converts a duration to whole ticks (rounding down) plus the
    /// remainder that did not fit.
    #[must_use]
    pub fn ticks(&self, d: Duration) -> (Ticks, Duration) {
        let td = self.inner.tick.as_nanos();
        let n = d.as_nanos();
        // clamp: a quotient past the mask must read as out-of-range, not
        // wrap into a small modular value
        let t = u64::try_from(n / td).map_or(TICKS_MASK, |q| q.min(TICKS_MASK));
        (Ticks::new(t), Duration::from_nanos((n % td) as u64))
    }

    /// Converts a tick count to a duration.
    #[must_use]
    pub fn duration(&self, t: Ticks) -> Duration {
        let ns = u128::from(t.val()) * self.inner.tick.as_nanos();
        let secs = u64::try_from(ns / 1_000_000_000).unwrap_or(u64::MAX);
        Duration::new(secs, (ns % 1_000_000_000) as u32)
    }

    /// Converts a duration to ticks the way arm operations do internally:
    /// a sub-tick duration becomes one tick, and a remainder of half a tick
    /// or more rounds up. Expiring one tick late always beats expiring one
    /// tick early.
    #[must_use]
    pub fn ticks_round_up(&self, d: Duration) -> Ticks {
        let (dticks, rest) = self.ticks(d);
        if dticks.val() == 0 || rest >= self.inner.tick / 2 {
            dticks.add_u64(1)
        } else {
            dticks
        }
    }

    /// Prepares a timer entry for (re)use, clearing all state and applying
    /// the user `flags` ([`Timer::FAST`], [`Timer::SPAWN`]).
    ///
    /// Never call this on an armed timer or from inside the timer's own
    /// running callback; a fired timer that returned
    /// [`TimerDecision::Stop`], or one whose delete completed, is safe to
    /// re-initialise.
    pub fn init_timer(&self, tl: &Arc<Timer>, flags: u8) -> Result<(), TimerError> {
        if !tl.detached() {
            // still linked somewhere: armed or corrupted
            return Err(TimerError::Active);
        }
        // SAFETY: the entry is detached and, per the contract above, its
        // callback is not executing.
        unsafe { tl.reinit() };
        self.reset(tl, flags)
    }

    /// Allocates and initialises a fresh timer.
    ///
    /// The high-performance way to use timers is to embed the `Arc<Timer>`
    /// in an owning structure once and re-initialise it between uses rather
    /// than allocating per arm.
    pub fn new_timer(&self, flags: u8) -> Result<Arc<Timer>, TimerError> {
        let tl = Arc::new(Timer::new());
        self.init_timer(&tl, flags)?;
        Ok(tl)
    }

    /// Replaces the user-visible flags of a timer that is not armed.
    ///
    /// A timer that finished by returning [`TimerDecision::Stop`] cannot be
    /// reset; it must go through [`init_timer`](WheelTimer::init_timer).
    pub fn reset(&self, tl: &Arc<Timer>, flags: u8) -> Result<(), TimerError> {
        let f = tl.info.flags();
        if f & FLAG_ACTIVE != 0 && f & FLAG_REMOVED == 0 {
            return Err(TimerError::Active);
        }
        if !tl.links_null() {
            return Err(TimerError::Invalid);
        }
        tl.info
            .chg_flags(flags & USER_FLAGS, INTERNAL_FLAGS | USER_FLAGS);
        Ok(())
    }

    /// Arms `tl` to run `f` after `d` (rounded up to whole ticks).
    ///
    /// The entry must be initialised and not armed; a previously fired or
    /// removed entry needs [`init_timer`](WheelTimer::init_timer) (or
    /// [`reset`](WheelTimer::reset) after a completed delete) first.
    pub fn add<F>(&self, tl: &Arc<Timer>, d: Duration, f: F) -> Result<(), TimerError>
    where
        F: FnMut(&WheelTimer, &Arc<Timer>) -> TimerDecision + Send + 'static,
    {
        let (ticks, _) = self.ticks(d);
        if ticks.val() == 0 {
            // rounded up to one tick on placement; worth a diagnostic only
            debug!(timeout = ?d, "add with sub-tick timeout");
        }

        let state = self.inner.state.lock();
        self.add_sanity_checks(tl)?;
        // SAFETY: operations lock held, entry verified unarmed.
        unsafe { tl.set_callback(Box::new(f)) };
        tl.set_interval(d);

        tl.info.chg_flags(FLAG_ACTIVE, INTERNAL_FLAGS);
        let entry = EntryRef::acquire(tl);
        match self.add_unsafe(&state, entry.ptr(), self.now()) {
            Ok(()) => {
                entry.commit();
                Ok(())
            }
            Err(e) => {
                tl.info.set_flags(FLAG_REMOVED);
                Err(e)
            }
        }
    }

    /// Arms `tl` to run `f` after `delta` ticks.
    pub fn add_ticks<F>(&self, tl: &Arc<Timer>, delta: Ticks, f: F) -> Result<(), TimerError>
    where
        F: FnMut(&WheelTimer, &Arc<Timer>) -> TimerDecision + Send + 'static,
    {
        let d = self.duration(delta);
        self.add(tl, d, f)
    }

    /// Arms `tl` to run `f` at the absolute tick `expire`, without any
    /// rounding or latency adjustment. `expire` must lie within
    /// `MAX_TICKS_DIFF - 1` ticks of the current time.
    pub fn add_expire<F>(&self, tl: &Arc<Timer>, expire: Ticks, f: F) -> Result<(), TimerError>
    where
        F: FnMut(&WheelTimer, &Arc<Timer>) -> TimerDecision + Send + 'static,
    {
        let now = self.now();
        if expire.sub(now).val() > MAX_TICKS_DIFF - 1 {
            error!(expire = %expire, now = %now, "absolute expire out of range");
            return Err(TimerError::TicksTooHigh);
        }
        let intvl = self.duration(expire.sub(now));

        let state = self.inner.state.lock();
        self.add_sanity_checks(tl)?;
        // SAFETY: operations lock held, entry verified unarmed.
        unsafe { tl.set_callback(Box::new(f)) };
        tl.set_interval(intvl);
        tl.set_expire(expire);

        tl.info.chg_flags(FLAG_ACTIVE, INTERNAL_FLAGS);
        let (w, idx) = wheel_pos(expire, now);
        if w == WHEEL_EXPIRED {
            debug!(expire = %expire, now = %now, "timer added already expired");
        }
        let entry = EntryRef::acquire(tl);
        match self.append_entry(&state, entry.ptr(), w, idx) {
            Ok(()) => {
                entry.commit();
                Ok(())
            }
            Err(e) => {
                tl.info.set_flags(FLAG_REMOVED);
                Err(e)
            }
        }
    }

    /// Validates an entry about to be armed. Must be called under the
    /// operations lock.
    fn add_sanity_checks(&self, tl: &Arc<Timer>) -> Result<(), TimerError> {
        let flags = tl.info.flags();
        if flags & FLAG_ACTIVE != 0 {
            let (f, w, idx) = tl.info.get_all();
            debug!(flags = f, wheel = w, idx, "add on active timer");
            return Err(TimerError::Active);
        }
        if flags & FLAG_RUNNING != 0 {
            debug!(flags, "add on running timer");
            return Err(TimerError::NotReset);
        }
        if flags & FLAG_REMOVED != 0 {
            debug!(flags, "add on removed, not re-initialised timer");
            return Err(TimerError::NotReset);
        }
        if !tl.links_null() {
            error!(flags, "add on linked timer");
            return Err(TimerError::Invalid);
        }
        let (w, idx) = tl.info.wheel_pos();
        if w != WHEEL_NONE || idx != NO_IDX {
            error!(wheel = w, idx, "add on timer with stale wheel tag");
            return Err(TimerError::Invalid);
        }
        Ok(())
    }

    /// Computes the expire tick for an entry being (re)armed and places it.
    ///
    /// The expire is derived from the wall-clock reference, not from the
    /// tick counter: with small ticks, scheduling latency can make the
    /// counter jump by many ticks right after `add` samples it, which would
    /// fire the timer early. Anchoring to the reference timestamp means
    /// latency can only delay timers that were already due during the
    /// stalled interval. Must be called under the operations lock.
    pub(crate) fn add_unsafe(
        &self,
        state: &WheelState,
        t: NonNull<Timer>,
        now: Ticks,
    ) -> Result<(), TimerError> {
        // SAFETY: the scheduler owns a reference to the entry; the
        // operations lock is held.
        let tr = unsafe { t.as_ref() };
        let (delta, _) = self.ticks(tr.interval());
        if delta.val() > MAX_TICKS_DIFF {
            error!(delta = %delta, interval = ?tr.interval(), "interval out of tick range");
            return Err(TimerError::TicksTooHigh);
        }
        let elapsed = self
            .inner
            .clock
            .now()
            .saturating_sub(state.ref_ts.get())
            .saturating_add(tr.interval());
        // round up: a zero-tick expire would never leave the expired list,
        // re-running on every tick
        let dticks = self.ticks_round_up(elapsed);
        if dticks.val() > MAX_TICKS_DIFF - 1 {
            error!(delta = %dticks, "adjusted expire out of tick range");
            return Err(TimerError::TicksTooHigh);
        }
        tr.set_expire(state.ref_ticks.get().add(dticks));

        let (w, idx) = wheel_pos(tr.expire_ticks(), now);
        if w == WHEEL_EXPIRED {
            debug!(expire = %tr.expire_ticks(), now = %now, "timer placed directly on expired list");
        }
        self.append_entry(state, t, w, idx)
    }

    /// Links a detached entry onto the given wheel slot or the expired
    /// list. Must be called under the operations lock.
    pub(crate) fn append_entry(
        &self,
        state: &WheelState,
        t: NonNull<Timer>,
        wheel: u8,
        idx: u16,
    ) -> Result<(), TimerError> {
        if (wheel as usize) < WHEELS {
            // SAFETY: operations lock held, entry detached.
            unsafe { state.wheel_list(wheel, idx).append(t) };
            Ok(())
        } else if wheel == WHEEL_EXPIRED {
            // SAFETY: as above.
            unsafe { state.expired.append(t) };
            Ok(())
        } else {
            error!(wheel, idx, "invalid wheel for placement");
            debug_assert!(false, "invalid wheel {wheel}/{idx}");
            Err(TimerError::Invalid)
        }
    }

    /// Runs the entry's callback. Call with no scheduler lock held and the
    /// `RUNNING` flag set on the entry.
    pub(crate) fn invoke_callback(&self, t: NonNull<Timer>) -> TimerDecision {
        // Reconstitute a borrowed handle from the scheduler's counted
        // reference without disturbing the count.
        // SAFETY: the pointer came from `Arc::into_raw`; ManuallyDrop keeps
        // the count untouched.
        let handle = ManuallyDrop::new(unsafe { Arc::from_raw(t.as_ptr().cast_const()) });
        // SAFETY: RUNNING grants exclusive access to the callback slot.
        let slot = unsafe { &mut *handle.callback_slot() };
        match slot.as_mut() {
            Some(f) => f(self, &handle),
            None => {
                error!("armed timer fired without a callback");
                debug_assert!(false, "armed timer without callback");
                TimerDecision::Stop
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Entries still linked hold one counted reference each; unlink and
        // release them so armed-at-drop timers are not leaked.
        let state = self.state.get_mut();
        for lst in state.wlists.iter() {
            // SAFETY: exclusive access through `&mut self`.
            unsafe { release_list(lst) };
        }
        // SAFETY: as above.
        unsafe { release_list(&state.expired) };
        for q in &mut self.run_queues {
            // SAFETY: as above.
            unsafe { release_list(&q.get_mut().lst) };
        }
    }
}

/// Unlinks every entry of `lst`, marks it removed and drops the
/// scheduler's reference.
///
/// # Safety
///
/// The caller must have exclusive access to the list and its entries.
unsafe fn release_list(lst: &TimerList) {
    while let Some(t) = lst.first() {
        lst.remove(t);
        let tr = t.as_ref();
        tr.clear_links();
        tr.info.set_flags(FLAG_REMOVED);
        release_entry(t);
    }
}

/// Drops the scheduler's counted reference to an entry.
///
/// # Safety
///
/// `t` must carry a reference obtained through [`EntryRef::commit`] (or the
/// re-arm path) that has not been released yet; after this call the
/// scheduler must not touch the entry.
pub(crate) unsafe fn release_entry(t: NonNull<Timer>) {
    drop(Arc::from_raw(t.as_ptr().cast_const()));
}

/// A counted reference being transferred to the scheduler.
///
/// Dropping it without [`commit`](EntryRef::commit) returns the reference
/// to the caller (used when placement fails).
pub(crate) struct EntryRef {
    raw: *const Timer,
    committed: bool,
}

impl EntryRef {
    pub(crate) fn acquire(tl: &Arc<Timer>) -> Self {
        Self {
            raw: Arc::into_raw(Arc::clone(tl)),
            committed: false,
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<Timer> {
        // SAFETY: Arc::into_raw never returns null.
        unsafe { NonNull::new_unchecked(self.raw.cast_mut()) }
    }

    /// Leaves the reference with the scheduler.
    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        if !self.committed {
            // SAFETY: `raw` came from Arc::into_raw and was not committed.
            unsafe { drop(Arc::from_raw(self.raw)) };
        }
    }
}
