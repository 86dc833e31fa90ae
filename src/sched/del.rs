//! Timer cancellation.
//!
//! Deleting a timer that may concurrently be running its callback is the
//! hard core of the scheduler. The protocol is observe-then-act: read the
//! packed `(flags, wheel, idx)` triple under the operations lock, then act
//! on the wheel code, and re-observe whenever a lock had to be dropped on
//! the way to the one that owns the entry.
//!
//! The narrow windows:
//!
//! - `wheel == NONE` can mean "already removed" *or* "a worker just pulled
//!   the entry off a run queue and is about to run it". Workers set
//!   `RUNNING` before the entry leaves the queue, so re-reading the flags
//!   under the operations lock disambiguates.
//! - `wheel == RUN_QUEUE` entries are guarded by that queue's lock, which
//!   must be taken *after* releasing the operations lock; the wheel code is
//!   re-read afterwards and the whole observation restarts if it moved.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{release_entry, WheelTimer, RUN_QUEUES};
use crate::error::TimerError;
use crate::timer::{Timer, FLAG_ACTIVE, FLAG_DELETE, FLAG_REMOVED, FLAG_RUNNING};
use crate::wheel::{WHEELS, WHEEL_EXPIRED, WHEEL_NONE, WHEEL_RUN_QUEUE};

/// Outcome of a successful delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelStatus {
    /// The timer was physically unlinked; it is safe to re-initialise.
    Removed,
    /// The callback is currently running. [`WheelTimer::del`] latched the
    /// delete (any rearm is suppressed and the entry is discarded when the
    /// callback returns); [`WheelTimer::del_try`] left the timer alone.
    Running,
}

/// Internal delete modes.
const DEL_ALREADY_OK: u8 = 1 << 1;
/// Tolerate observing delete-marked/removed states without reporting them
/// (used by the `del_wait` retry loop).
const DEL_RACE_OK: u8 = 1 << 2;
const DEL_FORCE: u8 = 1 << 3;
/// Only remove if not running; never latch the delete flag.
const DEL_TRY: u8 = 1 << 4;

impl WheelTimer {
    /// Removes the timer, or, if its callback is currently running,
    /// latches a delete so the callback's rearm request is suppressed and
    /// the entry is discarded when it returns.
    ///
    /// Returns [`DelStatus::Removed`] when the entry was unlinked now,
    /// [`DelStatus::Running`] when the removal was latched. Repeated
    /// deletes report [`TimerError::Deleted`] or
    /// [`TimerError::AlreadyRemoved`]; neither is worth retrying.
    pub fn del(&self, tl: &Arc<Timer>) -> Result<DelStatus, TimerError> {
        self.del_mode(tl, 0)
    }

    /// Like [`del`](WheelTimer::del), but never latches: a timer whose
    /// callback is running is left untouched and free to rearm itself.
    pub fn del_try(&self, tl: &Arc<Timer>) -> Result<DelStatus, TimerError> {
        self.del_mode(tl, DEL_TRY)
    }

    fn del_mode(&self, tl: &Arc<Timer>, del_f: u8) -> Result<DelStatus, TimerError> {
        match self.del_inner(tl, del_f) {
            (_, Some(e)) => Err(e),
            (true, None) => Ok(DelStatus::Removed),
            (false, None) => Ok(DelStatus::Running),
        }
    }

    /// Removes the timer, busy-waiting for its callback to finish if one is
    /// in flight. The wait target is at most one callback duration, so the
    /// loop yields instead of parking.
    ///
    /// Must not be called from inside the timer's own callback (it would
    /// wait on itself forever). Timers armed with [`Timer::SPAWN`] cannot
    /// be waited on: for those the call reports [`DelStatus::Running`]
    /// immediately after latching the delete.
    pub fn del_wait(&self, tl: &Arc<Timer>) -> Result<DelStatus, TimerError> {
        let ptr = NonNull::from(&**tl);
        loop {
            match self.del_inner(tl, DEL_RACE_OK) {
                (false, None) => {
                    let flags = tl.info.flags();
                    if flags & Timer::SPAWN != 0 {
                        // no running-context tracking for spawned callbacks
                        return Ok(DelStatus::Running);
                    }
                    if flags & FLAG_RUNNING != 0 {
                        if self.reap_if_callback_returned(tl, ptr) {
                            return Ok(DelStatus::Removed);
                        }
                        std::thread::yield_now();
                    }
                }
                (true, Some(TimerError::AlreadyRemoved)) => return Ok(DelStatus::Removed),
                (_, Some(e)) => return Err(e),
                (removed, None) => {
                    return Ok(if removed {
                        DelStatus::Removed
                    } else {
                        DelStatus::Running
                    })
                }
            }
        }
    }

    /// A timer can stay marked `RUNNING` after its callback returned
    /// [`TimerDecision::Stop`]: the dispatcher stops touching the entry the
    /// moment the callback finishes. Detect that case by checking whether
    /// the list the callback was launched from still advertises this entry
    /// as its current runner; if not, mark it removed ourselves.
    ///
    /// [`TimerDecision::Stop`]: crate::TimerDecision::Stop
    fn reap_if_callback_returned(&self, tl: &Arc<Timer>, ptr: NonNull<Timer>) -> bool {
        let (rwheel, ridx) = tl.rctx.wheel_pos();
        if rwheel == WHEEL_EXPIRED {
            let state = self.inner.state.lock();
            let flags2 = tl.info.flags();
            let rctx2 = tl.rctx.wheel_pos();
            if rctx2 == (rwheel, ridx)
                && state.running_main.get() != Some(ptr)
                && flags2 & FLAG_RUNNING != 0
            {
                drop(state);
                tl.info.set_flags(FLAG_REMOVED);
                return true;
            }
        } else if rwheel == WHEEL_RUN_QUEUE {
            if ridx as usize >= RUN_QUEUES {
                debug_assert!(false, "running context names queue {ridx}");
                return false;
            }
            let q = self.inner.run_queues[ridx as usize].lock();
            let flags2 = tl.info.flags();
            let rctx2 = tl.rctx.wheel_pos();
            if rctx2 == (rwheel, ridx)
                && q.running.get() != Some(ptr)
                && flags2 & FLAG_RUNNING != 0
            {
                drop(q);
                tl.info.set_flags(FLAG_REMOVED);
                return true;
            }
        }
        false
    }

    /// The observe-then-act loop shared by every delete flavour.
    ///
    /// Returns `(removed, error)`: `(true, None)` unlinked now,
    /// `(false, None)` callback running (latched unless `DEL_TRY`), and on
    /// errors the boolean tells the caller whether retrying is pointless.
    fn del_inner(&self, tl: &Arc<Timer>, del_f: u8) -> (bool, Option<TimerError>) {
        let ptr = NonNull::from(&**tl);
        loop {
            let state = self.inner.state.lock();
            // flags and wheel must be read as one coherent triple; both can
            // change while the operations lock is held (from a queue lock)
            let (flags, wheel, idx) = tl.info.get_all();

            if flags & (FLAG_ACTIVE | FLAG_DELETE) != FLAG_ACTIVE {
                if flags & FLAG_ACTIVE == 0 {
                    drop(state);
                    debug!(flags, "del on inactive/un-initialised timer");
                    return (true, Some(TimerError::Inactive));
                }
                // active but already delete-marked
                if del_f & (DEL_RACE_OK | DEL_FORCE) == 0 {
                    drop(state);
                    if del_f & DEL_ALREADY_OK != 0 {
                        return (flags & FLAG_REMOVED != 0, None);
                    }
                    debug!(flags, "del on already delete-marked timer");
                    return (flags & FLAG_REMOVED != 0, Some(TimerError::Deleted));
                }
            }

            if wheel == WHEEL_NONE {
                // a worker may sit in the window between unlinking from a
                // run queue and invoking the callback; RUNNING is set
                // before the unlink, so a fresh read decides
                if tl.info.flags() & FLAG_RUNNING != 0 {
                    if del_f & DEL_TRY == 0 {
                        tl.info.set_flags(FLAG_DELETE);
                    }
                    drop(state);
                    return (false, None);
                }
                drop(state);
                if del_f & (DEL_RACE_OK | DEL_FORCE) == 0 {
                    warn!(flags, "del on already removed timer");
                }
                if flags & FLAG_REMOVED == 0 {
                    // two parallel deletes can leave a small window where
                    // REMOVED is not yet visible; report, don't die
                    error!(flags, "timer off all lists but not marked removed");
                }
                return (true, Some(TimerError::AlreadyRemoved));
            }

            if flags & FLAG_REMOVED != 0 {
                drop(state);
                error!(flags, wheel, idx, "removed timer still on a wheel");
                debug_assert!(false, "removed timer on wheel {wheel}/{idx}");
                return (true, Some(TimerError::Invalid));
            }
            if wheel != WHEEL_RUN_QUEUE && tl.detached() {
                drop(state);
                error!(wheel, idx, "linked wheel tag on detached timer");
                debug_assert!(false, "detached timer tagged {wheel}/{idx}");
                return (true, Some(TimerError::Invalid));
            }

            if (wheel as usize) < WHEELS {
                // on a wheel: not expired, not running
                // SAFETY: operations lock held; the tag named this list.
                unsafe {
                    state.wheel_list(wheel, idx).remove(ptr);
                    tl.clear_links();
                }
                tl.info.set_flags(FLAG_REMOVED);
                drop(state);
                // SAFETY: the scheduler's reference follows the unlink.
                unsafe { release_entry(ptr) };
                return (true, None);
            }

            if wheel == WHEEL_EXPIRED {
                // expired-list membership and flags only change under the
                // operations lock, so RUNNING cannot be set here
                if tl.info.flags() & FLAG_RUNNING == 0 {
                    // SAFETY: operations lock held; the tag named this list.
                    unsafe {
                        state.expired.remove(ptr);
                        tl.clear_links();
                    }
                    tl.info.set_flags(FLAG_REMOVED);
                    drop(state);
                    // SAFETY: as above.
                    unsafe { release_entry(ptr) };
                    return (true, None);
                }
                error!("running timer still tagged expired");
                debug_assert!(false, "running timer on the expired list");
                if del_f & DEL_TRY == 0 {
                    tl.info.set_flags(FLAG_DELETE);
                }
                drop(state);
                return (false, None);
            }

            if wheel == WHEEL_RUN_QUEUE {
                if idx as usize >= RUN_QUEUES {
                    drop(state);
                    error!(idx, "run-queue tag out of range");
                    debug_assert!(false, "run-queue index {idx}");
                    return (true, Some(TimerError::Invalid));
                }
                // the queue lock must be taken after the operations lock is
                // released (workers take them in that order too)
                drop(state);
                let q = self.inner.run_queues[idx as usize].lock();
                let (wheel2, idx2) = tl.info.wheel_pos();
                if wheel2 != wheel || idx2 != idx {
                    drop(q);
                    continue; // moved under us: restart the observation
                }
                if tl.info.flags() & FLAG_RUNNING == 0 {
                    // SAFETY: queue lock held; the tag named this queue.
                    unsafe {
                        q.lst.remove(ptr);
                        tl.clear_links();
                    }
                    tl.info.set_flags(FLAG_REMOVED);
                    drop(q);
                    // SAFETY: as above.
                    unsafe { release_entry(ptr) };
                    return (true, None);
                }
                // claimed by a worker; the flag is latched under this
                // queue's lock so the worker's post-callback check sees it
                if del_f & DEL_TRY == 0 {
                    tl.info.set_flags(FLAG_DELETE);
                }
                drop(q);
                return (false, None);
            }

            drop(state);
            error!(wheel, idx, "unknown wheel code");
            debug_assert!(false, "unknown wheel code {wheel}");
            return (true, Some(TimerError::Invalid));
        }
    }
}
