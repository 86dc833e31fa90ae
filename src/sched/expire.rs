//! Tick advance: cascade, drain and dispatch.
//!
//! Each tick redistributes the wheel slots that crossed a higher-wheel
//! boundary, drains the current wheel-0 slot into the expired list, and
//! dispatches every expired entry: `FAST` timers run inline on the tick
//! task, `SPAWN` timers get an ephemeral thread, everything else goes to a
//! run queue for the worker pool.
//!
//! Cascading happens before draining so that an entry whose expire equals
//! the new tick lands in the current wheel-0 slot and fires this same tick.

use std::ptr::NonNull;

use parking_lot::MutexGuard;
use tracing::error;

use super::{release_entry, WheelState, WheelTimer, RUN_QUEUES, WORKERS};
use crate::list::TimerList;
use crate::ticks::Ticks;
use crate::timer::{Timer, TimerDecision, FLAG_DELETE, FLAG_REMOVED, FLAG_RUNNING};
use crate::wheel::{wheel_pos, wheel_slot, NO_IDX, WHEEL_EXPIRED, WHEEL_NONE};
use std::sync::atomic::Ordering;

impl WheelTimer {
    /// Advances logical time to `target`, running every timer that expires
    /// on the way. Strictly serial: only the tick task calls this, and the
    /// target may never lie in the past.
    pub(crate) fn advance_time_to(&self, target: Ticks) {
        let now = self.now();
        if now.gt(target) {
            error!(now = %now, target = %target, "time advancing backwards");
            debug_assert!(false, "advance_time_to({target}) from {now}");
            return;
        }
        while self.now() != target {
            self.inc_time();
            self.run_at(self.now());
        }
    }

    /// Advances logical time by `diff` ticks, firing due timers inline on
    /// the calling thread.
    ///
    /// This drives the scheduler by hand, in place of the tick task: useful
    /// for deterministic tests and simulations, usually combined with
    /// [`crate::VirtualClock`]. Never call it while the scheduler is
    /// [`start`](WheelTimer::start)ed (time advance must stay serial), nor
    /// from two threads at once.
    pub fn run_ticks(&self, diff: Ticks) {
        self.advance_time_to(self.now().add(diff));
    }

    /// Runs one tick's worth of work for tick value `now`: cascade, drain,
    /// dispatch.
    pub(crate) fn run_at(&self, now: Ticks) {
        let mut state = self.inner.state.lock();
        self.redistribute(&state, now);
        self.process_expired(&mut state, now);
    }

    /// Cascades boundary-crossing slots down and drains the current
    /// wheel-0 slot into the expired list. Must be called under the
    /// operations lock.
    fn redistribute(&self, state: &WheelState, now: Ticks) {
        let t = now.val();
        let idx0 = wheel_slot(0, t);
        if idx0 == 0 {
            // rolled over into a new wheel-1 slot; higher wheels first so
            // entries cascade at most one level per tick
            let idx1 = wheel_slot(1, t);
            if idx1 == 0 {
                let idx2 = wheel_slot(2, t);
                if idx2 == 0 {
                    let idx3 = wheel_slot(3, t);
                    self.redist_list(state, state.wheel_list(3, idx3), now);
                }
                self.redist_list(state, state.wheel_list(2, idx2), now);
            }
            self.redist_list(state, state.wheel_list(1, idx1), now);
        }
        // wheel 0 drains on every tick
        // SAFETY: operations lock held.
        unsafe { state.wheel_list(0, idx0).move_all_to(&state.expired) };
    }

    /// Empties `lst`, re-placing every entry according to its expire and
    /// the current tick.
    fn redist_list(&self, state: &WheelState, lst: &TimerList, now: Ticks) {
        // SAFETY: operations lock held; the closure removes only the
        // entry it was handed.
        unsafe {
            lst.for_each_safe_remove(|l, e| {
                self.redist_entry(state, l, e, now);
                true
            });
        }
        if !lst.is_empty() {
            error!(
                wheel = lst.wheel_no(),
                idx = lst.wheel_idx(),
                "slot not empty after redistribution"
            );
            debug_assert!(false, "slot not empty after redistribution");
        }
    }

    /// Moves one entry from `lst` to the slot matching its expire.
    fn redist_entry(&self, state: &WheelState, lst: &TimerList, t: NonNull<Timer>, now: Ticks) {
        // SAFETY: operations lock held; entry is linked on `lst`.
        let tr = unsafe { t.as_ref() };
        let mut expire = tr.expire_ticks();
        if expire.lt(now) {
            error!(
                expire = %expire,
                now = %now,
                wheel = lst.wheel_no(),
                idx = lst.wheel_idx(),
                "entry expired in the past"
            );
            debug_assert!(false, "entry expire {expire} behind now {now}");
            expire = now; // fire immediately
        }
        let (w, idx) = wheel_pos(expire, now);
        if w == lst.wheel_no() && idx == lst.wheel_idx() {
            error!(wheel = w, idx, "redistribution to the same slot");
            debug_assert!(false, "redistribution to the same slot {w}/{idx}");
            return;
        }
        // SAFETY: as above.
        unsafe { lst.remove(t) };
        if self.append_entry(state, t, w, idx).is_err() {
            error!(wheel = w, idx, "placement failed during redistribution");
            tr.clear_links();
            tr.info.set_flags(FLAG_REMOVED);
            // SAFETY: the entry left every list; release the scheduler ref.
            unsafe { release_entry(t) };
        }
    }

    /// Dispatches every entry on the expired list. Called under the
    /// operations lock; drops and re-acquires it around callback execution
    /// and worker wake-ups.
    fn process_expired(&self, state: &mut MutexGuard<'_, WheelState>, _now: Ticks) {
        let mut rq_added: u32 = 0;

        loop {
            let Some(t) = state.expired.first() else { break };
            // SAFETY: operations lock held; entry linked on the expired
            // list.
            unsafe {
                state.expired.remove(t);
                t.as_ref().clear_links();
            }
            let tr = unsafe { t.as_ref() };
            let flags = tr.info.flags();

            if flags & Timer::FAST != 0 {
                // inline on the tick task
                state.running_main.set(Some(t));
                tr.rctx.set_wheel(WHEEL_EXPIRED, NO_IDX);
                tr.info.set_flags(FLAG_RUNNING);
                let mut decision = TimerDecision::Stop;
                MutexGuard::unlocked(state, || {
                    decision = self.invoke_callback(t);
                });
                self.after_run(state, t, decision, false);
                // cleared only after RUNNING was resolved by after_run
                state.running_main.set(None);
                // the callback ran unlocked and may have changed the
                // expired list; restart the scan
                continue;
            }

            if flags & Timer::SPAWN != 0 {
                tr.info.set_flags(FLAG_RUNNING);
                tr.rctx.set_wheel(WHEEL_NONE, NO_IDX);
                MutexGuard::unlocked(state, || {
                    self.spawn_callback_thread(t);
                });
                continue;
            }

            // slow path: hand to the worker pool via the current producer
            // queue
            let rq_pos = self.inner.rq_head.load(Ordering::Acquire);
            let qi = rq_pos as usize % RUN_QUEUES;
            {
                let q = self.inner.run_queues[qi].lock();
                // SAFETY: queue lock held; entry detached.
                unsafe { q.lst.append(t) };
            }
            // rq_head only changes under the operations lock, so this CAS
            // cannot fail today; if it ever races, losing it just means a
            // parallel producer bumped the cursor for us
            let _ = self.inner.rq_head.compare_exchange(
                rq_pos,
                rq_pos.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            rq_added += 1;
        }

        if rq_added > 0 {
            MutexGuard::unlocked(state, || {
                // one signal per enqueued entry, capped at the pool size;
                // a full channel is fine, workers re-poll the cursors
                let signals = rq_added.min(WORKERS as u32);
                for _ in 0..signals {
                    if self.inner.wake_tx.try_send(()).is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// Handles a callback's verdict. Must be called under the operations
    /// lock. `delete_latched` carries a `DELETE` observation made under the
    /// run-queue lock (workers), which the flags may not show yet.
    pub(crate) fn after_run(
        &self,
        state: &WheelState,
        t: NonNull<Timer>,
        decision: TimerDecision,
        delete_latched: bool,
    ) {
        if decision == TimerDecision::Stop {
            // the callback finished the timer: it was unlinked before the
            // invocation, and the entry must not be touched past this point
            // SAFETY: releases the reference taken when the entry was
            // armed; nothing dereferences `t` afterwards.
            unsafe { release_entry(t) };
            return;
        }

        // SAFETY: operations lock held and RUNNING still set; the entry is
        // alive until the scheduler reference is released.
        let tr = unsafe { t.as_ref() };
        if delete_latched || tr.info.flags() & FLAG_DELETE != 0 {
            // rearm requested but a delete won the race
            let (w, idx) = tr.info.wheel_pos();
            if w != WHEEL_NONE {
                error!(wheel = w, idx, "running timer carries a wheel tag");
                debug_assert!(false, "running timer tagged {w}/{idx}");
            }
            tr.info.chg_flags(FLAG_REMOVED, FLAG_RUNNING);
            // SAFETY: as above; the latched delete ends the scheduler's
            // ownership.
            unsafe { release_entry(t) };
            return;
        }

        tr.info.reset_flags(FLAG_RUNNING);
        if let TimerDecision::After(d) = decision {
            tr.set_interval(d);
        }
        if let Err(e) = self.add_unsafe(state, t, self.now()) {
            // out-of-range rearm interval from the callback
            error!(error = %e, "re-arm after callback failed");
            tr.info.set_flags(FLAG_REMOVED);
            // SAFETY: placement failed, the entry is off every list.
            unsafe { release_entry(t) };
        }
    }

    /// Runs a `SPAWN` timer's callback on its own ephemeral thread. Called
    /// with no locks held.
    fn spawn_callback_thread(&self, t: NonNull<Timer>) {
        struct SendPtr(NonNull<Timer>);
        // SAFETY: the pointee is Sync and owned by the scheduler reference
        // travelling with the pointer.
        unsafe impl Send for SendPtr {}

        let wt = self.clone();
        let wg = self.inner.lifecycle.lock().wait.clone();
        let ptr = SendPtr(t);
        let spawned = std::thread::Builder::new()
            .name("tickwheel-timer".to_owned())
            .spawn(move || {
                let ptr = ptr; // force whole-struct capture (2021 disjoint captures)
                let _wg = wg; // joined by shutdown
                let t = ptr.0;
                let decision = wt.invoke_callback(t);
                let state = wt.inner.state.lock();
                wt.after_run(&state, t, decision, false);
            });
        if let Err(e) = spawned {
            // out of threads: run inline rather than dropping the firing
            error!(error = %e, "failed to spawn timer thread");
            let decision = self.invoke_callback(t);
            let state = self.inner.state.lock();
            self.after_run(&state, t, decision, false);
        }
    }
}
