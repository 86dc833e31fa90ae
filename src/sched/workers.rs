//! Scheduler tasks: the tick engine and the run-queue workers.
//!
//! [`WheelTimer::start`] spawns one tick thread and a fixed pool of worker
//! threads. Workers claim run queues by CAS-incrementing the consumer
//! cursor and drain them one entry at a time; the tick thread samples the
//! wall clock and converts elapsed real time into whole-tick advances.
//! [`WheelTimer::shutdown`] closes the cancel channel and joins everything,
//! including ephemeral `SPAWN` callback threads.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};
use crossbeam_utils::sync::WaitGroup;
use tracing::{debug, error, trace};

use super::{WheelTimer, RUN_QUEUES, WORKERS};
use crate::ticks::{Ticks, MAX_TICKS_DIFF};
use crate::timer::{FLAG_DELETE, FLAG_RUNNING};
use crate::wheel::WHEEL_RUN_QUEUE;

/// Tick-thread-local bookkeeping for the wall-clock bridge.
///
/// `ref_ts`/`ref_ticks` mirror the shared reference values in
/// [`super::WheelState`]; the tick thread is their only writer, so it reads
/// its own copies lock-free and publishes updates under the operations lock
/// only when rebasing.
pub(crate) struct TickEngine {
    /// Last wall-clock sample that advanced the tick counter.
    last_tick: Duration,
    /// Consecutive backwards-clock observations.
    bad_time: u32,
    ref_ts: Duration,
    ref_ticks: Ticks,
}

impl WheelTimer {
    /// Starts the scheduler: the tick task and the worker pool. No timer
    /// fires before `start` is called. Usually invoked right after
    /// construction.
    pub fn start(&self) {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let wg = WaitGroup::new();
        {
            let mut lc = self.inner.lifecycle.lock();
            lc.cancel_tx = Some(cancel_tx);
            lc.wait = Some(wg.clone());
        }

        {
            let state = self.inner.state.lock();
            state.ref_ts.set(self.inner.clock.now());
            state.ref_ticks.set(self.now());
        }

        for i in 0..WORKERS {
            let wt = self.clone();
            let cancel = cancel_rx.clone();
            let wg = wg.clone();
            std::thread::Builder::new()
                .name(format!("tickwheel-worker-{i}"))
                .spawn(move || {
                    let _wg = wg;
                    wt.worker_loop(cancel);
                })
                .expect("failed to spawn run-queue worker");
        }

        let wt = self.clone();
        let wg_tick = wg.clone();
        std::thread::Builder::new()
            .name("tickwheel-ticker".to_owned())
            .spawn(move || {
                let _wg = wg_tick;
                wt.ticker_loop(cancel_rx);
            })
            .expect("failed to spawn tick thread");
        drop(wg);
    }

    /// Stops the tick task and all workers and waits for them, and for
    /// any in-flight callbacks, to finish. Armed timers stay armed; they
    /// are released when the scheduler is dropped.
    pub fn shutdown(&self) {
        let (cancel, wait) = {
            let mut lc = self.inner.lifecycle.lock();
            (lc.cancel_tx.take(), lc.wait.take())
        };
        drop(cancel); // closes the channel, every task observes it
        if let Some(wg) = wait {
            wg.wait();
        }
    }

    /// The tick task: wakes every tick duration and advances logical time.
    fn ticker_loop(&self, cancel: Receiver<()>) {
        debug!(tick = ?self.inner.tick, "ticker starting");
        let mut eng = {
            let state = self.inner.state.lock();
            let now = self.inner.clock.now();
            state.ref_ts.set(now);
            state.ref_ticks.set(self.now());
            TickEngine {
                last_tick: now,
                bad_time: 0,
                ref_ts: now,
                ref_ticks: self.now(),
            }
        };
        let ticker = crossbeam_channel::tick(self.inner.tick);
        loop {
            select! {
                recv(cancel) -> _ => {
                    debug!("ticker cancelled");
                    break;
                }
                recv(ticker) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.tick_once(&mut eng);
                }
            }
        }
    }

    /// One tick of the wall-clock bridge. Returns how many logical ticks
    /// were advanced. Must never run concurrently with itself or with
    /// [`WheelTimer::run_ticks`].
    pub(crate) fn tick_once(&self, eng: &mut TickEngine) -> u64 {
        let now = self.inner.clock.now();

        if now < eng.last_tick {
            // wall clock went backwards; absorb a few, then rebase
            eng.bad_time += 1;
            if eng.bad_time > 10 {
                error!(
                    backwards = ?(eng.last_tick - now),
                    times = eng.bad_time,
                    "recovering from wall clock running backwards"
                );
                eng.last_tick = now;
                eng.ref_ts = now;
                eng.ref_ticks = self.now();
                let state = self.inner.state.lock();
                state.ref_ts.set(eng.ref_ts);
                state.ref_ticks.set(eng.ref_ticks);
            } else {
                debug!(
                    backwards = ?(eng.last_tick - now),
                    times = eng.bad_time,
                    "wall clock went backwards"
                );
            }
            return 0;
        }
        eng.bad_time = 0;

        let td = self.inner.tick;
        if (now - eng.ref_ts).as_nanos() / td.as_nanos() > u128::from(MAX_TICKS_DIFF - 2) {
            // the tick distance to the reference is about to become
            // incomparable; slide the reference forward
            debug!("tick reference nearing the comparison bound, rebasing");
            let (diff, _) = self.ticks(now - eng.last_tick);
            eng.ref_ts = eng.last_tick;
            eng.ref_ticks = self.now().sub(diff);
            let state = self.inner.state.lock();
            state.ref_ts.set(eng.ref_ts);
            state.ref_ticks.set(eng.ref_ticks);
        }

        // drift diagnostics: how far the tick counter strayed from real
        // elapsed time since the reference
        let run_time = now - eng.ref_ts;
        let run_ticks = self.now().sub(eng.ref_ticks);
        if run_time > self.duration(run_ticks.add_u64(21)) {
            let (lost, _) = self.ticks(run_time - self.duration(run_ticks));
            trace!(ticks = %run_ticks, lost = %lost, "ticker running behind real time");
        } else if run_ticks.val() > 1 && run_time < self.duration(run_ticks.sub_u64(1)) {
            trace!(ticks = %run_ticks, "ticker running ahead of real time");
        }

        let diff = now - eng.last_tick;
        if diff < td {
            return 0;
        }
        let (ticks, rest) = self.ticks(diff);
        // carry the sub-tick remainder so no real time is lost
        eng.last_tick = now - rest;
        self.advance_time_to(self.now().add(ticks));
        ticks.val()
    }

    /// A run-queue worker: waits for a wake signal, claims a queue, drains
    /// it, and goes back to waiting once the cursors meet.
    fn worker_loop(&self, cancel: Receiver<()>) {
        let wake_rx = self.inner.wake_rx.clone();
        'wait: loop {
            select! {
                recv(cancel) -> _ => break 'wait,
                recv(wake_rx) -> msg => {
                    if msg.is_err() {
                        break 'wait;
                    }
                    loop {
                        let pos = self.inner.rq_tail.load(Ordering::Acquire);
                        if pos == self.inner.rq_head.load(Ordering::Acquire) {
                            // another worker stole the work; sleep again
                            continue 'wait;
                        }
                        if self
                            .inner
                            .rq_tail
                            .compare_exchange(
                                pos,
                                pos.wrapping_add(1),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            // lost the claim; try the next index
                            continue;
                        }
                        self.drain_queue(pos as usize % RUN_QUEUES);
                    }
                }
            }
        }
        trace!("worker exiting");
    }

    /// Drains one run queue, invoking each entry's callback with no locks
    /// held.
    fn drain_queue(&self, qi: usize) {
        let rq = &self.inner.run_queues[qi];
        let mut q = rq.lock();
        loop {
            let Some(t) = q.lst.first() else { break };
            // SAFETY: queue lock held; entry linked on this queue.
            let tr = unsafe { t.as_ref() };

            // RUNNING must be set before the entry leaves the queue: a
            // deleter that observes wheel == NONE decides by that flag.
            // The operations lock cannot be taken here (the dispatcher
            // holds it while acquiring queue locks), which is why the
            // whole claim happens under this queue's lock alone.
            q.running.set(Some(t));
            tr.rctx.set_wheel(WHEEL_RUN_QUEUE, qi as u16);
            tr.info.set_flags(FLAG_RUNNING);
            // SAFETY: as above.
            unsafe {
                q.lst.remove(t);
                tr.clear_links();
            }
            drop(q);

            let decision = self.invoke_callback(t);

            // a del racing with this callback latches DELETE under the
            // queue lock; read it back under the same lock so the latch
            // cannot slip between the check and after_run
            let delete_latched = {
                let _q = rq.lock();
                // SAFETY: the scheduler still owns its entry reference.
                unsafe { t.as_ref() }.info.flags() & FLAG_DELETE != 0
            };

            {
                let state = self.inner.state.lock();
                self.after_run(&state, t, decision, delete_latched);
            }

            q = rq.lock();
            // cleared only after after_run resolved RUNNING
            q.running.set(None);
        }
    }
}

#[cfg(test)]
impl WheelTimer {
    /// A tick-engine snapshot for tests that drive ticks by hand, matching
    /// what `ticker_loop` would build at startup.
    pub(crate) fn test_engine(&self) -> TickEngine {
        let state = self.inner.state.lock();
        TickEngine {
            last_tick: self.inner.clock.now(),
            bad_time: 0,
            ref_ts: state.ref_ts.get(),
            ref_ticks: state.ref_ticks.get(),
        }
    }
}
