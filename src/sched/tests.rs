//! Deterministic scheduler tests: no tick thread, no workers. Time is
//! driven by hand through `run_at`/`run_ticks`/`tick_once`, so every
//! firing is exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::clock::VirtualClock;
use crate::error::TimerError;
use crate::sched::DelStatus;
use crate::timer::{FLAG_DELETE, FLAG_HEAD};
use crate::wheel::{WHEEL_MASK, WHEEL_SHIFT};

const TICK: Duration = Duration::from_millis(1);

fn sched() -> WheelTimer {
    WheelTimer::new(TICK).expect("init failed")
}

fn virtual_sched() -> (WheelTimer, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new());
    let wt = WheelTimer::with_clock(TICK, Arc::clone(&clock) as Arc<dyn crate::clock::TimeSource>)
        .expect("init failed");
    (wt, clock)
}

/// Advances the virtual clock and the wheel in lockstep, one tick at a
/// time, so re-arm expirations stay anchored to the current tick.
fn vstep(wt: &WheelTimer, clock: &VirtualClock, ticks: u64) {
    for _ in 0..ticks {
        clock.advance(TICK);
        wt.run_ticks(Ticks::new(1));
    }
}

/// Counter-bumping callback used by most tests.
fn counting(
    runs: &Arc<AtomicU64>,
    decision: TimerDecision,
) -> impl FnMut(&WheelTimer, &Arc<Timer>) -> TimerDecision + Send + 'static {
    let runs = Arc::clone(runs);
    move |_, _| {
        runs.fetch_add(1, Ordering::SeqCst);
        decision
    }
}

/// Deterministic pseudo-random stream for the sweep tests.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn new_validates_tick_duration() {
    assert_eq!(
        WheelTimer::new(Duration::from_nanos(900)).err(),
        Some(TimerError::InvalidParameters)
    );
    assert_eq!(
        WheelTimer::new(Duration::from_secs(25 * 60 * 60)).err(),
        Some(TimerError::InvalidParameters)
    );
    assert!(WheelTimer::new(Duration::from_micros(1)).is_ok());
    assert!(WheelTimer::new(Duration::from_secs(24 * 60 * 60)).is_ok());
}

#[test]
fn conversions_round_trip_and_round_up() {
    let wt = sched();
    let (t, rest) = wt.ticks(Duration::from_micros(3_500));
    assert_eq!(t.val(), 3);
    assert_eq!(rest, Duration::from_micros(500));
    assert_eq!(wt.duration(Ticks::new(3)), Duration::from_millis(3));
    for raw in [0u64, 1, 7, 1000, 123_456] {
        let t = Ticks::new(raw);
        let (back, rest) = wt.ticks(wt.duration(t));
        assert_eq!(back, t);
        assert_eq!(rest, Duration::ZERO);
    }

    // sub-tick promotes to one tick; >= half a tick rounds up
    assert_eq!(wt.ticks_round_up(Duration::ZERO).val(), 1);
    assert_eq!(wt.ticks_round_up(Duration::from_micros(10)).val(), 1);
    assert_eq!(wt.ticks_round_up(Duration::from_micros(2_400)).val(), 2);
    assert_eq!(wt.ticks_round_up(Duration::from_micros(2_500)).val(), 3);
    assert_eq!(wt.ticks_round_up(Duration::from_millis(5)).val(), 5);
}

#[test]
fn init_lays_out_every_list() {
    let wt = sched();
    let state = wt.inner.state.lock();

    assert_eq!(state.wlists.len(), TOTAL_ENTRIES);
    for (w, &entries) in WHEEL_ENTRIES.iter().enumerate() {
        for idx in 0..entries as u16 {
            let lst = state.wheel_list(w as u8, idx);
            assert!(lst.is_empty(), "slot {w}/{idx} not empty");
            assert!(lst.head().detached());
            assert_eq!(lst.head().info.flags() & FLAG_HEAD, FLAG_HEAD);
            assert_eq!(lst.wheel_no(), w as u8);
            assert_eq!(lst.wheel_idx(), idx);
            assert_eq!(lst.head().info.wheel_pos(), (w as u8, idx));
        }
    }

    assert!(state.expired.is_empty());
    assert_eq!(state.expired.head().info.wheel_pos(), (WHEEL_EXPIRED, NO_IDX));
    assert_eq!(
        state.expired.head().info.flags() & FLAG_HEAD,
        FLAG_HEAD
    );
    drop(state);

    for (i, q) in wt.inner.run_queues.iter().enumerate() {
        let q = q.lock();
        assert!(q.lst.is_empty());
        assert_eq!(q.lst.head().info.wheel_pos(), (WHEEL_RUN_QUEUE, i as u16));
        assert!(q.running.get().is_none());
    }
}

#[test]
fn add_then_del_before_fire() {
    let (wt, clock) = virtual_sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(0).unwrap();

    wt.add(&tl, Duration::from_millis(100), counting(&runs, TimerDecision::Stop))
        .unwrap();
    assert_eq!(Arc::strong_count(&tl), 2, "scheduler must hold one ref");
    assert!(!tl.detached());

    assert_eq!(wt.del(&tl), Ok(DelStatus::Removed));
    assert_eq!(Arc::strong_count(&tl), 1);
    assert!(tl.links_null());

    // the second delete reports the timer as already gone
    assert_eq!(wt.del(&tl), Err(TimerError::AlreadyRemoved));

    // nothing fires afterwards
    vstep(&wt, &clock, 200);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // a deleted (not fired) timer can be reset and re-armed
    wt.reset(&tl, 0).unwrap();
    wt.add(&tl, Duration::from_millis(5), counting(&runs, TimerDecision::Stop))
        .unwrap();
    vstep(&wt, &clock, 10);
    // default-flag timers park on a run queue until a worker picks them up
    assert_eq!(tl.info.wheel_pos().0, WHEEL_RUN_QUEUE);
}

#[test]
fn add_state_machine_errors() {
    let (wt, clock) = virtual_sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();

    wt.add(&tl, Duration::from_millis(50), counting(&runs, TimerDecision::Stop))
        .unwrap();
    // arming an armed timer
    assert_eq!(
        wt.add(&tl, Duration::from_millis(10), counting(&runs, TimerDecision::Stop))
            .err(),
        Some(TimerError::Active)
    );
    // resetting an armed timer
    assert_eq!(wt.reset(&tl, 0).err(), Some(TimerError::Active));
    // deleting through init_timer is rejected while armed
    assert_eq!(wt.init_timer(&tl, 0).err(), Some(TimerError::Active));

    vstep(&wt, &clock, 60);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // fired (Stop): the dispatcher no longer touches the entry, so it still
    // reads active+running; only init_timer may recycle it
    assert_eq!(wt.del_try(&tl), Ok(DelStatus::Running));
    assert_eq!(wt.del(&tl), Ok(DelStatus::Running));
    assert_eq!(
        wt.add(&tl, Duration::from_millis(10), counting(&runs, TimerDecision::Stop))
            .err(),
        Some(TimerError::Active)
    );
    wt.init_timer(&tl, Timer::FAST).unwrap();
    wt.add(&tl, Duration::from_millis(2), counting(&runs, TimerDecision::Stop))
        .unwrap();
    vstep(&wt, &clock, 5);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // deleting a never-armed timer
    let fresh = wt.new_timer(0).unwrap();
    assert_eq!(wt.del(&fresh), Err(TimerError::Inactive));
}

#[test]
fn add_rejects_out_of_range_intervals() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(0).unwrap();

    // one tick = 1 ms; MAX_TICKS_DIFF ms overflows the comparable range
    let too_long = Duration::from_millis(MAX_TICKS_DIFF + 10);
    assert_eq!(
        wt.add(&tl, too_long, counting(&runs, TimerDecision::Stop)).err(),
        Some(TimerError::TicksTooHigh)
    );
    // the failed add left the entry removed; re-initialise and try again
    wt.init_timer(&tl, 0).unwrap();
    assert_eq!(
        wt.add_expire(
            &tl,
            wt.now().add_u64(MAX_TICKS_DIFF),
            counting(&runs, TimerDecision::Stop)
        )
        .err(),
        Some(TimerError::TicksTooHigh)
    );
    wt.add_expire(
        &tl,
        wt.now().add_u64(MAX_TICKS_DIFF - 1),
        counting(&runs, TimerDecision::Stop),
    )
    .unwrap();
}

/// Random expires across the whole tick space, fired by staging `run_at`
/// across each wheel boundary: exactly one invocation each.
#[test]
fn expire_sweep_across_wheel_boundaries() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(0).unwrap();
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

    for i in 0..300 {
        let delta = if i == 0 { 0 } else { rng.next() % MAX_TICKS_DIFF };
        let now = wt.now();
        let expire = now.add_u64(delta);
        wt.init_timer(&tl, Timer::FAST).unwrap();
        runs.store(0, Ordering::SeqCst);
        wt.add_expire(&tl, expire, counting(&runs, TimerDecision::Stop))
            .unwrap();

        // timers on higher wheels move only on boundary transitions: one
        // staged run per wheel
        let e = expire.val();
        let t3 = e & (WHEEL_MASK[3] << WHEEL_SHIFT[3]);
        let t2 = e & (WHEEL_MASK[2] << WHEEL_SHIFT[2]);
        let t1 = e & (WHEEL_MASK[1] << WHEEL_SHIFT[1]);
        let t0 = e & WHEEL_MASK[0];

        wt.run_at(Ticks::new(t3));
        if t2 != 0 {
            wt.run_at(Ticks::new(t3 + t2));
        }
        if t1 != 0 {
            wt.run_at(Ticks::new(t3 + t2 + t1));
        }
        if t0 != 0 {
            wt.run_at(Ticks::new(t3 + t2 + t1 + t0));
        }

        assert_eq!(
            runs.load(Ordering::SeqCst),
            1,
            "delta {delta:#x} expire {expire} fired wrong"
        );
        assert!(tl.detached(), "not detached after firing (delta {delta:#x})");
        assert_eq!(tl.info.wheel_pos(), (WHEEL_NONE, NO_IDX));
        assert_eq!(Arc::strong_count(&tl), 1);
        assert_eq!(wt.del_try(&tl), Ok(DelStatus::Running));
        assert_eq!(wt.del(&tl), Ok(DelStatus::Running));
    }
}

/// `advance_time_to` from random counter bases: every intermediate tick is
/// processed, the timer fires exactly once.
#[test]
fn advance_sweep_from_random_bases() {
    const MAX_DELTA: u64 = 16_384;

    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();
    let mut rng = XorShift(0xDEAD_BEEF_CAFE_F00D);

    for i in 0..60 {
        let delta = if i == 0 { 0 } else { rng.next() % MAX_DELTA };
        wt.inner.now_ticks.store(rng.next() >> 1, Ordering::SeqCst);
        let now = wt.now();
        let expire = now.add_u64(delta);
        wt.init_timer(&tl, Timer::FAST).unwrap();
        runs.store(0, Ordering::SeqCst);
        wt.add_expire(&tl, expire, counting(&runs, TimerDecision::Stop))
            .unwrap();

        if expire == wt.now() {
            // already on the expired list; it fires on the next tick
            wt.advance_time_to(expire.add_u64(1));
        } else {
            wt.advance_time_to(expire);
        }

        assert_eq!(
            runs.load(Ordering::SeqCst),
            1,
            "delta {delta} from base {now} fired wrong"
        );
        assert!(tl.detached());
        assert_eq!(tl.info.wheel_pos(), (WHEEL_NONE, NO_IDX));
    }
}

#[test]
fn zero_delta_advance_fires_nothing() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();
    wt.add_expire(&tl, wt.now().add_u64(1), counting(&runs, TimerDecision::Stop))
        .unwrap();
    wt.run_ticks(Ticks::new(0));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    wt.run_ticks(Ticks::new(1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn expire_equal_to_now_fires_on_the_next_tick() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();
    wt.add_expire(&tl, wt.now(), counting(&runs, TimerDecision::Stop))
        .unwrap();
    assert_eq!(tl.info.wheel_pos(), (WHEEL_EXPIRED, NO_IDX));
    wt.run_ticks(Ticks::new(1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Scenario: 20 ms periodic timer over 150 ms of virtual time fires 7
/// times (at 20, 40, …, 140 ms).
#[test]
fn periodic_rearm_under_virtual_time() {
    let (wt, clock) = virtual_sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();
    let mut eng = wt.test_engine();

    wt.add(&tl, Duration::from_millis(20), counting(&runs, TimerDecision::Periodic))
        .unwrap();

    for _ in 0..150 {
        clock.advance(TICK);
        wt.tick_once(&mut eng);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 7);

    assert_eq!(wt.del(&tl), Ok(DelStatus::Removed));
    for _ in 0..100 {
        clock.advance(TICK);
        wt.tick_once(&mut eng);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 7);
}

/// A rearm with `After` adopts the new interval from the next firing on.
#[test]
fn rearm_with_new_interval() {
    let (wt, clock) = virtual_sched();
    let fired_at = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let tl = wt.new_timer(Timer::FAST).unwrap();
    let mut eng = wt.test_engine();

    let log = Arc::clone(&fired_at);
    wt.add(&tl, Duration::from_millis(10), move |wt, _| {
        log.lock().push(wt.now().val());
        TimerDecision::After(Duration::from_millis(30))
    })
    .unwrap();

    for _ in 0..100 {
        clock.advance(TICK);
        wt.tick_once(&mut eng);
    }
    assert_eq!(*fired_at.lock(), vec![10, 40, 70, 100]);
    wt.del(&tl).unwrap();
}

/// Deleting the running timer from inside its own callback latches the
/// delete: the requested rearm is suppressed and the entry is discarded.
#[test]
fn del_from_own_callback_suppresses_rearm() {
    let (wt, clock) = virtual_sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(Timer::FAST).unwrap();

    let counter = Arc::clone(&runs);
    wt.add(&tl, Duration::from_millis(5), move |wt, me| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(wt.del(me), Ok(DelStatus::Running));
        assert_ne!(me.info.flags() & FLAG_DELETE, 0);
        TimerDecision::Periodic
    })
    .unwrap();

    vstep(&wt, &clock, 50);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_ne!(tl.info.flags() & FLAG_REMOVED, 0);
    assert_eq!(Arc::strong_count(&tl), 1);

    // a latched-delete entry resets without a full re-init
    wt.reset(&tl, Timer::FAST).unwrap();
    wt.add(&tl, Duration::from_millis(2), counting(&runs, TimerDecision::Stop))
        .unwrap();
    vstep(&wt, &clock, 5);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Without workers, an expired default-flag timer parks on a run queue;
/// deleting it there exercises the queue-lock handoff path.
#[test]
fn del_pulls_parked_entry_off_the_run_queue() {
    let (wt, _clock) = virtual_sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(0).unwrap();

    wt.add(&tl, Duration::from_millis(3), counting(&runs, TimerDecision::Stop))
        .unwrap();
    wt.run_ticks(Ticks::new(10));

    let (w, q) = tl.info.wheel_pos();
    assert_eq!(w, WHEEL_RUN_QUEUE);
    assert_eq!(q, 0);
    assert_eq!(wt.inner.rq_head.load(Ordering::SeqCst), 1);
    // the dispatcher signalled the (not yet running) workers
    assert!(wt.inner.wake_rx.try_recv().is_ok());

    assert_eq!(wt.del(&tl), Ok(DelStatus::Removed));
    assert!(wt.inner.run_queues[q as usize].lock().lst.is_empty());
    assert_eq!(Arc::strong_count(&tl), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn many_timers_with_identical_expire_fire_once_each() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let expire = wt.now().add_u64(500);

    let timers: Vec<_> = (0..10)
        .map(|_| {
            let tl = wt.new_timer(Timer::FAST).unwrap();
            wt.add_expire(&tl, expire, counting(&runs, TimerDecision::Stop))
                .unwrap();
            tl
        })
        .collect();

    wt.run_ticks(Ticks::new(499));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    wt.run_ticks(Ticks::new(1));
    assert_eq!(runs.load(Ordering::SeqCst), 10);
    for tl in &timers {
        assert!(tl.detached());
        assert_eq!(Arc::strong_count(tl), 1);
    }
}

/// Dropping the scheduler releases the references of still-armed timers.
#[test]
fn drop_releases_armed_entries() {
    let runs = Arc::new(AtomicU64::new(0));
    let (wt, _clock) = virtual_sched();
    let on_wheel = wt.new_timer(0).unwrap();
    let parked = wt.new_timer(0).unwrap();
    wt.add(&on_wheel, Duration::from_secs(60), counting(&runs, TimerDecision::Stop))
        .unwrap();
    wt.add(&parked, Duration::from_millis(1), counting(&runs, TimerDecision::Stop))
        .unwrap();
    wt.run_ticks(Ticks::new(5)); // parks the second on a run queue
    assert_eq!(Arc::strong_count(&on_wheel), 2);
    assert_eq!(Arc::strong_count(&parked), 2);

    drop(wt);
    assert_eq!(Arc::strong_count(&on_wheel), 1);
    assert_eq!(Arc::strong_count(&parked), 1);
    assert_ne!(on_wheel.info.flags() & FLAG_REMOVED, 0);
}

/// `del_wait` needs no waiting when the callback is not in flight.
#[test]
fn del_wait_without_running_callback() {
    let wt = sched();
    let runs = Arc::new(AtomicU64::new(0));
    let tl = wt.new_timer(0).unwrap();
    wt.add(&tl, Duration::from_millis(100), counting(&runs, TimerDecision::Stop))
        .unwrap();
    assert_eq!(wt.del_wait(&tl), Ok(DelStatus::Removed));
    // double del_wait tolerates the already-removed state
    assert_eq!(wt.del_wait(&tl), Ok(DelStatus::Removed));
}
