//! Delays, timers, and scheduling under the simulator
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use quickcheck_macros::quickcheck;
use tern_kernel::{CpuLockGuard, Kernel, KernelCfg, ThreadState};
use tern_port_std::{Sim, StdPort};

#[test]
fn delay_advances_virtual_time() {
    let sim = Sim::new(KernelCfg::new());
    assert_eq!(sim.now(), 0);
    sim.delay(7);
    assert_eq!(sim.now(), 7);
    sim.delay(0);
    assert_eq!(sim.now(), 7);
    sim.delay_until(20);
    assert_eq!(sim.now(), 20);
    // In the past
    sim.delay_until(15);
    assert_eq!(sim.now(), 20);
}

#[test]
fn short_delays_are_rounded_up() {
    let sim = Sim::new(KernelCfg::new().min_alarm_delta(3));
    sim.delay(1);
    assert_eq!(sim.now(), 3);
}

#[test]
fn round_robin_between_peers() {
    let sim = Sim::new(KernelCfg::new().time_quantum(3).main_priority(20));
    let log = Arc::new(Mutex::new(String::new()));

    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        sim.spawn(name, 10, move |k| {
            for _ in 0..3 {
                log.lock().unwrap().push_str(name);
                k.port().advance(3);
            }
        });
    }

    sim.delay(100);
    assert_eq!(*log.lock().unwrap(), "ababab");
}

#[test]
fn without_quantum_peers_run_to_completion() {
    let sim = Sim::new(KernelCfg::new().main_priority(20));
    let log = Arc::new(Mutex::new(String::new()));

    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        sim.spawn(name, 10, move |k| {
            for _ in 0..3 {
                log.lock().unwrap().push_str(name);
                k.port().advance(3);
            }
        });
    }

    sim.delay(100);
    assert_eq!(*log.lock().unwrap(), "aaabbb");
}

#[test]
fn yield_passes_to_peer() {
    let sim = Sim::new(KernelCfg::new().main_priority(20));
    let log = Arc::new(Mutex::new(String::new()));

    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        sim.spawn(name, 10, move |k| {
            for _ in 0..2 {
                log.lock().unwrap().push_str(name);
                k.yield_now();
            }
        });
    }

    sim.delay(10);
    assert_eq!(*log.lock().unwrap(), "abab");
}

#[test]
fn yield_from_main_runs_peer() {
    let sim = Sim::new(KernelCfg::new().main_priority(10));
    let ran = Arc::new(AtomicUsize::new(0));

    let ran2 = Arc::clone(&ran);
    let peer = sim.spawn("peer", 10, move |_| {
        ran2.fetch_add(1, Ordering::Relaxed);
    });
    // Equal priority, so it waits for its turn
    assert_eq!(sim.thread_state(peer), ThreadState::Ready);

    sim.yield_now();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert_eq!(sim.thread_state(peer), ThreadState::Final);
    assert_eq!(sim.thread_state(sim.current_thread()), ThreadState::Running);
}

#[test]
fn expired_quantum_rotates_main_behind_peer() {
    let sim = Sim::new(KernelCfg::new().main_priority(10).time_quantum(2));
    let ran_at = Arc::new(Mutex::new(None));

    let ran_at2 = Arc::clone(&ran_at);
    sim.spawn("peer", 10, move |k| {
        *ran_at2.lock().unwrap() = Some(k.now());
        k.port().advance(1);
    });

    sim.advance(3);
    // The peer took over when main's quantum ran out at tick 2
    assert_eq!(*ran_at.lock().unwrap(), Some(2));
    assert_eq!(sim.now(), 4);
}

#[test]
fn higher_priority_wakeup_preempts_busy_thread() {
    let sim = Sim::new(KernelCfg::new().main_priority(20));
    let log = Arc::new(Mutex::new(Vec::new()));

    let log2 = Arc::clone(&log);
    sim.spawn("busy", 10, move |k| {
        log2.lock().unwrap().push(("busy start", k.now()));
        k.port().advance(10);
        log2.lock().unwrap().push(("busy end", k.now()));
    });
    let log2 = Arc::clone(&log);
    sim.spawn("sleeper", 15, move |k| {
        k.delay(4);
        log2.lock().unwrap().push(("sleeper", k.now()));
    });

    sim.delay(50);
    assert_eq!(
        *log.lock().unwrap(),
        [("busy start", 0), ("sleeper", 4), ("busy end", 10)]
    );
}

#[test]
fn exited_thread_can_be_released() {
    let sim = Sim::new(KernelCfg::new());
    let t = sim.spawn("short", 200, |_| {});
    assert_eq!(sim.thread_state(t), ThreadState::Final);
    sim.release_thread(t);
}

static PERIODIC_COUNT: AtomicUsize = AtomicUsize::new(0);

fn count_periodic(_: &Kernel<StdPort>, _: &mut CpuLockGuard<'_, StdPort>, arg: usize) {
    assert_eq!(arg, 42);
    PERIODIC_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn periodic_timer() {
    let sim = Sim::new(KernelCfg::new());
    let timer = sim.timer(sim.create_timer());

    timer.set_continuous(10, count_periodic, 42);
    sim.delay(35);
    assert_eq!(PERIODIC_COUNT.load(Ordering::Relaxed), 3);
    assert_eq!(timer.remaining(), Some(5));

    // Busy work doesn't make the timer drift
    sim.advance(20);
    assert_eq!(PERIODIC_COUNT.load(Ordering::Relaxed), 5);

    timer.reset();
    assert!(!timer.is_armed());
    sim.delay(50);
    assert_eq!(PERIODIC_COUNT.load(Ordering::Relaxed), 5);
}

static ONE_SHOT_AT: AtomicUsize = AtomicUsize::new(usize::MAX);

fn record_one_shot(kernel: &Kernel<StdPort>, _: &mut CpuLockGuard<'_, StdPort>, _: usize) {
    ONE_SHOT_AT.store(kernel.now() as usize, Ordering::Relaxed);
}

#[test]
fn one_shot_timer_wakes_thread() {
    let sim = Sim::new(KernelCfg::new());
    let timer = sim.timer(sim.create_timer());

    timer.set(6, record_one_shot, 0);
    assert!(timer.is_armed());
    sim.delay(20);
    assert_eq!(ONE_SHOT_AT.load(Ordering::Relaxed), 6);
    assert!(!timer.is_armed());
    sim.delete_timer(timer.id());
}

/// Spawn a sleeper for each delay, let them all run, and return the log of
/// `(wake-up time, delay)` pairs in the order they woke up.
fn run_sleepers(cfg: KernelCfg, delays: &[u8]) -> Vec<(u32, u32)> {
    let sim = Sim::new(cfg);
    let log = Arc::new(Mutex::new(Vec::new()));

    for (i, &delay) in delays.iter().enumerate() {
        let log = Arc::clone(&log);
        // Lower than main, so they all start when main blocks at time 0
        let delay = delay as u32 + 2;
        sim.spawn("sleeper", 100 - i as u8, move |k| {
            k.delay(delay);
            log.lock().unwrap().push((k.now(), delay));
        });
    }

    sim.delay(300);

    let log = log.lock().unwrap().clone();
    log
}

/// With a minimum alarm delta of one tick, sleepers wake up in the order of
/// their deadlines, each exactly on time.
#[quickcheck]
fn sleepers_wake_on_time(delays: Vec<u8>) -> bool {
    let delays = &delays[..delays.len().min(16)];
    let log = run_sleepers(KernelCfg::new().min_alarm_delta(1), delays);

    log.len() == delays.len()
        && log.iter().all(|&(woke, delay)| woke == delay)
        && log.windows(2).all(|w| w[0].0 <= w[1].0)
}

/// A timer that becomes the head closer than `min_alarm_delta` to its
/// deadline is late by less than `min_alarm_delta`.
#[quickcheck]
fn sleepers_lateness_is_bounded(delays: Vec<u8>) -> bool {
    let delays = &delays[..delays.len().min(16)];
    let cfg = KernelCfg::new();
    let log = run_sleepers(cfg, delays);

    log.len() == delays.len()
        && log
            .iter()
            .all(|&(woke, delay)| woke >= delay && woke - delay < cfg.min_alarm_delta)
        && log.windows(2).all(|w| w[0].0 <= w[1].0)
}

#[test]
fn head_closer_than_min_alarm_delta_is_late() {
    // The 2-tick sleeper fires at 2, leaving the 3-tick sleeper one tick away
    let log = run_sleepers(KernelCfg::new(), &[1, 0]);
    assert_eq!(log, [(2, 2), (4, 3)]);
}
