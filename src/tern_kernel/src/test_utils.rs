//! A port for unit tests that never switches contexts
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{Kernel, KernelCfg, Port, ThreadId, Ticks};

/// Runs everything in the calling (main) thread. The clock only advances
/// through [`TestPort::set_now`], and the alarm is recorded rather than
/// delivered.
#[derive(Debug, Default)]
pub struct TestPort {
    critical: AtomicBool,
    now: AtomicU32,
    alarm: spin::Mutex<Option<Ticks>>,
}

impl TestPort {
    /// Get the currently programmed alarm.
    pub fn alarm(&self) -> Option<Ticks> {
        *self.alarm.lock()
    }

    pub fn set_now(&self, now: Ticks) {
        self.now.store(now, Ordering::Relaxed);
    }
}

unsafe impl Port for TestPort {
    unsafe fn enter_critical(&self) {
        assert!(!self.critical.swap(true, Ordering::Relaxed));
    }

    unsafe fn exit_critical(&self) {
        assert!(self.critical.swap(false, Ordering::Relaxed));
    }

    unsafe fn enter_critical_from_isr(&self) {
        unsafe { self.enter_critical() };
    }

    unsafe fn exit_critical_from_isr(&self) {
        unsafe { self.exit_critical() };
    }

    fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed)
    }

    unsafe fn switch_context(&self, old: ThreadId, new: ThreadId) {
        panic!("unexpected context switch from {old:?} to {new:?}");
    }

    unsafe fn exit_and_dispatch(&self, old: ThreadId, new: ThreadId) {
        panic!("unexpected context switch from {old:?} to {new:?}");
    }

    fn now(&self) -> Ticks {
        self.now.load(Ordering::Relaxed)
    }

    fn arm_alarm(&self, deadline: Ticks) {
        *self.alarm.lock() = Some(deadline);
    }

    fn disarm_alarm(&self) {
        *self.alarm.lock() = None;
    }
}

pub fn new_kernel() -> Kernel<TestPort> {
    new_kernel_with(KernelCfg::new())
}

pub fn new_kernel_with(cfg: KernelCfg) -> Kernel<TestPort> {
    let _ = env_logger::try_init();
    Kernel::new(TestPort::default(), cfg)
}
