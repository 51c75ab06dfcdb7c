//! Simulation environment for running the kernel on a hosted environment.
//!
//! Every kernel thread is backed by an OS thread, but only one of them runs at
//! a time: the one the kernel has dispatched. The others are parked until the
//! kernel switches to them. This makes a simulation deterministic.
//!
//! The system time is virtual. It advances in two ways:
//!
//!  - When every thread is blocked, the idle thread jumps the clock to the
//!    next alarm and delivers the alarm interrupt.
//!  - A thread simulating busy work calls [`StdPort::advance`], which moves the
//!    clock one tick at a time and delivers the alarm interrupt and the time
//!    quantum tick on the way.
//!
//! If every thread is blocked and no alarm is set, the simulation is
//! deadlocked, and the main thread panics.
//!
//! ```
//! use tern_kernel::{KernelCfg, Timeout};
//! use tern_port_std::Sim;
//!
//! let sim = Sim::new(KernelCfg::new());
//! let sem = sim.create_semaphore(0);
//!
//! sim.spawn("signaler", 64, move |k| {
//!     k.delay(5);
//!     k.semaphore(sem).signal();
//! });
//!
//! assert_eq!(sim.semaphore(sem).wait_timeout(Timeout::ticks(100)), Ok(()));
//! assert_eq!(sim.now(), 5);
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use std::{
    any::Any,
    cell::Cell,
    fmt, ops,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
};

use tern_kernel::{CpuLockGuard, Kernel, KernelCfg, Port, Priority, ThreadAttr, ThreadId, Ticks};

/// The role of an OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that constructed the [`Sim`]. It's the kernel's main
    /// thread.
    Main,
    /// The backing thread for a kernel thread.
    Thread,
    /// The backing thread for the idle thread.
    Idle,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

/// The panic payload used to unwind the backing threads of a halted
/// simulation.
struct Halted;

/// Which backing thread may run.
#[derive(Debug)]
struct Baton {
    /// The kernel thread whose backing thread is running.
    running: Option<ThreadId>,
    /// Set when the simulation stops. Parked threads unwind when they see it.
    halted: bool,
    /// The reason the simulation stopped abnormally.
    failure: Option<String>,
}

/// The [`Port`] implementation of the simulator.
pub struct StdPort {
    kernel: Weak<Kernel<StdPort>>,
    baton: Mutex<Baton>,
    baton_cv: Condvar,
    critical: AtomicBool,
    now: AtomicU32,
    alarm: spin::Mutex<Option<Ticks>>,
}

impl fmt::Debug for StdPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StdPort")
            .field("baton", &self.baton)
            .field("now", &self.now)
            .field("alarm", &self.alarm)
            .finish()
    }
}

impl StdPort {
    fn new(kernel: Weak<Kernel<StdPort>>) -> Self {
        Self {
            kernel,
            baton: Mutex::new(Baton {
                running: None,
                halted: false,
                failure: None,
            }),
            baton_cv: Condvar::new(),
            critical: AtomicBool::new(false),
            now: AtomicU32::new(0),
            alarm: spin::Mutex::new(None),
        }
    }

    fn kernel(&self) -> Arc<Kernel<StdPort>> {
        match self.kernel.upgrade() {
            Some(kernel) => kernel,
            None => panic!("the simulator has been dropped"),
        }
    }

    fn lock_baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_baton(&self, to: ThreadId) {
        log::trace!("passing the baton to {to:?}");
        self.lock_baton().running = Some(to);
        self.baton_cv.notify_all();
    }

    /// Park the calling backing thread until the kernel dispatches `me`.
    fn wait_for_baton(&self, me: ThreadId) -> Result<(), Halted> {
        let mut baton = self.lock_baton();
        while baton.running != Some(me) && !baton.halted {
            baton = self
                .baton_cv
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if baton.halted {
            Err(Halted)
        } else {
            Ok(())
        }
    }

    /// Stop the simulation. The first failure reported wins.
    fn halt(&self, failure: Option<String>) {
        let mut baton = self.lock_baton();
        if baton.failure.is_none() {
            baton.failure = failure;
        }
        baton.halted = true;
        drop(baton);
        self.baton_cv.notify_all();
    }

    /// Leave a halted simulation. The main thread reports the failure; other
    /// backing threads unwind silently.
    fn bail(&self) -> ! {
        let failure = self.lock_baton().failure.clone();
        match (THREAD_ROLE.with(Cell::get), failure) {
            (ThreadRole::Main, Some(failure)) => panic!("{failure}"),
            (ThreadRole::Main, None) => panic!("the simulation was halted"),
            _ => panic::resume_unwind(Box::new(Halted)),
        }
    }

    /// Simulate an interrupt: run `handler` with an interrupt-context kernel
    /// lock, then run the interrupt epilogue, which may preempt the caller.
    ///
    /// Must be called from a running kernel thread.
    pub fn interrupt(
        &self,
        handler: impl FnOnce(&Kernel<StdPort>, &mut CpuLockGuard<'_, StdPort>),
    ) {
        let kernel = self.kernel();
        {
            let mut lock = match kernel.lock_cpu_from_isr() {
                Ok(lock) => lock,
                Err(e) => panic!("{e}"),
            };
            handler(&kernel, &mut lock);
        }
        kernel.interrupt_epilogue();
    }

    /// Simulate `ticks` ticks of busy work by the calling thread. Interrupts
    /// due in the meantime are delivered, so the caller may be preempted.
    pub fn advance(&self, ticks: Ticks) {
        for _ in 0..ticks {
            let now = self.now.load(Ordering::Relaxed).wrapping_add(1);
            self.now.store(now, Ordering::Relaxed);

            let alarm_due = self.alarm.lock().map_or(false, |deadline| {
                (now.wrapping_sub(deadline) as i32) >= 0
            });

            self.interrupt(|kernel, lock| {
                kernel.quantum_tick_from_isr(lock);
                if alarm_due {
                    kernel.alarm_handler_from_isr(lock);
                }
            });
        }
    }

    /// Create and start a thread running `body`. The thread exits when `body`
    /// returns.
    ///
    /// Must be called from a running kernel thread.
    pub fn spawn(
        &self,
        name: &'static str,
        priority: Priority,
        body: impl FnOnce(&Kernel<StdPort>) + Send + 'static,
    ) -> ThreadId {
        let kernel = self.kernel();
        let thread = {
            let mut lock = match kernel.lock_cpu() {
                Ok(lock) => lock,
                Err(e) => panic!("{e}"),
            };
            kernel.create_thread_from_isr(&mut lock, ThreadAttr { name, priority })
        };

        let backing = Arc::clone(&kernel);
        let spawned = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Thread));
                let port = backing.port();
                if port.wait_for_baton(thread).is_err() {
                    return;
                }
                log::trace!("{thread:?} ({name}) is running for the first time");

                // Safety: We were dispatched with the kernel lock held
                unsafe { port.exit_critical() };

                match panic::catch_unwind(AssertUnwindSafe(|| body(&backing))) {
                    Ok(()) => backing.exit_thread(),
                    Err(payload) => port.report_panic(name, payload),
                }
            });
        if let Err(e) = spawned {
            panic!("failed to spawn a backing thread: {e}");
        }

        kernel.start_thread(thread);
        thread
    }

    /// Record a panic that escaped a backing thread and stop the simulation.
    fn report_panic(&self, name: &str, payload: Box<dyn Any + Send>) {
        if payload.is::<Halted>() {
            return;
        }
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        log::error!("thread '{name}' panicked: {message}");
        self.halt(Some(format!("thread '{name}' panicked: {message}")));
    }

    /// The body of the idle thread's backing thread.
    fn idle_loop(&self, kernel: &Kernel<StdPort>) {
        let idle = kernel.idle_thread();
        if self.wait_for_baton(idle).is_err() {
            return;
        }

        // Safety: We were dispatched with the kernel lock held
        unsafe { self.exit_critical() };

        loop {
            let Some(deadline) = *self.alarm.lock() else {
                log::error!("every thread is blocked, and no alarm is set");
                self.halt(Some(
                    "deadlock: every thread is blocked, and no alarm is set".to_owned(),
                ));
                return;
            };

            let now = self.now.load(Ordering::Relaxed);
            if (deadline.wrapping_sub(now) as i32) > 0 {
                log::trace!("idle: advancing the clock from {now} to {deadline}");
                self.now.store(deadline, Ordering::Relaxed);
            }

            self.interrupt(|kernel, lock| kernel.alarm_handler_from_isr(lock));
        }
    }
}

unsafe impl Port for StdPort {
    unsafe fn enter_critical(&self) {
        let was_critical = self.critical.swap(true, Ordering::Relaxed);
        debug_assert!(!was_critical);
    }

    unsafe fn exit_critical(&self) {
        // Unwinding out of a halted simulation may release the lock more than
        // once
        self.critical.store(false, Ordering::Relaxed);
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
        self.pass_baton(new);
        if self.wait_for_baton(old).is_err() {
            self.bail();
        }
    }

    unsafe fn exit_and_dispatch(&self, old: ThreadId, new: ThreadId) {
        log::trace!("{old:?} exited");
        self.pass_baton(new);
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

/// A simulated system. The calling thread becomes the kernel's main thread.
///
/// Dropping the `Sim` stops the simulation; threads that haven't exited yet
/// are abandoned.
pub struct Sim {
    kernel: Arc<Kernel<StdPort>>,
}

impl fmt::Debug for Sim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Sim").field(self.kernel.port()).finish()
    }
}

impl Sim {
    pub fn new(cfg: KernelCfg) -> Self {
        let _ = env_logger::try_init();

        let kernel = Arc::new_cyclic(|this| Kernel::new(StdPort::new(this.clone()), cfg));
        THREAD_ROLE.with(|role| role.set(ThreadRole::Main));
        kernel.port().lock_baton().running = Some(kernel.current_thread());

        let backing = Arc::clone(&kernel);
        let spawned = thread::Builder::new()
            .name("idle".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Idle));
                backing.port().idle_loop(&backing);
            });
        if let Err(e) = spawned {
            panic!("failed to spawn the idle thread: {e}");
        }

        log::debug!("simulation started");
        Self { kernel }
    }

    pub fn kernel(&self) -> &Kernel<StdPort> {
        &self.kernel
    }

    /// See [`StdPort::spawn`].
    pub fn spawn(
        &self,
        name: &'static str,
        priority: Priority,
        body: impl FnOnce(&Kernel<StdPort>) + Send + 'static,
    ) -> ThreadId {
        self.kernel.port().spawn(name, priority, body)
    }

    /// See [`StdPort::interrupt`].
    pub fn interrupt(
        &self,
        handler: impl FnOnce(&Kernel<StdPort>, &mut CpuLockGuard<'_, StdPort>),
    ) {
        self.kernel.port().interrupt(handler);
    }

    /// See [`StdPort::advance`].
    pub fn advance(&self, ticks: Ticks) {
        self.kernel.port().advance(ticks);
    }
}

impl ops::Deref for Sim {
    type Target = Kernel<StdPort>;

    fn deref(&self) -> &Self::Target {
        &self.kernel
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        log::debug!("stopping the simulation");
        self.kernel.port().halt(None);
    }
}
