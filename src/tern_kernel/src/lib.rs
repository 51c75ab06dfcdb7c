//! The core of a preemptive, priority-based real-time kernel for
//! resource-constrained microcontrollers.
//!
//! # Structure
//!
//! A [`Kernel`] instance owns every kernel object. Objects live in arenas
//! inside the instance and are referred to by copyable ids such as
//! [`ThreadId`] and [`MutexId`]. Multiple instances can coexist, for example
//! one per CPU core or one per test.
//!
//! The instance is parameterized by a [`Port`], which supplies the
//! architecture-specific parts: context switching, the kernel lock (interrupt
//! masking), and a one-shot alarm timer.
//!
//! # Kernel lock and calling contexts
//!
//! Kernel state is only reachable while the kernel lock is held. Most
//! operations come in up to three flavors:
//!
//!  - The plain form (e.g., [`Semaphore::signal`]) acquires the lock by
//!    itself. It's called from thread context.
//!  - The S-class form (suffix `_locked`, e.g., [`Semaphore::signal_locked`])
//!    takes a [`CpuLockGuard`] the caller already holds. It may reschedule or
//!    block, so it's only valid in thread context.
//!  - The I-class form (suffix `_from_isr`, e.g.,
//!    [`Semaphore::signal_from_isr`]) takes a [`CpuLockGuard`] as well, but it
//!    never reschedules. Interrupt handlers use it, and threads use it to
//!    batch several wakeups into one [`Kernel::reschedule_locked`] call.
//!
//! After an interrupt handler returns, the port calls
//! [`Kernel::interrupt_epilogue`], which performs the preemption the handler
//! may have made necessary.
//!
//! # Errors
//!
//! Blocking operations report [`WaitError::Timeout`] and
//! [`WaitError::Reset`] to the caller. Programming errors, such as unlocking
//! a mutex owned by another thread or using a deleted object, are fatal and
//! panic before any state is modified.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
mod utils;

mod cfg;
mod channel;
mod condvar;
mod error;
mod heap;
mod klock;
mod mutex;
mod port;
mod queue;
mod sched;
mod semaphore;
mod state;
mod thread;
mod time;
mod timer;
mod wait_queue;

#[cfg(test)]
mod test_utils;

pub use self::{
    cfg::KernelCfg,
    channel::{ByteChannel, QueueChannel},
    condvar::{CondVar, CondVarId},
    error::{
        BadContextError, HeapIntegrityError, QueueEmptyError, QueueFullError, WaitError,
        WaitResult,
    },
    heap::{BlockProvider, Heap, HeapStatus, MemoryCore, ALLOC_UNIT},
    klock::CpuLockGuard,
    mutex::{Mutex, MutexId},
    port::Port,
    queue::{InputQueue, InputQueueId, OutputQueue, OutputQueueId},
    semaphore::{Semaphore, SemaphoreId},
    thread::{priority, Priority, ThreadAttr, ThreadId, ThreadState, WaitObject},
    time::{is_time_within, Ticks, Timeout},
    timer::{CallbackFn, Timer, TimerId},
    wait_queue::{WaitQueue, WaitQueueId},
};

use self::{
    klock::{CpuLockCell, CpuLockToken, CpuLockTokenSlot},
    state::State,
};

/// A kernel instance.
///
/// See the [crate-level documentation](crate) for an overview.
pub struct Kernel<P: Port> {
    port: P,
    idle: ThreadId,
    token: CpuLockTokenSlot,
    state: CpuLockCell<State<P>>,
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel instance.
    ///
    /// The calling context becomes the running main thread. An idle thread is
    /// registered at [`priority::IDLE`] in the ready state; the port must
    /// supply its execution context (see [`Self::idle_thread`]). The idle
    /// thread must never block.
    pub fn new(port: P, cfg: KernelCfg) -> Self {
        let state = State::new(cfg);
        let token = CpuLockToken::new();
        Self {
            port,
            idle: state.idle,
            state: CpuLockCell::new(token.id(), state),
            token: spin::Mutex::new(Some(token)),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Acquire the kernel lock in thread context.
    pub fn lock_cpu(&self) -> Result<CpuLockGuard<'_, P>, BadContextError> {
        klock::lock_cpu(&self.port, &self.token)
    }

    /// Acquire the kernel lock in an interrupt handler.
    pub fn lock_cpu_from_isr(&self) -> Result<CpuLockGuard<'_, P>, BadContextError> {
        klock::lock_cpu_from_isr(&self.port, &self.token)
    }

    /// Read the system time.
    pub fn now(&self) -> Ticks {
        self.port.now()
    }

    /// Acquire the kernel lock on behalf of a non-locked API function.
    /// Re-entering the lock is a programming error.
    #[track_caller]
    pub(crate) fn lock(&self) -> CpuLockGuard<'_, P> {
        match self.lock_cpu() {
            Ok(lock) => lock,
            Err(e) => panic!("{e}"),
        }
    }

    #[inline]
    #[track_caller]
    pub(crate) fn state<'a>(&'a self, lock: &'a mut CpuLockGuard<'_, P>) -> &'a mut State<P> {
        self.state.borrow_mut(lock)
    }
}
