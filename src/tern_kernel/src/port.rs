//! The interface between the kernel and a port.
use crate::{ThreadId, Ticks};

/// Implemented by a port: the architecture-specific layer that switches
/// register contexts, masks interrupts, and drives the alarm timer.
///
/// # Safety
///
/// The kernel's memory safety relies on the following contract.
///
///  - `enter_critical*` must exclude every other execution context that can
///    call into the kernel until the matching `exit_critical*`, and
///    `is_critical` must report the current state truthfully.
///
///  - `switch_context` and `exit_and_dispatch` must transfer control to the
///    thread `new` without releasing the kernel lock. The lock is owned by
///    whichever thread is running, so `new` resumes inside the critical
///    section that `old` entered.
///
/// The methods marked `unsafe` are only called by the kernel.
pub unsafe trait Port: Send + Sync + 'static {
    /// Acquire the kernel lock from thread context.
    ///
    /// # Safety
    ///
    /// The lock must not be held by the current context.
    unsafe fn enter_critical(&self);

    /// Release the kernel lock from thread context.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context.
    unsafe fn exit_critical(&self);

    /// Acquire the kernel lock from an interrupt handler.
    ///
    /// # Safety
    ///
    /// The lock must not be held by the current context.
    unsafe fn enter_critical_from_isr(&self);

    /// Release the kernel lock from an interrupt handler.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context.
    unsafe fn exit_critical_from_isr(&self);

    /// Return a flag indicating whether the kernel lock is currently held.
    fn is_critical(&self) -> bool;

    /// Save the context of the running thread `old` and restore the context
    /// of `new`. Returns when `old` is resumed, with the kernel lock held.
    ///
    /// A thread that has never run starts executing with the kernel lock
    /// held; its entry code must release it with [`Port::exit_critical`].
    ///
    /// # Safety
    ///
    /// The kernel lock must be held. `old` must be the running thread.
    unsafe fn switch_context(&self, old: ThreadId, new: ThreadId);

    /// Discard the context of the exiting thread `old` and restore the context
    /// of `new`.
    ///
    /// A port running on bare metal never returns from this method. A hosted
    /// port may return, in which case the caller must unwind out of the
    /// thread's entry point without touching the kernel again.
    ///
    /// # Safety
    ///
    /// The kernel lock must be held. `old` must be the running thread.
    unsafe fn exit_and_dispatch(&self, old: ThreadId, new: ThreadId);

    /// Read the monotonic tick counter.
    fn now(&self) -> Ticks;

    /// Program the alarm to fire at `deadline`, replacing any previous
    /// setting. When it fires, the port must call
    /// [`Kernel::alarm_handler_from_isr`](crate::Kernel::alarm_handler_from_isr)
    /// followed by [`Kernel::interrupt_epilogue`](crate::Kernel::interrupt_epilogue).
    fn arm_alarm(&self, deadline: Ticks);

    /// Cancel the alarm.
    fn disarm_alarm(&self);
}
