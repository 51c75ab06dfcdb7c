//! Kernel state locking mechanism
use core::{fmt, marker::PhantomData};
use tokenlock::TokenLock;

use crate::{error::BadContextError, Port};

/// The key that "unlocks" [`CpuLockCell`]. Each kernel instance owns exactly
/// one. While the kernel lock is held, it's in the active [`CpuLockGuard`];
/// otherwise it's parked in a [`CpuLockTokenSlot`].
pub(crate) type CpuLockToken = tokenlock::ArcToken;

/// The keyhole type for [`TokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole = tokenlock::ArcTokenId;

/// Where a kernel instance keeps its [`CpuLockToken`] while no context holds
/// the kernel lock.
pub(crate) type CpuLockTokenSlot = spin::Mutex<Option<CpuLockToken>>;

/// RAII guard for the kernel lock, obtained by
/// [`Kernel::lock_cpu`](crate::Kernel::lock_cpu) or
/// [`Kernel::lock_cpu_from_isr`](crate::Kernel::lock_cpu_from_isr).
///
/// Holding a `&mut CpuLockGuard` grants access to the kernel state. Functions
/// that take one are either S-class (suffix `_locked`, thread context only;
/// they may reschedule or block) or I-class (suffix `_from_isr`; they never
/// reschedule, so they can be called from an interrupt handler or batched
/// inside a thread's critical section).
pub struct CpuLockGuard<'k, P: Port> {
    port: &'k P,
    slot: &'k CpuLockTokenSlot,
    /// `None` while another thread runs (see [`Self::park_token`]).
    token: Option<CpuLockToken>,
    from_isr: bool,
    _no_send: PhantomData<*mut ()>,
}

/// Attempt to enter a thread-context critical section.
pub(crate) fn lock_cpu<'k, P: Port>(
    port: &'k P,
    slot: &'k CpuLockTokenSlot,
) -> Result<CpuLockGuard<'k, P>, BadContextError> {
    if port.is_critical() {
        return Err(BadContextError);
    }

    // Safety: CPU Lock inactive
    unsafe { port.enter_critical() };

    let Some(token) = slot.lock().take() else {
        // Safety: We just entered it
        unsafe { port.exit_critical() };
        return Err(BadContextError);
    };

    Ok(CpuLockGuard {
        port,
        slot,
        token: Some(token),
        from_isr: false,
        _no_send: PhantomData,
    })
}

/// Attempt to enter an interrupt-context critical section.
pub(crate) fn lock_cpu_from_isr<'k, P: Port>(
    port: &'k P,
    slot: &'k CpuLockTokenSlot,
) -> Result<CpuLockGuard<'k, P>, BadContextError> {
    if port.is_critical() {
        return Err(BadContextError);
    }

    // Safety: CPU Lock inactive
    unsafe { port.enter_critical_from_isr() };

    let Some(token) = slot.lock().take() else {
        // Safety: We just entered it
        unsafe { port.exit_critical_from_isr() };
        return Err(BadContextError);
    };

    Ok(CpuLockGuard {
        port,
        slot,
        token: Some(token),
        from_isr: true,
        _no_send: PhantomData,
    })
}

impl<P: Port> CpuLockGuard<'_, P> {
    /// Return a flag indicating whether this guard was obtained in an
    /// interrupt handler.
    pub fn is_from_isr(&self) -> bool {
        self.from_isr
    }

    pub(crate) fn token_mut(&mut self) -> &mut CpuLockToken {
        match &mut self.token {
            Some(token) => token,
            None => panic!("the kernel lock token is held by another thread"),
        }
    }

    /// Hand the token over to whichever thread runs next. Called right
    /// before a context switch.
    pub(crate) fn park_token(&mut self) {
        let token = self.token.take();
        debug_assert!(token.is_some());
        *self.slot.lock() = token;
    }

    /// Take the token back after this thread was dispatched again.
    pub(crate) fn unpark_token(&mut self) {
        self.token = self.slot.lock().take();
        debug_assert!(self.token.is_some());
    }

    /// Fail if the guard doesn't permit blocking or rescheduling.
    #[track_caller]
    pub(crate) fn expect_thread_context(&self) {
        assert!(
            !self.from_isr,
            "this operation can't be performed in an interrupt context"
        );
    }
}

impl<P: Port> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        // A thread unwinding out of a context switch has nothing to return
        if let Some(token) = self.token.take() {
            *self.slot.lock() = Some(token);
        }

        // Safety: CPU Lock is currently active, and it's us who are
        // currently owning the lock
        unsafe {
            if self.from_isr {
                self.port.exit_critical_from_isr();
            } else {
                self.port.exit_critical();
            }
        }
    }
}

impl<P: Port> fmt::Debug for CpuLockGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockGuard")
            .field("from_isr", &self.from_isr)
            .finish()
    }
}

/// Cell type that can be accessed through a [`CpuLockGuard`] of the kernel
/// instance it belongs to.
pub(crate) struct CpuLockCell<T>(TokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub(crate) fn new(keyhole: CpuLockKeyhole, x: T) -> Self {
        Self(TokenLock::new(keyhole, x))
    }

    /// Borrow the contents. Panics if `lock` belongs to another kernel
    /// instance.
    #[inline]
    #[track_caller]
    pub(crate) fn borrow_mut<'a, P: Port>(
        &'a self,
        lock: &'a mut CpuLockGuard<'_, P>,
    ) -> &'a mut T {
        self.0.write(lock.token_mut())
    }
}
