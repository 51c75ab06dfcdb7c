//! Counting semaphores
use core::fmt;

use crate::{
    klock::CpuLockGuard, state::State, thread::queue::ThreadQueue, Kernel, Port, ThreadId,
    ThreadState, Timeout, WaitError, WaitObject, WaitResult,
};

define_id! {
    /// Identifies a counting semaphore within a [`Kernel`].
    pub struct SemaphoreId;
}

/// *Semaphore control block*
#[derive(Debug)]
pub(crate) struct SemaphoreCb {
    /// The count. A negative value `-n` means that `n` threads are waiting.
    pub(crate) counter: isize,

    pub(crate) wait_queue: ThreadQueue,
}

impl SemaphoreCb {
    pub(crate) fn new(counter: isize) -> Self {
        Self {
            counter,
            wait_queue: ThreadQueue::new(),
        }
    }
}

impl<P: Port> State<P> {
    /// Increment `sem`'s counter. If a thread was waiting, remove the
    /// highest-priority one from the queue and return it. The caller must wake
    /// it up.
    pub(crate) fn sem_release(&mut self, sem: SemaphoreId) -> Option<ThreadId> {
        let cb = &mut self.semaphores[sem];
        cb.counter += 1;
        if cb.counter <= 0 {
            let waiter = cb.wait_queue.pop_front(&mut self.threads);
            debug_assert!(waiter.is_some(), "semaphore counter is inconsistent");
            waiter
        } else {
            None
        }
    }

    /// Set `sem`'s counter to `n` and make every waiter ready with
    /// [`WaitError::Reset`]. Returns whether any thread was woken.
    pub(crate) fn sem_reset(&mut self, sem: SemaphoreId, n: isize) -> bool {
        assert!(n >= 0, "semaphore count must be non-negative");
        let cb = &mut self.semaphores[sem];
        cb.counter = n;
        let mut woken = false;
        while let Some(thread) = self.semaphores[sem].wait_queue.pop_front(&mut self.threads) {
            self.threads[thread].wakeup_result = Err(WaitError::Reset);
            self.ready(thread);
            woken = true;
        }
        woken
    }
}

impl<P: Port> Kernel<P> {
    /// Create a semaphore with the initial count `n`.
    pub fn create_semaphore(&self, n: isize) -> SemaphoreId {
        assert!(n >= 0, "semaphore count must be non-negative");
        let mut lock = self.lock();
        self.state(&mut lock).semaphores.insert(SemaphoreCb::new(n))
    }

    /// Delete a semaphore. It must not have waiters.
    pub fn delete_semaphore(&self, sem: SemaphoreId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        assert!(
            st.semaphores[sem].wait_queue.is_empty(),
            "{sem:?} has waiting threads"
        );
        st.semaphores.remove(sem);
    }

    /// Get a handle to operate on a semaphore.
    pub fn semaphore(&self, id: SemaphoreId) -> Semaphore<'_, P> {
        Semaphore { kernel: self, id }
    }

    /// Atomically signal `sig` and wait on `wait`.
    pub fn semaphore_signal_wait(&self, sig: SemaphoreId, wait: SemaphoreId) -> WaitResult {
        let mut lock = self.lock();
        if let Some(waiter) = self.state(&mut lock).sem_release(sig) {
            self.state(&mut lock).threads[waiter].wakeup_result = Ok(());
            self.state(&mut lock).ready(waiter);
        }
        let result = self.sem_wait_locked(
            &mut lock,
            wait,
            WaitObject::Semaphore(wait),
            Timeout::INFINITE,
        );
        // The thread released from `sig` is still waiting for the CPU if
        // `wait` was available
        self.reschedule_locked(&mut lock);
        result
    }

    /// Decrement `sem`'s counter, blocking on `obj` if it goes negative.
    ///
    /// `obj` is the object the thread is reported to be waiting on. It's
    /// different from `sem` if `sem` is internal to a higher-level object.
    pub(crate) fn sem_wait_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        sem: SemaphoreId,
        obj: WaitObject,
        timeout: Timeout,
    ) -> WaitResult {
        lock.expect_thread_context();

        {
            let st = self.state(lock);
            let cb = &mut st.semaphores[sem];
            cb.counter -= 1;
            if cb.counter >= 0 {
                return Ok(());
            }
            if timeout.is_immediate() {
                cb.counter += 1;
                return Err(WaitError::Timeout);
            }
            let current = st.current;
            st.semaphores[sem].wait_queue.insert(&mut st.threads, current);
        }

        self.sleep_timeout_locked(lock, ThreadState::Waiting(obj), timeout)
    }
}

/// A handle to a counting semaphore.
pub struct Semaphore<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: SemaphoreId,
}

impl<P: Port> fmt::Debug for Semaphore<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.id).finish()
    }
}

impl<'k, P: Port> Semaphore<'k, P> {
    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Take one unit, blocking until one is available.
    pub fn wait(&self) -> WaitResult {
        self.wait_timeout(Timeout::INFINITE)
    }

    /// Take one unit, blocking for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Timeout) -> WaitResult {
        let mut lock = self.kernel.lock();
        self.wait_timeout_locked(&mut lock, timeout)
    }

    pub fn wait_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        timeout: Timeout,
    ) -> WaitResult {
        self.kernel
            .sem_wait_locked(lock, self.id, WaitObject::Semaphore(self.id), timeout)
    }

    /// Release one unit, waking up the highest-priority waiter if there is
    /// one.
    pub fn signal(&self) {
        let mut lock = self.kernel.lock();
        self.signal_locked(&mut lock);
    }

    pub fn signal_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        if let Some(waiter) = self.kernel.state(lock).sem_release(self.id) {
            self.kernel.wakeup_locked(lock, waiter, Ok(()));
        }
    }

    /// Release one unit without rescheduling.
    pub fn signal_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.kernel.state(lock);
        if let Some(waiter) = st.sem_release(self.id) {
            st.threads[waiter].wakeup_result = Ok(());
            st.ready(waiter);
        }
    }

    /// Release `n` units without rescheduling.
    pub fn add_count_from_isr(&self, lock: &mut CpuLockGuard<'_, P>, n: usize) {
        for _ in 0..n {
            self.signal_from_isr(lock);
        }
    }

    /// Set the count to `n` and wake up every waiter with
    /// [`WaitError::Reset`].
    pub fn reset(&self, n: isize) {
        let mut lock = self.kernel.lock();
        self.reset_locked(&mut lock, n);
    }

    pub fn reset_locked(&self, lock: &mut CpuLockGuard<'_, P>, n: isize) {
        self.reset_from_isr(lock, n);
        self.kernel.reschedule_locked(lock);
    }

    pub fn reset_from_isr(&self, lock: &mut CpuLockGuard<'_, P>, n: isize) {
        self.kernel.state(lock).sem_reset(self.id, n);
    }

    /// Get the current count. A negative value `-n` means that `n` threads are
    /// waiting.
    pub fn count(&self) -> isize {
        let mut lock = self.kernel.lock();
        self.kernel.state(&mut lock).semaphores[self.id].counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::new_kernel;

    #[test]
    fn take_without_blocking() {
        let kernel = new_kernel();
        let sem = kernel.semaphore(kernel.create_semaphore(2));
        assert_eq!(sem.wait_timeout(Timeout::IMMEDIATE), Ok(()));
        assert_eq!(sem.wait(), Ok(()));
        assert_eq!(sem.count(), 0);

        // Fails without leaking a decrement
        assert_eq!(
            sem.wait_timeout(Timeout::IMMEDIATE),
            Err(WaitError::Timeout)
        );
        assert_eq!(sem.count(), 0);

        sem.signal();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn isr_operations() {
        let kernel = new_kernel();
        let sem = kernel.semaphore(kernel.create_semaphore(0));
        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        sem.add_count_from_isr(&mut lock, 3);
        sem.reset_from_isr(&mut lock, 1);
        drop(lock);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn waiters_are_woken_in_priority_order() {
        let kernel = new_kernel();
        let id = kernel.create_semaphore(0);
        let sem = kernel.semaphore(id);

        let mut lock = kernel.lock_cpu().unwrap();
        let threads = [3, 7, 5, 7].map(|priority| {
            kernel.create_thread_from_isr(&mut lock, crate::ThreadAttr { name: "w", priority })
        });
        // Fake the blocking part of `wait`
        let st = kernel.state(&mut lock);
        for &t in &threads {
            st.semaphores[id].counter -= 1;
            st.semaphores[id].wait_queue.insert(&mut st.threads, t);
            st.threads[t].state = ThreadState::Waiting(WaitObject::Semaphore(id));
        }

        for expected in [threads[1], threads[3], threads[2]] {
            sem.signal_from_isr(&mut lock);
            assert_eq!(kernel.state(&mut lock).threads[expected].state, ThreadState::Ready);
        }

        // The rest is released by a reset
        sem.reset_from_isr(&mut lock, 0);
        let st = kernel.state(&mut lock);
        assert_eq!(st.threads[threads[0]].state, ThreadState::Ready);
        assert_eq!(st.threads[threads[0]].wakeup_result, Err(WaitError::Reset));
        assert_eq!(st.semaphores[id].counter, 0);
    }

    #[test]
    #[should_panic(expected = "has waiting threads")]
    fn delete_with_waiters() {
        let kernel = new_kernel();
        let id = kernel.create_semaphore(0);
        {
            let mut lock = kernel.lock_cpu().unwrap();
            let t = kernel.create_thread_from_isr(
                &mut lock,
                crate::ThreadAttr {
                    name: "w",
                    priority: 1,
                },
            );
            let st = kernel.state(&mut lock);
            st.semaphores[id].counter = -1;
            st.semaphores[id].wait_queue.insert(&mut st.threads, t);
        }
        kernel.delete_semaphore(id);
    }
}
