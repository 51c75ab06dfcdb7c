//! Condition variables
use core::fmt;

use crate::{
    klock::CpuLockGuard, state::State, thread::queue::ThreadQueue, Kernel, MutexId, Port,
    ThreadState, Timeout, WaitError, WaitObject, WaitResult,
};

define_id! {
    /// Identifies a condition variable within a [`Kernel`].
    pub struct CondVarId;
}

/// *Condition variable control block*
#[derive(Debug, Default)]
pub(crate) struct CondVarCb {
    pub(crate) wait_queue: ThreadQueue,
}

impl<P: Port> State<P> {
    /// Make every waiter of `cv` ready with [`WaitError::Reset`].
    fn condvar_wake_all(&mut self, cv: CondVarId) {
        while let Some(thread) = self.condvars[cv].wait_queue.pop_front(&mut self.threads) {
            self.threads[thread].wakeup_result = Err(WaitError::Reset);
            self.ready(thread);
        }
    }
}

impl<P: Port> Kernel<P> {
    pub fn create_condvar(&self) -> CondVarId {
        let mut lock = self.lock();
        self.state(&mut lock).condvars.insert(CondVarCb::default())
    }

    /// Delete a condition variable. It must not have waiters.
    pub fn delete_condvar(&self, cv: CondVarId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        assert!(
            st.condvars[cv].wait_queue.is_empty(),
            "{cv:?} has waiting threads"
        );
        st.condvars.remove(cv);
    }

    /// Get a handle to operate on a condition variable.
    pub fn condvar(&self, id: CondVarId) -> CondVar<'_, P> {
        CondVar { kernel: self, id }
    }
}

/// A handle to a condition variable.
///
/// A waiter atomically releases a mutex and blocks. The mutex is always
/// reacquired before the wait operation returns, whatever its outcome.
pub struct CondVar<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: CondVarId,
}

impl<P: Port> fmt::Debug for CondVar<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CondVar").field(&self.id).finish()
    }
}

impl<'k, P: Port> CondVar<'k, P> {
    pub fn id(&self) -> CondVarId {
        self.id
    }

    /// Release `mutex`, wait for a signal, and reacquire `mutex`.
    ///
    /// `mutex` must be the most recently locked mutex owned by the current
    /// thread. Returns [`WaitError::Reset`] if woken by a broadcast.
    pub fn wait(&self, mutex: MutexId) -> WaitResult {
        let mut lock = self.kernel.lock();
        self.wait_locked(&mut lock, mutex)
    }

    pub fn wait_locked(&self, lock: &mut CpuLockGuard<'_, P>, mutex: MutexId) -> WaitResult {
        self.wait_timeout_locked(lock, mutex, Timeout::INFINITE)
    }

    /// [`Self::wait`] with a timeout. `mutex` is reacquired even if the wait
    /// times out.
    ///
    /// Panics if `timeout` is [`Timeout::IMMEDIATE`].
    pub fn wait_timeout(&self, mutex: MutexId, timeout: Timeout) -> WaitResult {
        let mut lock = self.kernel.lock();
        self.wait_timeout_locked(&mut lock, mutex, timeout)
    }

    pub fn wait_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        mutex: MutexId,
        timeout: Timeout,
    ) -> WaitResult {
        lock.expect_thread_context();
        assert!(
            !timeout.is_immediate(),
            "a condition variable can't be waited on without blocking"
        );

        {
            let st = self.kernel.state(lock);
            let current = st.current;
            if let Some(next) = st.mutex_unlock_core(current, mutex) {
                st.mutex_grant(next);
            }
            st.condvars[self.id]
                .wait_queue
                .insert(&mut st.threads, current);
        }

        let result = self.kernel.sleep_timeout_locked(
            lock,
            ThreadState::Waiting(WaitObject::CondVar(self.id)),
            timeout,
        );

        self.kernel.mutex(mutex).lock_locked(lock);

        result
    }

    /// Wake up the highest-priority waiter.
    pub fn signal(&self) {
        let mut lock = self.kernel.lock();
        self.signal_locked(&mut lock);
    }

    pub fn signal_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.kernel.state(lock);
        if let Some(thread) = st.condvars[self.id].wait_queue.pop_front(&mut st.threads) {
            self.kernel.wakeup_locked(lock, thread, Ok(()));
        }
    }

    /// Wake up the highest-priority waiter without rescheduling.
    pub fn signal_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.kernel.state(lock);
        if let Some(thread) = st.condvars[self.id].wait_queue.pop_front(&mut st.threads) {
            st.threads[thread].wakeup_result = Ok(());
            st.ready(thread);
        }
    }

    /// Wake up every waiter with [`WaitError::Reset`].
    pub fn broadcast(&self) {
        let mut lock = self.kernel.lock();
        self.broadcast_locked(&mut lock);
    }

    pub fn broadcast_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        self.broadcast_from_isr(lock);
        self.kernel.reschedule_locked(lock);
    }

    pub fn broadcast_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        self.kernel.state(lock).condvar_wake_all(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::new_kernel, ThreadAttr};

    #[test]
    fn signal_and_broadcast_order() {
        let kernel = new_kernel();
        let id = kernel.create_condvar();
        let cv = kernel.condvar(id);

        // Nothing to wake up
        cv.signal();
        cv.broadcast();

        let mut lock = kernel.lock_cpu().unwrap();
        let threads = [4, 9, 4].map(|priority| {
            kernel.create_thread_from_isr(&mut lock, ThreadAttr { name: "w", priority })
        });
        let st = kernel.state(&mut lock);
        for &t in &threads {
            st.threads[t].state = ThreadState::Waiting(WaitObject::CondVar(id));
            st.condvars[id].wait_queue.insert(&mut st.threads, t);
        }

        cv.signal_from_isr(&mut lock);
        let st = kernel.state(&mut lock);
        assert_eq!(st.threads[threads[1]].state, ThreadState::Ready);
        assert_eq!(st.threads[threads[1]].wakeup_result, Ok(()));

        cv.broadcast_from_isr(&mut lock);
        let st = kernel.state(&mut lock);
        for t in [threads[0], threads[2]] {
            assert_eq!(st.threads[t].wakeup_result, Err(WaitError::Reset));
        }
        assert_eq!(
            st.ready_queue.iter(&st.threads).collect::<Vec<_>>(),
            [threads[1], threads[0], threads[2], st.idle]
        );
        drop(lock);

        kernel.delete_condvar(id);
    }

    #[test]
    #[should_panic(expected = "is not owned by the calling thread")]
    fn wait_requires_mutex() {
        let kernel = new_kernel();
        let cv = kernel.condvar(kernel.create_condvar());
        let m = kernel.create_mutex();
        let _ = cv.wait(m);
    }

    #[test]
    #[should_panic(expected = "without blocking")]
    fn immediate_wait() {
        let kernel = new_kernel();
        let cv = kernel.condvar(kernel.create_condvar());
        let m = kernel.create_mutex();
        kernel.mutex(m).lock();
        let _ = cv.wait_timeout(m, Timeout::IMMEDIATE);
    }
}
