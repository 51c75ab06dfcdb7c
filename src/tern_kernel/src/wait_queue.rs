//! Thread wait queues
//!
//! A wait queue is the bare waiting mechanism the other objects are built on,
//! exposed for drivers that keep their own state: a thread checks a
//! condition under the kernel lock and enqueues itself, and whoever changes
//! the condition dequeues one or all waiters with a result of its choosing.
use core::fmt;

use crate::{
    klock::CpuLockGuard, state::State, thread::queue::ThreadQueue, Kernel, Port, ThreadState,
    Timeout, WaitError, WaitObject, WaitResult,
};

define_id! {
    /// Identifies a wait queue within a [`Kernel`].
    pub struct WaitQueueId;
}

/// *Wait queue control block*
#[derive(Debug, Default)]
pub(crate) struct WaitQueueCb {
    pub(crate) wait_queue: ThreadQueue,
}

impl<P: Port> State<P> {
    /// Make the first waiter of `queue` ready with `result`. Returns `false`
    /// if there was none.
    fn wait_queue_wake_one(&mut self, queue: WaitQueueId, result: WaitResult) -> bool {
        let Some(thread) = self.wait_queues[queue].wait_queue.pop_front(&mut self.threads) else {
            return false;
        };
        self.threads[thread].wakeup_result = result;
        self.ready(thread);
        true
    }
}

impl<P: Port> Kernel<P> {
    pub fn create_wait_queue(&self) -> WaitQueueId {
        let mut lock = self.lock();
        self.state(&mut lock).wait_queues.insert(WaitQueueCb::default())
    }

    /// Delete a wait queue. It must not have waiters.
    pub fn delete_wait_queue(&self, queue: WaitQueueId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        assert!(
            st.wait_queues[queue].wait_queue.is_empty(),
            "{queue:?} has waiting threads"
        );
        st.wait_queues.remove(queue);
    }

    /// Get a handle to operate on a wait queue.
    pub fn wait_queue(&self, id: WaitQueueId) -> WaitQueue<'_, P> {
        WaitQueue { kernel: self, id }
    }
}

/// A handle to a wait queue.
///
/// Waiters are kept in priority order. Every operation requires the caller to
/// hold the kernel lock, so that checking the driver's condition and
/// enqueueing happen atomically.
pub struct WaitQueue<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: WaitQueueId,
}

impl<P: Port> fmt::Debug for WaitQueue<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitQueue").field(&self.id).finish()
    }
}

impl<'k, P: Port> WaitQueue<'k, P> {
    pub fn id(&self) -> WaitQueueId {
        self.id
    }

    /// Block the current thread in the queue until it's dequeued or `timeout`
    /// expires. Returns the result passed to the dequeue operation.
    ///
    /// [`Timeout::IMMEDIATE`] fails with [`WaitError::Timeout`] right away.
    pub fn enqueue_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        timeout: Timeout,
    ) -> WaitResult {
        lock.expect_thread_context();
        if timeout.is_immediate() {
            return Err(WaitError::Timeout);
        }

        {
            let st = self.kernel.state(lock);
            let current = st.current;
            st.wait_queues[self.id]
                .wait_queue
                .insert(&mut st.threads, current);
        }

        self.kernel.sleep_timeout_locked(
            lock,
            ThreadState::Waiting(WaitObject::WaitQueue(self.id)),
            timeout,
        )
    }

    /// Wake up the highest-priority waiter with `result`. Does nothing if the
    /// queue is empty.
    pub fn dequeue_next_from_isr(&self, lock: &mut CpuLockGuard<'_, P>, result: WaitResult) {
        self.kernel.state(lock).wait_queue_wake_one(self.id, result);
    }

    /// Wake up every waiter with `result`.
    pub fn dequeue_all_from_isr(&self, lock: &mut CpuLockGuard<'_, P>, result: WaitResult) {
        let st = self.kernel.state(lock);
        while st.wait_queue_wake_one(self.id, result) {}
    }

    pub fn is_empty_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) -> bool {
        self.kernel.state(lock).wait_queues[self.id]
            .wait_queue
            .is_empty()
    }
}
