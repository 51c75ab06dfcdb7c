//! Mutexes with the priority inheritance protocol
//!
//! While a thread is waiting for a mutex, the owner (and, transitively, the
//! owner of whatever mutex the owner is waiting for) runs at least at the
//! waiter's priority. Each thread keeps the mutexes it owns in a singly linked
//! list headed by `ThreadCb::last_mutex_held`, most recently locked first.
//! Mutexes must be unlocked in the reverse order of locking.
use core::fmt;

use crate::{
    klock::CpuLockGuard, state::State, thread::queue::ThreadQueue, Kernel, Port, Priority,
    ThreadId, ThreadState, WaitObject,
};

define_id! {
    /// Identifies a mutex within a [`Kernel`].
    pub struct MutexId;
}

/// *Mutex control block*
#[derive(Debug, Default)]
pub(crate) struct MutexCb {
    /// The thread that currently owns the mutex.
    pub(crate) owner: Option<ThreadId>,

    pub(crate) wait_queue: ThreadQueue,

    /// The next element in the list headed by `ThreadCb::last_mutex_held`,
    /// containing all mutexes currently held by the owner.
    pub(crate) prev_mutex_held: Option<MutexId>,
}

impl<P: Port> State<P> {
    /// Give the ownership of `mutex` to `thread`.
    fn mutex_lock_core(&mut self, mutex: MutexId, thread: ThreadId) {
        debug_assert!(self.mutexes[mutex].owner.is_none());
        let cb = &mut self.mutexes[mutex];
        cb.owner = Some(thread);

        // Push `mutex` to the list of the mutexes held by the thread
        cb.prev_mutex_held = self.threads[thread].last_mutex_held.replace(mutex);
    }

    /// Reevaluate the thread's effective priority and return the result. It's
    /// the maximum of its base priority and the priorities of the threads
    /// waiting for the mutexes it holds.
    pub(crate) fn evaluate_effective_priority(&self, thread: ThreadId) -> Priority {
        let mut priority = self.threads[thread].base_priority;
        let mut maybe_mutex = self.threads[thread].last_mutex_held;

        while let Some(mutex) = maybe_mutex {
            let cb = &self.mutexes[mutex];
            // Wait queues are sorted, so the first waiter is all we need
            if let Some(waiter) = cb.wait_queue.front() {
                priority = priority.max(self.threads[waiter].priority);
            }
            maybe_mutex = cb.prev_mutex_held;
        }

        priority
    }

    /// Raise the priority of `mutex`'s owner to `priority`, following the
    /// chain of mutexes the owners are blocked on.
    ///
    /// Each boosted thread is moved to its new position in whatever queue it's
    /// in. Returns the number of threads boosted.
    pub(crate) fn mutex_boost_chain(&mut self, mut mutex: MutexId, priority: Priority) -> usize {
        // No chain can be longer than the number of mutexes
        let bound = self.mutexes.len();
        let mut steps = 0;

        loop {
            let Some(owner) = self.mutexes[mutex].owner else {
                return steps;
            };
            if self.threads[owner].priority >= priority {
                return steps;
            }

            steps += 1;
            assert!(steps <= bound, "mutex ownership chain exceeds the number of mutexes");

            self.threads[owner].priority = priority;

            match self.threads[owner].state {
                ThreadState::Waiting(WaitObject::Mutex(next)) => {
                    self.mutexes[next]
                        .wait_queue
                        .requeue(&mut self.threads, owner);
                    mutex = next;
                }
                ThreadState::Waiting(obj) => {
                    self.with_wait_queue(obj, |queue, threads| queue.requeue(threads, owner));
                    return steps;
                }
                ThreadState::Ready => {
                    self.ready_queue.requeue(&mut self.threads, owner);
                    return steps;
                }
                _ => return steps,
            }
        }
    }

    /// Pass `mutex` on to its highest-priority waiter, or mark it as unowned
    /// if there's none. The mutex must already be detached from the previous
    /// owner's list.
    ///
    /// Returns the new owner, which the caller must wake up.
    fn mutex_unlock_unchecked(&mut self, mutex: MutexId) -> Option<ThreadId> {
        self.mutexes[mutex].owner = None;
        let next = self.mutexes[mutex].wait_queue.pop_front(&mut self.threads)?;
        self.mutex_lock_core(mutex, next);

        // The remaining waiters now boost `next`
        self.threads[next].priority = self.evaluate_effective_priority(next);

        Some(next)
    }

    /// Release `mutex`, the most recently locked mutex held by `thread`, and
    /// restore the thread's priority.
    ///
    /// Returns the new owner, which the caller must wake up.
    pub(crate) fn mutex_unlock_core(
        &mut self,
        thread: ThreadId,
        mutex: MutexId,
    ) -> Option<ThreadId> {
        assert_eq!(
            self.mutexes[mutex].owner,
            Some(thread),
            "{mutex:?} is not owned by the calling thread"
        );
        assert_eq!(
            self.threads[thread].last_mutex_held,
            Some(mutex),
            "mutexes must be unlocked in the reverse order of locking"
        );

        // Remove `mutex` from the list of the mutexes held by the thread
        self.threads[thread].last_mutex_held = self.mutexes[mutex].prev_mutex_held.take();

        let next = self.mutex_unlock_unchecked(mutex);

        self.threads[thread].priority = self.evaluate_effective_priority(thread);

        next
    }

    /// Make a thread that has just received a mutex ready.
    pub(crate) fn mutex_grant(&mut self, thread: ThreadId) {
        self.threads[thread].wakeup_result = Ok(());
        self.ready(thread);
    }
}

impl<P: Port> Kernel<P> {
    pub fn create_mutex(&self) -> MutexId {
        let mut lock = self.lock();
        self.state(&mut lock).mutexes.insert(MutexCb::default())
    }

    /// Delete a mutex. It must be unlocked.
    pub fn delete_mutex(&self, mutex: MutexId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        assert!(st.mutexes[mutex].owner.is_none(), "{mutex:?} is locked");
        st.mutexes.remove(mutex);
    }

    /// Get a handle to operate on a mutex.
    pub fn mutex(&self, id: MutexId) -> Mutex<'_, P> {
        Mutex { kernel: self, id }
    }

    /// Release every mutex the current thread owns and restore its base
    /// priority.
    pub fn unlock_all_mutexes(&self) {
        let mut lock = self.lock();
        self.unlock_all_mutexes_locked(&mut lock);
    }

    pub fn unlock_all_mutexes_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.state(lock);
        let current = st.current;
        while let Some(mutex) = st.threads[current].last_mutex_held {
            st.threads[current].last_mutex_held = st.mutexes[mutex].prev_mutex_held.take();
            if let Some(next) = st.mutex_unlock_unchecked(mutex) {
                st.mutex_grant(next);
            }
        }
        st.threads[current].priority = st.threads[current].base_priority;

        self.reschedule_locked(lock);
    }
}

/// A handle to a mutex.
pub struct Mutex<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: MutexId,
}

impl<P: Port> fmt::Debug for Mutex<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.id).finish()
    }
}

impl<'k, P: Port> Mutex<'k, P> {
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Acquire the mutex, blocking until it's available.
    ///
    /// Panics if the current thread already owns the mutex.
    pub fn lock(&self) {
        let mut lock = self.kernel.lock();
        self.lock_locked(&mut lock);
    }

    pub fn lock_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        lock.expect_thread_context();

        let blocked = {
            let st = self.kernel.state(lock);
            let current = st.current;
            match st.mutexes[self.id].owner {
                None => {
                    st.mutex_lock_core(self.id, current);
                    false
                }
                Some(owner) if owner == current => {
                    panic!("{:?} is already owned by the calling thread", self.id)
                }
                Some(_) => {
                    let priority = st.threads[current].priority;
                    st.mutex_boost_chain(self.id, priority);
                    st.mutexes[self.id]
                        .wait_queue
                        .insert(&mut st.threads, current);
                    true
                }
            }
        };

        if blocked {
            // The unlocker hands the mutex over before waking us up
            let result = self
                .kernel
                .sleep_locked(lock, ThreadState::Waiting(WaitObject::Mutex(self.id)));
            debug_assert_eq!(result, Ok(()));
        }
    }

    /// Acquire the mutex if it's unowned. Never blocks and never boosts.
    pub fn try_lock(&self) -> bool {
        let mut lock = self.kernel.lock();
        self.try_lock_locked(&mut lock)
    }

    pub fn try_lock_locked(&self, lock: &mut CpuLockGuard<'_, P>) -> bool {
        let st = self.kernel.state(lock);
        let current = st.current;
        match st.mutexes[self.id].owner {
            None => {
                st.mutex_lock_core(self.id, current);
                true
            }
            Some(owner) if owner == current => {
                panic!("{:?} is already owned by the calling thread", self.id)
            }
            Some(_) => false,
        }
    }

    /// Release the mutex, which must be the most recently locked mutex owned
    /// by the current thread. The highest-priority waiter becomes the new
    /// owner.
    pub fn unlock(&self) {
        let mut lock = self.kernel.lock();
        self.unlock_locked(&mut lock);
    }

    pub fn unlock_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        lock.expect_thread_context();

        let st = self.kernel.state(lock);
        let current = st.current;
        if let Some(next) = st.mutex_unlock_core(current, self.id) {
            st.mutex_grant(next);
        }

        // Our priority might have been lowered
        self.kernel.reschedule_locked(lock);
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        let mut lock = self.kernel.lock();
        self.kernel.state(&mut lock).mutexes[self.id].owner
    }
}
