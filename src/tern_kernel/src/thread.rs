//! Threads
use alloc::vec::Vec;
use core::mem;

use crate::{
    klock::CpuLockGuard,
    utils::intrusive_list::Link,
    utils::pool::Linked,
    CondVarId, InputQueueId, Kernel, MutexId, OutputQueueId, Port, SemaphoreId, Ticks, Timeout,
    TimerId, WaitError, WaitQueueId, WaitResult,
};

pub(crate) mod queue;

define_id! {
    /// Identifies a thread within a [`Kernel`].
    pub struct ThreadId;
}

/// Thread priority. A larger value means a higher priority.
pub type Priority = u8;

/// Well-known priority values.
pub mod priority {
    use super::Priority;

    /// Reserved for the idle thread.
    pub const IDLE: Priority = 0;
    /// The lowest priority available to application threads.
    pub const LOWEST: Priority = 1;
    /// The default priority of the main thread.
    pub const NORMAL: Priority = 128;
    pub const HIGHEST: Priority = Priority::MAX;
}

/// The state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Registered but not started yet.
    Created,
    /// In the ready queue.
    Ready,
    /// Currently running. Exactly one thread is in this state.
    Running,
    /// Blocked on a kernel object.
    Waiting(WaitObject),
    /// Delaying for a fixed interval.
    Sleeping,
    /// Parked by [`Kernel::suspend_locked`] until explicitly resumed.
    Suspended,
    /// Exited.
    Final,
}

/// The object a [`ThreadState::Waiting`] thread is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Semaphore(SemaphoreId),
    Mutex(MutexId),
    CondVar(CondVarId),
    InputQueue(InputQueueId),
    OutputQueue(OutputQueueId),
    WaitQueue(WaitQueueId),
}

/// The parameters of a new thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttr {
    pub name: &'static str,
    pub priority: Priority,
}

/// *Thread control block* - the state data of a thread.
#[derive(Debug)]
pub(crate) struct ThreadCb {
    pub(crate) name: &'static str,

    pub(crate) state: ThreadState,

    /// The effective priority. It's higher than `base_priority` while the
    /// thread owns a mutex that a higher-priority thread is waiting for.
    pub(crate) priority: Priority,

    pub(crate) base_priority: Priority,

    /// The link in the ready queue or the wait queue the thread is in.
    pub(crate) link: Option<Link<ThreadId>>,

    /// The most recently locked mutex still held by the thread. The rest of
    /// the held mutexes are chained by [`MutexCb::prev_mutex_held`].
    ///
    /// [`MutexCb::prev_mutex_held`]: crate::mutex::MutexCb::prev_mutex_held
    pub(crate) last_mutex_held: Option<MutexId>,

    /// The result delivered by whoever woke the thread up.
    pub(crate) wakeup_result: WaitResult,

    /// The remaining round-robin time slice.
    pub(crate) quantum: Ticks,

    /// The timer used to implement timeouts. Allocated with the thread so that
    /// blocking never allocates.
    pub(crate) timeout: TimerId,
}

impl ThreadCb {
    pub(crate) fn new(
        name: &'static str,
        priority: Priority,
        state: ThreadState,
        timeout: TimerId,
    ) -> Self {
        Self {
            name,
            state,
            priority,
            base_priority: priority,
            link: None,
            last_mutex_held: None,
            wakeup_result: Ok(()),
            quantum: 0,
            timeout,
        }
    }
}

impl Linked<ThreadId> for ThreadCb {
    fn link(&self) -> &Option<Link<ThreadId>> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Option<Link<ThreadId>> {
        &mut self.link
    }
}

impl<P: Port> Kernel<P> {
    /// Register a new thread in the [`Created`](ThreadState::Created) state.
    ///
    /// The port must prepare an execution context for the returned thread
    /// before it's started by [`Self::start_thread_locked`].
    pub fn create_thread_from_isr(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        attr: ThreadAttr,
    ) -> ThreadId {
        assert!(
            attr.priority > crate::priority::IDLE,
            "invalid thread priority {}",
            attr.priority
        );
        let thread = self
            .state(lock)
            .alloc_thread(attr.name, attr.priority, ThreadState::Created);
        log::debug!("created thread {thread:?} ({:?})", attr.name);
        thread
    }

    /// Start a [`Created`](ThreadState::Created) thread.
    pub fn start_thread(&self, thread: ThreadId) {
        let mut lock = self.lock();
        self.start_thread_locked(&mut lock, thread);
    }

    /// [`Self::start_thread`] for a caller already holding the kernel lock.
    pub fn start_thread_locked(&self, lock: &mut CpuLockGuard<'_, P>, thread: ThreadId) {
        let state = self.state(lock).threads[thread].state;
        assert_eq!(state, ThreadState::Created, "thread {thread:?} was already started");
        log::debug!("starting thread {thread:?}");
        self.wakeup_locked(lock, thread, Ok(()));
    }

    /// Terminate the current thread.
    ///
    /// The thread must not own any mutexes. See [`Port::exit_and_dispatch`]
    /// for when this method returns.
    pub fn exit_thread(&self) {
        let lock = self.lock();
        self.exit_thread_locked(lock);
    }

    /// [`Self::exit_thread`] for a caller already holding the kernel lock.
    /// The lock is passed on to the next thread.
    pub fn exit_thread_locked(&self, mut lock: CpuLockGuard<'_, P>) {
        lock.expect_thread_context();

        let (old, new) = {
            let st = self.state(&mut lock);
            let old = st.current;
            assert_ne!(old, st.idle, "the idle thread can't exit");
            assert!(
                st.threads[old].last_mutex_held.is_none(),
                "thread {old:?} exited while owning a mutex"
            );
            st.threads[old].state = ThreadState::Final;
            (old, st.take_ready_head())
        };

        log::debug!("thread {old:?} exited, dispatching {new:?}");

        // The lock now belongs to `new`
        lock.park_token();
        mem::forget(lock);

        // Safety: CPU Lock active, `old` is the running thread
        unsafe { self.port.exit_and_dispatch(old, new) };
    }

    /// Free the slots occupied by an exited thread. Its id becomes invalid.
    pub fn release_thread(&self, thread: ThreadId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        assert_eq!(
            st.threads[thread].state,
            ThreadState::Final,
            "thread {thread:?} hasn't exited"
        );
        let cb = st.threads.remove(thread);
        st.timers.remove(cb.timeout);
    }

    /// Block the current thread for `ticks` ticks. `0` returns immediately.
    pub fn delay(&self, ticks: Ticks) {
        if ticks == 0 {
            return;
        }
        let mut lock = self.lock();
        let result =
            self.sleep_timeout_locked(&mut lock, ThreadState::Sleeping, Timeout::ticks(ticks));
        debug_assert_eq!(result, Err(WaitError::Timeout));
    }

    /// Block the current thread until the system time reaches `deadline`.
    /// Returns immediately if `deadline` is not in the future.
    pub fn delay_until(&self, deadline: Ticks) {
        let mut lock = self.lock();
        let remaining = deadline.wrapping_sub(self.port.now()) as i32;
        if remaining > 0 {
            let result = self.sleep_timeout_locked(
                &mut lock,
                ThreadState::Sleeping,
                Timeout::ticks(remaining as Ticks),
            );
            debug_assert_eq!(result, Err(WaitError::Timeout));
        }
    }

    /// Relinquish the CPU to the next ready thread of the same or higher
    /// priority, if there is one.
    pub fn yield_now(&self) {
        let mut lock = self.lock();
        let switch = {
            let st = self.state(&mut lock);
            let current = st.current;
            match st.ready_queue.front() {
                Some(head) if st.threads[head].priority >= st.threads[current].priority => {
                    let new = st.take_ready_head();
                    st.threads[current].quantum = st.cfg.time_quantum;
                    st.ready_behind(current);
                    Some((current, new))
                }
                _ => None,
            }
        };
        if let Some((old, new)) = switch {
            self.switch_context(&mut lock, old, new);
        }
    }

    /// Change the current thread's base priority and return the old one.
    ///
    /// If the thread is currently boosted by priority inheritance above the
    /// new base priority, the boost stays in effect until the mutexes are
    /// released.
    pub fn set_priority(&self, new_priority: Priority) -> Priority {
        assert!(
            new_priority > crate::priority::IDLE,
            "invalid thread priority {new_priority}"
        );
        let mut lock = self.lock();
        let old = {
            let st = self.state(&mut lock);
            let t = &mut st.threads[st.current];
            let old = t.base_priority;
            if new_priority > t.priority || t.priority == t.base_priority {
                t.priority = new_priority;
            }
            t.base_priority = new_priority;
            old
        };
        self.reschedule_locked(&mut lock);
        old
    }

    /// Get the running thread.
    pub fn current_thread(&self) -> ThreadId {
        let mut lock = self.lock();
        self.state(&mut lock).current
    }

    /// Get the idle thread, whose execution context the port provides.
    pub fn idle_thread(&self) -> ThreadId {
        self.idle
    }

    /// Get a thread's effective priority.
    pub fn thread_priority(&self, thread: ThreadId) -> Priority {
        let mut lock = self.lock();
        self.state(&mut lock).threads[thread].priority
    }

    /// Get a thread's base priority, which excludes priority inheritance.
    pub fn thread_base_priority(&self, thread: ThreadId) -> Priority {
        let mut lock = self.lock();
        self.state(&mut lock).threads[thread].base_priority
    }

    pub fn thread_state(&self, thread: ThreadId) -> ThreadState {
        let mut lock = self.lock();
        self.state(&mut lock).threads[thread].state
    }

    pub fn thread_name(&self, thread: ThreadId) -> &'static str {
        let mut lock = self.lock();
        self.state(&mut lock).threads[thread].name
    }

    /// List the ready threads in the order they'll be scheduled.
    pub fn ready_threads(&self) -> Vec<ThreadId> {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        st.ready_queue.iter(&st.threads).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::new_kernel;

    #[test]
    fn boot_state() {
        let kernel = new_kernel();
        let main = kernel.current_thread();
        let idle = kernel.idle_thread();
        assert_eq!(kernel.thread_state(main), ThreadState::Running);
        assert_eq!(kernel.thread_state(idle), ThreadState::Ready);
        assert_eq!(kernel.thread_priority(main), priority::NORMAL);
        assert_eq!(kernel.thread_priority(idle), priority::IDLE);
        assert_eq!(kernel.thread_name(idle), "idle");
        assert_eq!(kernel.ready_threads(), [idle]);
    }

    #[test]
    fn created_threads_stay_out_of_ready_queue() {
        let kernel = new_kernel();
        let mut lock = kernel.lock_cpu().unwrap();
        let t = kernel.create_thread_from_isr(
            &mut lock,
            ThreadAttr {
                name: "worker",
                priority: 3,
            },
        );
        drop(lock);
        assert_eq!(kernel.thread_state(t), ThreadState::Created);
        assert_eq!(kernel.ready_threads(), [kernel.idle_thread()]);

        // Lower than main; no switch happens
        kernel.start_thread(t);
        assert_eq!(kernel.thread_state(t), ThreadState::Ready);
        assert_eq!(kernel.ready_threads(), [t, kernel.idle_thread()]);
    }

    #[test]
    #[should_panic(expected = "invalid thread priority")]
    fn idle_priority_is_reserved() {
        let kernel = new_kernel();
        let mut lock = kernel.lock_cpu().unwrap();
        kernel.create_thread_from_isr(
            &mut lock,
            ThreadAttr {
                name: "bad",
                priority: priority::IDLE,
            },
        );
    }

    #[test]
    fn set_priority_respects_boost() {
        let kernel = new_kernel();
        let main = kernel.current_thread();
        assert_eq!(kernel.set_priority(100), priority::NORMAL);
        assert_eq!(kernel.thread_priority(main), 100);

        // Simulate a boost
        {
            let mut lock = kernel.lock_cpu().unwrap();
            kernel.state(&mut lock).threads[main].priority = 200;
        }
        kernel.set_priority(50);
        assert_eq!(kernel.thread_priority(main), 200);
        assert_eq!(kernel.thread_base_priority(main), 50);

        kernel.set_priority(250);
        assert_eq!(kernel.thread_priority(main), 250);
    }

    #[test]
    fn yield_without_peers_keeps_running() {
        let kernel = new_kernel();
        let main = kernel.current_thread();
        kernel.yield_now();
        assert_eq!(kernel.current_thread(), main);
    }
}
