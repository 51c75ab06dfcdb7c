//! The scheduler
//!
//! The running thread is never in the ready queue. It leaves the CPU in one
//! of two ways:
//!
//!  - It *sleeps* ([`Kernel::sleep_locked`]): it moves to a non-ready state
//!    and the head of the ready queue takes over. Every blocking operation of
//!    the kernel funnels through here.
//!  - It is *preempted* ([`Kernel::do_preemption`]): it goes back to the
//!    ready queue because a thread of higher priority (or an equal-priority
//!    peer, once its time quantum expires) is ready.
//!
//! Nothing reschedules implicitly. Operations that make threads ready either
//! switch by themselves (S-class) or leave the decision to a later
//! [`Kernel::reschedule_locked`] or [`Kernel::interrupt_epilogue`] call
//! (I-class).
use crate::{
    klock::CpuLockGuard,
    state::State,
    thread::queue::{ThreadQueue, Threads},
    Kernel, Port, SemaphoreId, ThreadId, ThreadState, Timeout, WaitError, WaitObject, WaitResult,
};

impl<P: Port> State<P> {
    /// Insert `thread` into the ready queue behind the threads of the same
    /// priority. Does not reschedule.
    pub(crate) fn ready(&mut self, thread: ThreadId) {
        debug_assert!(
            !matches!(
                self.threads[thread].state,
                ThreadState::Ready | ThreadState::Running | ThreadState::Final
            ),
            "{thread:?} can't be made ready from {:?}",
            self.threads[thread].state
        );
        self.threads[thread].state = ThreadState::Ready;
        self.ready_queue.insert(&mut self.threads, thread);
    }

    /// Put the thread that just gave up the CPU behind its equal-priority
    /// peers. Used when its time quantum expired or it yielded.
    pub(crate) fn ready_behind(&mut self, thread: ThreadId) {
        debug_assert_eq!(self.threads[thread].state, ThreadState::Running);
        self.threads[thread].state = ThreadState::Ready;
        self.ready_queue.insert(&mut self.threads, thread);
    }

    /// Insert `thread` into the ready queue ahead of the threads of the same
    /// priority. Used for a preempted thread, which hasn't finished its turn.
    pub(crate) fn ready_ahead(&mut self, thread: ThreadId) {
        self.threads[thread].state = ThreadState::Ready;
        self.ready_queue.insert_ahead(&mut self.threads, thread);
    }

    /// Remove the head of the ready queue and make it the running thread. The
    /// caller is responsible for the old running thread's state.
    pub(crate) fn take_ready_head(&mut self) -> ThreadId {
        let Some(next) = self.ready_queue.pop_front(&mut self.threads) else {
            // The idle thread is always ready when nothing else is
            panic!("the ready queue is empty");
        };
        self.threads[next].state = ThreadState::Running;
        self.current = next;
        next
    }

    pub(crate) fn is_preemption_required(&self) -> bool {
        let Some(head) = self.ready_queue.front() else {
            return false;
        };
        let head = &self.threads[head];
        let current = &self.threads[self.current];
        if self.cfg.time_quantum > 0 && current.quantum == 0 {
            head.priority >= current.priority
        } else {
            head.priority > current.priority
        }
    }

    /// Apply `f` to the wait queue `obj` refers to.
    pub(crate) fn with_wait_queue<R>(
        &mut self,
        obj: WaitObject,
        f: impl FnOnce(&mut ThreadQueue, &mut Threads) -> R,
    ) -> R {
        let queue = match obj {
            WaitObject::Semaphore(sem) => &mut self.semaphores[sem].wait_queue,
            WaitObject::Mutex(mutex) => &mut self.mutexes[mutex].wait_queue,
            WaitObject::CondVar(cv) => &mut self.condvars[cv].wait_queue,
            WaitObject::WaitQueue(q) => &mut self.wait_queues[q].wait_queue,
            WaitObject::InputQueue(q) => &mut self.semaphores[self.input_queues[q].sem].wait_queue,
            WaitObject::OutputQueue(q) => {
                &mut self.semaphores[self.output_queues[q].sem].wait_queue
            }
        };
        f(queue, &mut self.threads)
    }

    /// Get the semaphore whose counter accounts for a thread waiting on `obj`.
    fn counting_semaphore(&self, obj: WaitObject) -> Option<SemaphoreId> {
        match obj {
            WaitObject::Semaphore(sem) => Some(sem),
            WaitObject::InputQueue(q) => Some(self.input_queues[q].sem),
            WaitObject::OutputQueue(q) => Some(self.output_queues[q].sem),
            WaitObject::Mutex(_) | WaitObject::CondVar(_) | WaitObject::WaitQueue(_) => None,
        }
    }

    /// Detach a blocked thread from the object it's waiting on, undoing the
    /// bookkeeping the wait operation did.
    pub(crate) fn abort_wait(&mut self, thread: ThreadId) {
        match self.threads[thread].state {
            ThreadState::Waiting(WaitObject::Mutex(_)) => {
                unreachable!("mutex waits can't be aborted")
            }
            ThreadState::Waiting(obj) => {
                if let Some(sem) = self.counting_semaphore(obj) {
                    self.semaphores[sem].counter += 1;
                }
                self.with_wait_queue(obj, |queue, threads| queue.remove(threads, thread));
            }
            ThreadState::Sleeping | ThreadState::Suspended => {}
            state => unreachable!("{thread:?} is not blocked ({state:?})"),
        }
    }

    /// Handle the expiration of `thread`'s timeout.
    pub(crate) fn timeout_expired(&mut self, thread: ThreadId) {
        // Someone readied the thread in the same critical section that made
        // the timeout overdue
        if self.threads[thread].state == ThreadState::Ready {
            return;
        }
        self.abort_wait(thread);
        self.threads[thread].wakeup_result = Err(WaitError::Timeout);
        self.ready(thread);
    }
}

impl<P: Port> Kernel<P> {
    /// Transfer the CPU from `old` to `new`. The caller must have made `new`
    /// the running thread already.
    pub(crate) fn switch_context(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        old: ThreadId,
        new: ThreadId,
    ) {
        lock.expect_thread_context();
        log::trace!("switching context from {old:?} to {new:?}");
        lock.park_token();
        // Safety: CPU Lock active, and `old` is the thread running this code
        unsafe { self.port.switch_context(old, new) };
        lock.unpark_token();
    }

    /// Put the current thread to sleep in `new_state` and run the next ready
    /// thread. Returns the result passed by whoever wakes the thread up.
    ///
    /// The caller must have registered the thread with whatever is going to
    /// wake it up.
    pub(crate) fn sleep_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        new_state: ThreadState,
    ) -> WaitResult {
        lock.expect_thread_context();

        let (old, new) = {
            let st = self.state(lock);
            let old = st.current;
            debug_assert_ne!(old, st.idle, "the idle thread must not block");
            let t = &mut st.threads[old];
            t.state = new_state;
            // A thread giving up the CPU gets a fresh time slice when it
            // wakes up
            t.quantum = st.cfg.time_quantum;
            (old, st.take_ready_head())
        };

        self.switch_context(lock, old, new);

        self.state(lock).threads[old].wakeup_result
    }

    /// [`Self::sleep_locked`] with a timeout. On expiration, the thread is
    /// removed from the wait structure implied by `new_state` and woken with
    /// [`WaitError::Timeout`].
    ///
    /// [`Timeout::IMMEDIATE`] performs the expiration clean-up right away
    /// without giving up the CPU.
    pub(crate) fn sleep_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        new_state: ThreadState,
        timeout: Timeout,
    ) -> WaitResult {
        lock.expect_thread_context();

        let Some(ticks) = timeout.as_ticks() else {
            return self.sleep_locked(lock, new_state);
        };

        let timer = {
            let st = self.state(lock);
            let current = st.current;
            if ticks == 0 {
                st.threads[current].state = new_state;
                st.abort_wait(current);
                st.threads[current].state = ThreadState::Running;
                return Err(WaitError::Timeout);
            }

            let timer = st.threads[current].timeout;
            st.vt_enqueue(&self.port, timer, ticks);
            timer
        };

        let result = self.sleep_locked(lock, new_state);

        let st = self.state(lock);
        if st.timers[timer].is_armed() {
            st.vt_dequeue(&self.port, timer);
        }

        result
    }

    /// Wake up a blocked thread that has already been detached from what it
    /// was waiting for.
    ///
    /// If `thread` has a higher priority than the running thread, it's
    /// dispatched immediately, and the running thread goes back to the ready
    /// queue ahead of its peers. Otherwise it's just made ready.
    pub(crate) fn wakeup_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        thread: ThreadId,
        result: WaitResult,
    ) {
        lock.expect_thread_context();

        let switch = {
            let st = self.state(lock);
            st.threads[thread].wakeup_result = result;
            let current = st.current;
            if st.threads[thread].priority <= st.threads[current].priority {
                st.ready(thread);
                None
            } else {
                st.ready_ahead(current);
                st.threads[thread].state = ThreadState::Running;
                st.current = thread;
                Some((current, thread))
            }
        };

        if let Some((old, new)) = switch {
            self.switch_context(lock, old, new);
        }
    }

    /// Switch to the head of the ready queue if it should preempt the running
    /// thread.
    pub fn reschedule_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        if self.is_preemption_required(lock) {
            self.do_preemption(lock);
        }
    }

    /// Return a flag indicating whether the head of the ready queue should
    /// preempt the running thread: it has a higher priority, or it has the
    /// same priority and the running thread's time quantum has expired.
    pub fn is_preemption_required(&self, lock: &mut CpuLockGuard<'_, P>) -> bool {
        self.state(lock).is_preemption_required()
    }

    /// Preempt the running thread in favor of the head of the ready queue.
    ///
    /// The preempted thread goes back to the ready queue ahead of its peers if
    /// it has some time quantum left, and behind them (with a new quantum) if
    /// it doesn't.
    pub fn do_preemption(&self, lock: &mut CpuLockGuard<'_, P>) {
        lock.expect_thread_context();

        let (old, new) = {
            let st = self.state(lock);
            let old = st.current;
            let new = st.take_ready_head();
            if st.cfg.time_quantum > 0 && st.threads[old].quantum == 0 {
                st.threads[old].quantum = st.cfg.time_quantum;
                st.ready_behind(old);
            } else {
                st.ready_ahead(old);
            }
            (old, new)
        };

        self.switch_context(lock, old, new);
    }

    /// The post-interrupt hook. The port calls this in the context of the
    /// interrupted thread after an interrupt handler has released the kernel
    /// lock.
    pub fn interrupt_epilogue(&self) {
        let mut lock = self.lock();
        if self.is_preemption_required(&mut lock) {
            self.do_preemption(&mut lock);
        }
    }

    /// Consume one tick of the running thread's time quantum. A port with a
    /// periodic tick interrupt calls this on every tick if round-robin
    /// scheduling is in use.
    pub fn quantum_tick_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.state(lock);
        let current = st.current;
        let t = &mut st.threads[current];
        t.quantum = t.quantum.saturating_sub(1);
    }

    /// Make a [`Suspended`](ThreadState::Suspended) thread ready, delivering
    /// `result` as the return value of [`Self::suspend_locked`]. Does not
    /// reschedule.
    pub fn ready_from_isr(&self, lock: &mut CpuLockGuard<'_, P>, thread: ThreadId, result: WaitResult) {
        let st = self.state(lock);
        assert_eq!(
            st.threads[thread].state,
            ThreadState::Suspended,
            "{thread:?} is not suspended"
        );
        st.threads[thread].wakeup_result = result;
        st.ready(thread);
    }

    /// Resume a [`Suspended`](ThreadState::Suspended) thread from thread
    /// context. It's dispatched immediately if its priority is higher.
    pub fn resume_locked(&self, lock: &mut CpuLockGuard<'_, P>, thread: ThreadId, result: WaitResult) {
        let state = self.state(lock).threads[thread].state;
        assert_eq!(state, ThreadState::Suspended, "{thread:?} is not suspended");
        self.wakeup_locked(lock, thread, result);
    }

    /// Suspend the current thread until another context resumes it with
    /// [`Self::ready_from_isr`] or [`Self::resume_locked`], or until `timeout`
    /// expires.
    ///
    /// This is the building block for a driver waiting for an interrupt: the
    /// driver records [`Self::current_thread`] before suspending, and the
    /// interrupt handler resumes that thread.
    pub fn suspend_locked(&self, lock: &mut CpuLockGuard<'_, P>, timeout: Timeout) -> WaitResult {
        self.sleep_timeout_locked(lock, ThreadState::Suspended, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::new_kernel_with, KernelCfg, ThreadAttr};

    fn spawn(kernel: &Kernel<crate::test_utils::TestPort>, priority: u8) -> ThreadId {
        let mut lock = kernel.lock_cpu().unwrap();
        kernel.create_thread_from_isr(
            &mut lock,
            ThreadAttr {
                name: "t",
                priority,
            },
        )
    }

    #[test]
    fn preemption_rules() {
        let kernel = new_kernel_with(KernelCfg::new().time_quantum(2).main_priority(10));
        let peer = spawn(&kernel, 10);
        let mut lock = kernel.lock_cpu().unwrap();

        kernel.state(&mut lock).ready(peer);
        // Equal priority, quantum left
        assert!(!kernel.is_preemption_required(&mut lock));

        kernel.quantum_tick_from_isr(&mut lock);
        assert!(!kernel.is_preemption_required(&mut lock));
        kernel.quantum_tick_from_isr(&mut lock);
        // Quantum expired
        assert!(kernel.is_preemption_required(&mut lock));

        kernel.quantum_tick_from_isr(&mut lock);
        let main = kernel.state(&mut lock).current;
        assert_eq!(kernel.state(&mut lock).threads[main].quantum, 0);
    }

    #[test]
    fn higher_priority_ignores_quantum() {
        let kernel = new_kernel_with(KernelCfg::new().time_quantum(5).main_priority(10));
        let high = spawn(&kernel, 11);
        let low = spawn(&kernel, 9);
        let mut lock = kernel.lock_cpu().unwrap();

        kernel.state(&mut lock).ready(low);
        assert!(!kernel.is_preemption_required(&mut lock));
        kernel.state(&mut lock).ready(high);
        assert!(kernel.is_preemption_required(&mut lock));
    }

    #[test]
    fn no_round_robin_when_disabled() {
        let kernel = new_kernel_with(KernelCfg::new().main_priority(10));
        let peer = spawn(&kernel, 10);
        let mut lock = kernel.lock_cpu().unwrap();
        kernel.state(&mut lock).ready(peer);
        for _ in 0..10 {
            kernel.quantum_tick_from_isr(&mut lock);
        }
        assert!(!kernel.is_preemption_required(&mut lock));
    }

    #[test]
    fn immediate_suspend_does_not_switch() {
        let kernel = new_kernel_with(KernelCfg::new());
        let main = kernel.current_thread();
        let mut lock = kernel.lock_cpu().unwrap();
        assert_eq!(
            kernel.suspend_locked(&mut lock, Timeout::IMMEDIATE),
            Err(WaitError::Timeout)
        );
        drop(lock);
        assert_eq!(kernel.thread_state(main), ThreadState::Running);
    }

    #[test]
    fn wakeup_of_lower_priority_only_readies() {
        let kernel = new_kernel_with(KernelCfg::new().main_priority(10));
        let low = spawn(&kernel, 5);
        kernel.start_thread(low);
        assert_eq!(kernel.thread_state(low), ThreadState::Ready);
        assert_eq!(kernel.ready_threads(), [low, kernel.idle_thread()]);
    }

    #[test]
    #[should_panic(expected = "is not suspended")]
    fn ready_from_isr_rejects_created_thread() {
        let kernel = new_kernel_with(KernelCfg::new());
        let t = spawn(&kernel, 5);
        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        kernel.ready_from_isr(&mut lock, t, Ok(()));
    }

    #[test]
    #[should_panic(expected = "interrupt context")]
    fn no_blocking_in_isr() {
        let kernel = new_kernel_with(KernelCfg::new());
        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        let _ = kernel.suspend_locked(&mut lock, Timeout::INFINITE);
    }
}
