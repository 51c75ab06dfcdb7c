//! The kernel state protected by the kernel lock
use crate::{
    condvar::CondVarCb,
    mutex::MutexCb,
    priority,
    queue::{InputQueueCb, OutputQueueCb},
    semaphore::SemaphoreCb,
    thread::{queue::ThreadQueue, ThreadCb, ThreadState},
    timer::{DeltaList, TimerAction, TimerCb},
    utils::pool::{Pool, PoolId},
    wait_queue::WaitQueueCb,
    CondVarId, InputQueueId, KernelCfg, MutexId, OutputQueueId, Port, Priority, SemaphoreId,
    ThreadId, TimerId, WaitQueueId,
};

/// Every kernel object of a [`Kernel`](crate::Kernel) instance.
pub(crate) struct State<P: Port> {
    pub(crate) cfg: KernelCfg,

    pub(crate) threads: Pool<ThreadId, ThreadCb>,

    /// Ready threads, excluding `current`.
    pub(crate) ready_queue: ThreadQueue,

    /// The running thread.
    pub(crate) current: ThreadId,

    pub(crate) idle: ThreadId,

    pub(crate) timers: Pool<TimerId, TimerCb<P>>,

    /// Armed timers.
    pub(crate) vt: DeltaList,

    pub(crate) semaphores: Pool<SemaphoreId, SemaphoreCb>,
    pub(crate) mutexes: Pool<MutexId, MutexCb>,
    pub(crate) condvars: Pool<CondVarId, CondVarCb>,
    pub(crate) input_queues: Pool<InputQueueId, InputQueueCb<P>>,
    pub(crate) output_queues: Pool<OutputQueueId, OutputQueueCb<P>>,
    pub(crate) wait_queues: Pool<WaitQueueId, WaitQueueCb>,
}

impl<P: Port> State<P> {
    /// Construct the boot state: the calling context becomes the running main
    /// thread, and the idle thread is ready.
    pub(crate) fn new(cfg: KernelCfg) -> Self {
        let mut this = Self {
            cfg,
            threads: Pool::new(),
            ready_queue: ThreadQueue::new(),
            // Overwritten below
            current: ThreadId::from_index(0),
            idle: ThreadId::from_index(0),
            timers: Pool::new(),
            vt: DeltaList::new(),
            semaphores: Pool::new(),
            mutexes: Pool::new(),
            condvars: Pool::new(),
            input_queues: Pool::new(),
            output_queues: Pool::new(),
            wait_queues: Pool::new(),
        };

        this.current = this.alloc_thread("main", cfg.main_priority, ThreadState::Running);

        this.idle = this.alloc_thread("idle", priority::IDLE, ThreadState::Created);
        this.ready(this.idle);

        this
    }

    /// Allocate a thread control block along with its timeout timer.
    pub(crate) fn alloc_thread(
        &mut self,
        name: &'static str,
        priority: Priority,
        state: ThreadState,
    ) -> ThreadId {
        let thread = self.threads.next_id();
        let timeout = self.timers.insert(TimerCb::new(TimerAction::Timeout(thread)));
        let allocated = self
            .threads
            .insert(ThreadCb::new(name, priority, state, timeout));
        debug_assert_eq!(allocated, thread);
        self.threads[thread].quantum = self.cfg.time_quantum;
        thread
    }
}
