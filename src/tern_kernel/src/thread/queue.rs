//! Priority-ordered thread queues
use crate::{
    thread::{ThreadCb, ThreadId},
    utils::{intrusive_list::ListHead, pool::Pool},
};

pub(crate) type Threads = Pool<ThreadId, ThreadCb>;

/// A queue of threads sorted by descending priority. Threads of equal
/// priority are kept in insertion order unless inserted with
/// [`Self::insert_ahead`].
///
/// The ready queue and every wait queue are `ThreadQueue`s. A thread is a
/// member of at most one of them at a time, so they all share
/// [`ThreadCb::link`].
#[derive(Debug, Default)]
pub(crate) struct ThreadQueue {
    head: ListHead<ThreadId>,
}

impl ThreadQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: ListHead::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Get the highest-priority thread.
    pub(crate) fn front(&self) -> Option<ThreadId> {
        self.head.front()
    }

    /// Insert `thread` behind every queued thread of the same or higher
    /// priority.
    pub(crate) fn insert(&mut self, threads: &mut Threads, thread: ThreadId) {
        let pri = threads[thread].priority;
        let at = self
            .head
            .iter(threads)
            .find(|&t| threads[t].priority < pri);
        self.head.insert(threads, thread, at);
    }

    /// Insert `thread` ahead of every queued thread of the same or lower
    /// priority.
    pub(crate) fn insert_ahead(&mut self, threads: &mut Threads, thread: ThreadId) {
        let pri = threads[thread].priority;
        let at = self
            .head
            .iter(threads)
            .find(|&t| threads[t].priority <= pri);
        self.head.insert(threads, thread, at);
    }

    pub(crate) fn remove(&mut self, threads: &mut Threads, thread: ThreadId) {
        self.head.remove(threads, thread);
    }

    /// Move `thread` to the position dictated by its (changed) priority.
    pub(crate) fn requeue(&mut self, threads: &mut Threads, thread: ThreadId) {
        self.remove(threads, thread);
        self.insert(threads, thread);
    }

    pub(crate) fn pop_front(&mut self, threads: &mut Threads) -> Option<ThreadId> {
        self.head.pop_front(threads)
    }

    pub(crate) fn iter<'a>(&self, threads: &'a Threads) -> impl Iterator<Item = ThreadId> + 'a {
        self.head.iter(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{priority, utils::pool::PoolId, ThreadState, TimerId};
    use quickcheck_macros::quickcheck;
    use std::collections::HashMap;

    fn new_thread(threads: &mut Threads, pri: u8) -> ThreadId {
        threads.insert(ThreadCb::new("t", pri, ThreadState::Ready, TimerId::from_index(0)))
    }

    fn snapshot(queue: &ThreadQueue, threads: &Threads) -> Vec<(u8, ThreadId)> {
        queue.iter(threads).map(|t| (threads[t].priority, t)).collect()
    }

    #[test]
    fn ahead_and_behind() {
        let mut threads = Threads::new();
        let mut queue = ThreadQueue::new();
        let a = new_thread(&mut threads, 5);
        let b = new_thread(&mut threads, 5);
        let c = new_thread(&mut threads, 9);
        let d = new_thread(&mut threads, 5);

        queue.insert(&mut threads, a);
        queue.insert(&mut threads, b);
        queue.insert(&mut threads, c);
        queue.insert_ahead(&mut threads, d);

        let order: Vec<_> = queue.iter(&threads).collect();
        assert_eq!(order, [c, d, a, b]);

        threads[a].priority = 10;
        queue.requeue(&mut threads, a);
        assert_eq!(queue.pop_front(&mut threads), Some(a));
        assert_eq!(queue.front(), Some(c));
    }

    /// Every interleaving of insertions and pops leaves the queue sorted by
    /// priority, with insertion order preserved among equals.
    #[quickcheck]
    fn sorted_with_fifo_ties(cmds: Vec<Option<u8>>) {
        let _ = env_logger::try_init();

        let mut threads = Threads::new();
        let mut queue = ThreadQueue::new();
        // insertion sequence numbers of the queued threads
        let mut seq = HashMap::new();

        for (i, cmd) in cmds.into_iter().enumerate() {
            match cmd {
                Some(pri) => {
                    let pri = pri % 8 + priority::LOWEST;
                    let t = new_thread(&mut threads, pri);
                    queue.insert(&mut threads, t);
                    seq.insert(t, i);
                }
                None => {
                    if let Some(t) = queue.pop_front(&mut threads) {
                        threads.remove(t);
                    }
                }
            }

            let snap = snapshot(&queue, &threads);
            for w in snap.windows(2) {
                let (p0, t0) = w[0];
                let (p1, t1) = w[1];
                assert!(p0 >= p1, "not sorted: {snap:?}");
                if p0 == p1 {
                    assert!(seq[&t0] < seq[&t1], "FIFO order violated: {snap:?}");
                }
            }
        }
    }
}
