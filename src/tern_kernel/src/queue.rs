//! Byte queues connecting threads and interrupt handlers
//!
//! An [`InputQueue`] carries bytes from an interrupt handler (e.g., a UART
//! receive interrupt) to threads. An [`OutputQueue`] carries bytes the other
//! way. The thread side blocks; the interrupt side fails instead.
//!
//! Each queue counts the units available to the thread side (bytes for an
//! input queue, free slots for an output queue) with an internal counting
//! semaphore. A unit handed to a woken waiter stays reserved for it until it
//! runs, so non-blocking transfers only move units the semaphore counts as
//! available.
use alloc::{boxed::Box, vec};
use core::fmt;

use crate::{
    klock::CpuLockGuard, semaphore::SemaphoreCb, state::State, time::Deadline, CallbackFn,
    Kernel, Port, QueueEmptyError, QueueFullError, SemaphoreId, Timeout, WaitError, WaitObject,
    WaitResult,
};

define_id! {
    /// Identifies an input queue within a [`Kernel`].
    pub struct InputQueueId;
}

define_id! {
    /// Identifies an output queue within a [`Kernel`].
    pub struct OutputQueueId;
}

/// A fixed-capacity byte ring.
#[derive(Debug)]
struct RingBuffer {
    buf: Box<[u8]>,
    rd: usize,
    wr: usize,
    len: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            rd: 0,
            wr: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    fn push(&mut self, x: u8) -> Result<(), QueueFullError> {
        if self.is_full() {
            return Err(QueueFullError);
        }
        self.buf[self.wr] = x;
        self.wr += 1;
        if self.wr == self.buf.len() {
            self.wr = 0;
        }
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let x = self.buf[self.rd];
        self.rd += 1;
        if self.rd == self.buf.len() {
            self.rd = 0;
        }
        self.len -= 1;
        Some(x)
    }

    fn clear(&mut self) {
        self.rd = 0;
        self.wr = 0;
        self.len = 0;
    }
}

/// A notification callback, invoked with the kernel lock held after the
/// thread side has moved data.
type Notify<P> = (CallbackFn<P>, usize);

/// *Queue control block*, used for both directions.
pub(crate) struct QueueCb<P: Port> {
    ring: RingBuffer,

    /// Counts the units available to the thread side.
    pub(crate) sem: SemaphoreId,

    notify: Option<Notify<P>>,

    /// Incremented on every reset. A waiter whose reservation predates a
    /// reset gives up with [`WaitError::Reset`].
    epoch: usize,
}

pub(crate) type InputQueueCb<P> = QueueCb<P>;
pub(crate) type OutputQueueCb<P> = QueueCb<P>;

impl<P: Port> fmt::Debug for QueueCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("ring", &self.ring)
            .field("sem", &self.sem)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<P: Port> State<P> {
    fn queue_cb(&mut self, obj: WaitObject) -> &mut QueueCb<P> {
        match obj {
            WaitObject::InputQueue(q) => &mut self.input_queues[q],
            WaitObject::OutputQueue(q) => &mut self.output_queues[q],
            _ => unreachable!(),
        }
    }

    fn alloc_queue(
        &mut self,
        capacity: usize,
        initial: isize,
        notify: Option<Notify<P>>,
    ) -> QueueCb<P> {
        QueueCb {
            ring: RingBuffer::new(capacity),
            sem: self.semaphores.insert(SemaphoreCb::new(initial)),
            notify,
            epoch: 0,
        }
    }

    /// Empty the queue and release every waiter with [`WaitError::Reset`].
    /// `units` is the new count of units available to the thread side.
    fn queue_reset(&mut self, obj: WaitObject, units: isize) {
        let cb = self.queue_cb(obj);
        cb.ring.clear();
        cb.epoch = cb.epoch.wrapping_add(1);
        let sem = cb.sem;
        self.sem_reset(sem, units);
    }

    /// Take up to `max` units without blocking.
    fn queue_take_available(&mut self, obj: WaitObject, max: usize) -> usize {
        let sem = self.queue_cb(obj).sem;
        let cb = &mut self.semaphores[sem];
        let n = max.min(cb.counter.max(0) as usize);
        cb.counter -= n as isize;
        n
    }
}

impl<P: Port> Kernel<P> {
    /// Create an input queue of `capacity` bytes. `notify` is called after a
    /// thread has taken bytes out of the queue.
    pub fn create_input_queue(
        &self,
        capacity: usize,
        notify: Option<(CallbackFn<P>, usize)>,
    ) -> InputQueueId {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        let cb = st.alloc_queue(capacity, 0, notify);
        st.input_queues.insert(cb)
    }

    /// Create an output queue of `capacity` bytes. `notify` is called after a
    /// thread has put bytes into the queue.
    pub fn create_output_queue(
        &self,
        capacity: usize,
        notify: Option<(CallbackFn<P>, usize)>,
    ) -> OutputQueueId {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        let cb = st.alloc_queue(capacity, capacity as isize, notify);
        st.output_queues.insert(cb)
    }

    /// Delete an input queue. It must not have waiters.
    pub fn delete_input_queue(&self, queue: InputQueueId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        let sem = st.input_queues[queue].sem;
        assert!(
            st.semaphores[sem].wait_queue.is_empty(),
            "{queue:?} has waiting threads"
        );
        st.input_queues.remove(queue);
        st.semaphores.remove(sem);
    }

    /// Delete an output queue. It must not have waiters.
    pub fn delete_output_queue(&self, queue: OutputQueueId) {
        let mut lock = self.lock();
        let st = self.state(&mut lock);
        let sem = st.output_queues[queue].sem;
        assert!(
            st.semaphores[sem].wait_queue.is_empty(),
            "{queue:?} has waiting threads"
        );
        st.output_queues.remove(queue);
        st.semaphores.remove(sem);
    }

    pub fn input_queue(&self, id: InputQueueId) -> InputQueue<'_, P> {
        InputQueue { kernel: self, id }
    }

    pub fn output_queue(&self, id: OutputQueueId) -> OutputQueue<'_, P> {
        OutputQueue { kernel: self, id }
    }

    /// Reserve one unit of the queue `obj`, blocking for at most `timeout`.
    fn queue_reserve_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        obj: WaitObject,
        timeout: Timeout,
    ) -> WaitResult {
        let (sem, epoch) = {
            let cb = self.state(lock).queue_cb(obj);
            (cb.sem, cb.epoch)
        };

        self.sem_wait_locked(lock, sem, obj, timeout)?;

        // The queue was reset after we were given the unit but before we got
        // to run
        if self.state(lock).queue_cb(obj).epoch != epoch {
            return Err(WaitError::Reset);
        }

        Ok(())
    }

    fn queue_notify(&self, lock: &mut CpuLockGuard<'_, P>, obj: WaitObject) {
        if let Some((f, arg)) = self.state(lock).queue_cb(obj).notify {
            f(self, lock, arg);
        }
    }

    fn queue_len(&self, obj: WaitObject) -> usize {
        let mut lock = self.lock();
        self.state(&mut lock).queue_cb(obj).ring.len
    }

    fn queue_capacity(&self, obj: WaitObject) -> usize {
        let mut lock = self.lock();
        self.state(&mut lock).queue_cb(obj).ring.capacity()
    }
}

/// A handle to an input queue.
pub struct InputQueue<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: InputQueueId,
}

impl<P: Port> fmt::Debug for InputQueue<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("InputQueue").field(&self.id).finish()
    }
}

impl<'k, P: Port> InputQueue<'k, P> {
    pub fn id(&self) -> InputQueueId {
        self.id
    }

    fn obj(&self) -> WaitObject {
        WaitObject::InputQueue(self.id)
    }

    /// Append a byte. Called by the producer (typically an interrupt handler).
    pub fn put_from_isr(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        x: u8,
    ) -> Result<(), QueueFullError> {
        let st = self.kernel.state(lock);
        let cb = st.queue_cb(self.obj());
        cb.ring.push(x)?;
        let sem = cb.sem;
        if let Some(waiter) = st.sem_release(sem) {
            st.threads[waiter].wakeup_result = Ok(());
            st.ready(waiter);
        }
        Ok(())
    }

    /// Take a byte, blocking until one is available.
    pub fn get(&self) -> Result<u8, WaitError> {
        self.get_timeout(Timeout::INFINITE)
    }

    /// Take a byte, blocking for at most `timeout`.
    pub fn get_timeout(&self, timeout: Timeout) -> Result<u8, WaitError> {
        let mut lock = self.kernel.lock();
        self.get_timeout_locked(&mut lock, timeout)
    }

    pub fn get_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        timeout: Timeout,
    ) -> Result<u8, WaitError> {
        self.kernel.queue_reserve_locked(lock, self.obj(), timeout)?;

        let st = self.kernel.state(lock);
        let Some(x) = st.queue_cb(self.obj()).ring.pop() else {
            unreachable!("a reserved byte is missing");
        };

        self.kernel.queue_notify(lock, self.obj());
        Ok(x)
    }

    /// Take as many bytes as immediately available, up to `buf.len()`.
    /// Returns the number of bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut lock = self.kernel.lock();
        let st = self.kernel.state(&mut lock);
        let n = st.queue_take_available(self.obj(), buf.len());
        let cb = st.queue_cb(self.obj());
        for x in &mut buf[..n] {
            *x = cb.ring.pop().unwrap_or_default();
        }
        if n > 0 {
            self.kernel.queue_notify(&mut lock, self.obj());
        }
        n
    }

    /// Fill `buf`, blocking for at most `timeout` in total. Stops at the
    /// first timeout or reset. Returns the number of bytes read.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Timeout) -> usize {
        let mut lock = self.kernel.lock();
        let deadline = Deadline::new(self.kernel.now(), timeout);
        for (i, x) in buf.iter_mut().enumerate() {
            let timeout = deadline.remaining(self.kernel.now());
            match self.get_timeout_locked(&mut lock, timeout) {
                Ok(b) => *x = b,
                Err(_) => return i,
            }
        }
        buf.len()
    }

    /// Discard the contents and release every waiting thread with
    /// [`WaitError::Reset`].
    pub fn reset(&self) {
        let mut lock = self.kernel.lock();
        self.reset_locked(&mut lock);
    }

    pub fn reset_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        self.reset_from_isr(lock);
        self.kernel.reschedule_locked(lock);
    }

    pub fn reset_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        self.kernel.state(lock).queue_reset(self.obj(), 0);
    }

    /// Get the number of bytes in the queue, including the ones reserved by
    /// woken threads.
    pub fn len(&self) -> usize {
        self.kernel.queue_len(self.obj())
    }

    pub fn capacity(&self) -> usize {
        self.kernel.queue_capacity(self.obj())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

/// A handle to an output queue.
pub struct OutputQueue<'k, P: Port> {
    kernel: &'k Kernel<P>,
    id: OutputQueueId,
}

impl<P: Port> fmt::Debug for OutputQueue<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("OutputQueue").field(&self.id).finish()
    }
}

impl<'k, P: Port> OutputQueue<'k, P> {
    pub fn id(&self) -> OutputQueueId {
        self.id
    }

    fn obj(&self) -> WaitObject {
        WaitObject::OutputQueue(self.id)
    }

    /// Append a byte, blocking until there's room.
    pub fn put(&self, x: u8) -> WaitResult {
        self.put_timeout(x, Timeout::INFINITE)
    }

    /// Append a byte, blocking for at most `timeout` until there's room.
    pub fn put_timeout(&self, x: u8, timeout: Timeout) -> WaitResult {
        let mut lock = self.kernel.lock();
        self.put_timeout_locked(&mut lock, x, timeout)
    }

    pub fn put_timeout_locked(
        &self,
        lock: &mut CpuLockGuard<'_, P>,
        x: u8,
        timeout: Timeout,
    ) -> WaitResult {
        self.kernel.queue_reserve_locked(lock, self.obj(), timeout)?;

        let st = self.kernel.state(lock);
        if st.queue_cb(self.obj()).ring.push(x).is_err() {
            unreachable!("a reserved slot is missing");
        }

        self.kernel.queue_notify(lock, self.obj());
        Ok(())
    }

    /// Append as many bytes from `buf` as there's room for without blocking.
    /// Returns the number of bytes written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut lock = self.kernel.lock();
        let st = self.kernel.state(&mut lock);
        let n = st.queue_take_available(self.obj(), buf.len());
        let cb = st.queue_cb(self.obj());
        for &x in &buf[..n] {
            let _ = cb.ring.push(x);
        }
        if n > 0 {
            self.kernel.queue_notify(&mut lock, self.obj());
        }
        n
    }

    /// Append all of `buf`, blocking for at most `timeout` in total. Stops at
    /// the first timeout or reset. Returns the number of bytes written.
    pub fn write_timeout(&self, buf: &[u8], timeout: Timeout) -> usize {
        let mut lock = self.kernel.lock();
        let deadline = Deadline::new(self.kernel.now(), timeout);
        for (i, &x) in buf.iter().enumerate() {
            let timeout = deadline.remaining(self.kernel.now());
            if self.put_timeout_locked(&mut lock, x, timeout).is_err() {
                return i;
            }
        }
        buf.len()
    }

    /// Take the oldest byte. Called by the consumer (typically an interrupt
    /// handler).
    pub fn get_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) -> Result<u8, QueueEmptyError> {
        let st = self.kernel.state(lock);
        let cb = st.queue_cb(self.obj());
        let x = cb.ring.pop().ok_or(QueueEmptyError)?;
        let sem = cb.sem;
        if let Some(waiter) = st.sem_release(sem) {
            st.threads[waiter].wakeup_result = Ok(());
            st.ready(waiter);
        }
        Ok(x)
    }

    /// Discard the contents and release every waiting thread with
    /// [`WaitError::Reset`].
    pub fn reset(&self) {
        let mut lock = self.kernel.lock();
        self.reset_locked(&mut lock);
    }

    pub fn reset_locked(&self, lock: &mut CpuLockGuard<'_, P>) {
        self.reset_from_isr(lock);
        self.kernel.reschedule_locked(lock);
    }

    pub fn reset_from_isr(&self, lock: &mut CpuLockGuard<'_, P>) {
        let st = self.kernel.state(lock);
        let capacity = st.queue_cb(self.obj()).ring.capacity();
        st.queue_reset(self.obj(), capacity as isize);
    }

    /// Get the number of bytes waiting to be taken by the consumer.
    pub fn len(&self) -> usize {
        self.kernel.queue_len(self.obj())
    }

    pub fn capacity(&self) -> usize {
        self.kernel.queue_capacity(self.obj())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{new_kernel, TestPort};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ring_wraps() {
        let mut ring = RingBuffer::new(3);
        for round in 0..5u8 {
            ring.push(round).unwrap();
            ring.push(round + 100).unwrap();
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round + 100));
        }
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.push(3).unwrap();
        assert_eq!(ring.push(4), Err(QueueFullError));
        ring.clear();
        assert_eq!(ring.pop(), None);
    }

    fn count_notify(_: &Kernel<TestPort>, _: &mut CpuLockGuard<'_, TestPort>, arg: usize) {
        // Safety: `arg` points to a leaked counter
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn new_counter() -> (&'static AtomicUsize, usize) {
        let counter: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        (counter, counter as *const AtomicUsize as usize)
    }

    #[test]
    fn input_queue() {
        let _ = env_logger::try_init();
        let kernel = new_kernel();
        let (notified, arg) = new_counter();
        let notify: CallbackFn<TestPort> = count_notify;
        let q = kernel.input_queue(kernel.create_input_queue(4, Some((notify, arg))));

        assert!(q.is_empty());
        assert_eq!(q.get_timeout(Timeout::IMMEDIATE), Err(WaitError::Timeout));

        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        for x in 1..=4 {
            q.put_from_isr(&mut lock, x).unwrap();
        }
        assert_eq!(q.put_from_isr(&mut lock, 5), Err(QueueFullError));
        drop(lock);
        assert!(q.is_full());

        assert_eq!(q.get(), Ok(1));
        assert_eq!(notified.load(Ordering::Relaxed), 1);

        let mut buf = [0; 8];
        assert_eq!(q.read(&mut buf), 3);
        assert_eq!(buf[..3], [2, 3, 4]);
        // Once per bulk transfer
        assert_eq!(notified.load(Ordering::Relaxed), 2);

        // Nothing to read; no notification
        assert_eq!(q.read(&mut buf), 0);
        assert_eq!(q.read_timeout(&mut buf, Timeout::IMMEDIATE), 0);
        assert_eq!(notified.load(Ordering::Relaxed), 2);

        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        q.put_from_isr(&mut lock, 9).unwrap();
        drop(lock);
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.get_timeout(Timeout::IMMEDIATE), Err(WaitError::Timeout));
        assert_eq!(q.capacity(), 4);
    }

    #[test]
    fn output_queue() {
        let kernel = new_kernel();
        let (notified, arg) = new_counter();
        let notify: CallbackFn<TestPort> = count_notify;
        let q = kernel.output_queue(kernel.create_output_queue(3, Some((notify, arg))));

        assert_eq!(q.write(b"hello"), 3);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
        assert!(q.is_full());
        assert_eq!(q.put_timeout(b'!', Timeout::IMMEDIATE), Err(WaitError::Timeout));

        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        assert_eq!(q.get_from_isr(&mut lock), Ok(b'h'));
        drop(lock);

        assert_eq!(q.put(b'!'), Ok(()));
        assert_eq!(notified.load(Ordering::Relaxed), 2);

        let mut lock = kernel.lock_cpu_from_isr().unwrap();
        let drained: Vec<u8> = std::iter::from_fn(|| q.get_from_isr(&mut lock).ok()).collect();
        assert_eq!(drained, b"el!");
        assert_eq!(q.get_from_isr(&mut lock), Err(QueueEmptyError));
        drop(lock);

        assert_eq!(q.write_timeout(b"abcd", Timeout::IMMEDIATE), 3);
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.write(b"xyz"), 3);
    }

    #[test]
    fn deleted_queue_releases_semaphore() {
        let kernel = new_kernel();
        let q = kernel.create_input_queue(8, None);
        kernel.delete_input_queue(q);
        let mut lock = kernel.lock_cpu().unwrap();
        assert_eq!(kernel.state(&mut lock).semaphores.len(), 0);
    }
}
