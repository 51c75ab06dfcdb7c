//! Byte streams
use core::fmt;

use crate::{InputQueueId, Kernel, OutputQueueId, Port, Timeout, WaitError, WaitResult};

/// A bidirectional byte stream with blocking operations.
///
/// Drivers expose their data path through this trait so that protocol code
/// doesn't depend on how the bytes are buffered.
pub trait ByteChannel {
    /// Send a byte, blocking for at most `timeout`.
    fn put_timeout(&self, x: u8, timeout: Timeout) -> WaitResult;

    /// Receive a byte, blocking for at most `timeout`.
    fn get_timeout(&self, timeout: Timeout) -> Result<u8, WaitError>;

    /// Send the contents of `buf`, blocking for at most `timeout` in total.
    /// Returns the number of bytes sent before a timeout or a reset occurred.
    fn write_timeout(&self, buf: &[u8], timeout: Timeout) -> usize;

    /// Fill `buf`, blocking for at most `timeout` in total. Returns the number
    /// of bytes received before a timeout or a reset occurred.
    fn read_timeout(&self, buf: &mut [u8], timeout: Timeout) -> usize;

    fn put(&self, x: u8) -> WaitResult {
        self.put_timeout(x, Timeout::INFINITE)
    }

    fn get(&self) -> Result<u8, WaitError> {
        self.get_timeout(Timeout::INFINITE)
    }

    /// Send all of `buf`, blocking as long as it takes. Unlike
    /// [`OutputQueue::write`](crate::OutputQueue::write), this doesn't stop
    /// when the queue fills up.
    fn write_all(&self, buf: &[u8]) -> usize {
        self.write_timeout(buf, Timeout::INFINITE)
    }

    /// Fill `buf`, blocking as long as it takes. Unlike
    /// [`InputQueue::read`](crate::InputQueue::read), this doesn't stop when
    /// the queue runs empty.
    fn read_exact(&self, buf: &mut [u8]) -> usize {
        self.read_timeout(buf, Timeout::INFINITE)
    }
}

/// A [`ByteChannel`] backed by an input queue (receive direction) and an
/// output queue (transmit direction).
pub struct QueueChannel<'k, P: Port> {
    kernel: &'k Kernel<P>,
    input: InputQueueId,
    output: OutputQueueId,
}

impl<P: Port> fmt::Debug for QueueChannel<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueChannel")
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

impl<'k, P: Port> QueueChannel<'k, P> {
    pub fn new(kernel: &'k Kernel<P>, input: InputQueueId, output: OutputQueueId) -> Self {
        Self {
            kernel,
            input,
            output,
        }
    }

    pub fn input(&self) -> InputQueueId {
        self.input
    }

    pub fn output(&self) -> OutputQueueId {
        self.output
    }
}

impl<P: Port> ByteChannel for QueueChannel<'_, P> {
    fn put_timeout(&self, x: u8, timeout: Timeout) -> WaitResult {
        self.kernel.output_queue(self.output).put_timeout(x, timeout)
    }

    fn get_timeout(&self, timeout: Timeout) -> Result<u8, WaitError> {
        self.kernel.input_queue(self.input).get_timeout(timeout)
    }

    fn write_timeout(&self, buf: &[u8], timeout: Timeout) -> usize {
        self.kernel
            .output_queue(self.output)
            .write_timeout(buf, timeout)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout: Timeout) -> usize {
        self.kernel.input_queue(self.input).read_timeout(buf, timeout)
    }
}
