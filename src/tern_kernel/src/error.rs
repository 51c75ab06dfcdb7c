use core::fmt;

/// The reason a blocking operation ended without completing normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitError {
    /// The requested wait interval elapsed.
    Timeout,
    /// The object was reset (or, for a condition variable, broadcast) while
    /// the caller was waiting on it.
    Reset,
}

/// The outcome of a blocking operation.
pub type WaitResult = Result<(), WaitError>;

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timed out",
            Self::Reset => "object was reset",
        })
    }
}

/// The kernel lock is already held by the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BadContextError;

impl fmt::Display for BadContextError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("the kernel lock is already held")
    }
}

/// An input queue has no room for another byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFullError;

impl fmt::Display for QueueFullError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("queue is full")
    }
}

/// An output queue has no byte to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueEmptyError;

impl fmt::Display for QueueEmptyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("queue is empty")
    }
}

/// A structural defect found by [`Heap::check_integrity`].
///
/// [`Heap::check_integrity`]: crate::Heap::check_integrity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapIntegrityError {
    /// Free blocks are not in ascending address order, or overlap.
    Unordered,
    /// Two adjacent free blocks were not merged.
    Uncoalesced,
    /// A free block is not aligned to the allocation unit.
    Misaligned,
}

impl fmt::Display for HeapIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Unordered => "free list is not address-ordered",
            Self::Uncoalesced => "adjacent free blocks were not coalesced",
            Self::Misaligned => "free block is misaligned",
        })
    }
}
