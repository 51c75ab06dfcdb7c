//! Block providers backing a heap
use core::ptr::NonNull;

use crate::utils::align_up;

/// A source of memory blocks that [`Heap`](super::Heap) falls back to when
/// its free list can't satisfy a request.
pub trait BlockProvider: Sync {
    /// Allocate `size` bytes such that the address `offset` bytes past the
    /// start of the block is a multiple of `align`. `align` is a power of two.
    ///
    /// The memory is never returned to the provider.
    fn allocate(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>>;
}

/// A bump allocator carving blocks out of a single memory region.
///
/// ```
/// use core::ptr::NonNull;
/// use tern_kernel::{BlockProvider, MemoryCore};
///
/// static CORE: MemoryCore = MemoryCore::new();
/// let region = Box::leak(Box::new([0u8; 256]));
/// unsafe { CORE.init(NonNull::from(&mut region[0]), region.len()) };
///
/// let p = CORE.allocate(16, 8, 0).unwrap();
/// assert_eq!(p.as_ptr() as usize % 8, 0);
/// assert!(CORE.remaining() <= 240);
/// ```
#[derive(Debug)]
pub struct MemoryCore {
    inner: spin::Mutex<CoreInner>,
}

#[derive(Debug)]
struct CoreInner {
    next: usize,
    end: usize,
}

impl MemoryCore {
    /// Construct an empty `MemoryCore`. Every allocation fails until
    /// [`Self::init`] is called.
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(CoreInner { next: 0, end: 0 }),
        }
    }

    /// Hand the region `start..start + len` over to the allocator, replacing
    /// whatever is left of the previous one.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes and must not be used by
    /// anything else for as long as the allocated blocks are in use.
    pub unsafe fn init(&self, start: NonNull<u8>, len: usize) {
        let start = start.as_ptr() as usize;
        *self.inner.lock() = CoreInner {
            next: start,
            end: start + len,
        };
    }

    /// Get the number of bytes not handed out yet.
    pub fn remaining(&self) -> usize {
        let inner = self.inner.lock();
        inner.end - inner.next
    }
}

impl Default for MemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockProvider for MemoryCore {
    fn allocate(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let mut inner = self.inner.lock();
        if inner.end == 0 {
            return None;
        }
        let start = align_up(inner.next.checked_add(offset)?, align)? - offset;
        let end = start.checked_add(size)?;
        if end > inner.end {
            return None;
        }
        inner.next = end;
        NonNull::new(start as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump() {
        let region: &'static mut [u64; 16] = Box::leak(Box::new([0; 16]));
        let base = region.as_mut_ptr() as usize;
        let core = MemoryCore::new();
        assert_eq!(core.allocate(1, 1, 0), None);

        unsafe { core.init(NonNull::from(region).cast(), 128) };
        let a = core.allocate(3, 1, 0).unwrap().as_ptr() as usize;
        assert_eq!(a, base);

        // `b + 4` is 16-byte aligned
        let b = core.allocate(20, 16, 4).unwrap().as_ptr() as usize;
        assert_eq!((b + 4) % 16, 0);
        assert!(b >= a + 3);

        assert_eq!(core.allocate(1000, 1, 0), None);
        assert_eq!(core.remaining(), base + 128 - (b + 20));
    }
}
