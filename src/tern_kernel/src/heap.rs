//! A first-fit memory heap
//!
//! Free blocks form a singly linked list sorted by address. Every block, free
//! or allocated, starts with a [`Header`]. In a free block the header links to
//! the next free block; in an allocated block it points back to the owning
//! heap, so that [`Heap::free`] only needs the block's address.
use core::{fmt, mem, ptr::NonNull};

use crate::{error::HeapIntegrityError, utils::align_up};

mod provider;

pub use self::provider::{BlockProvider, MemoryCore};

/// The allocation granularity, which equals the size of a block header (two
/// machine words). Every block address and size is a multiple of it.
pub const ALLOC_UNIT: usize = mem::size_of::<Header>();

#[doc = svgbobdoc::transform!(
/// A block header.
///
/// ```svgbob
///        free block                     allocated block
///  .---------+---------+------.   .---------+---------+------------.
///  | next    | size    | ...  |   | heap    | size    | payload    |
///  '----+----+---------+------'   '----+----+---------+------------'
///       |                              |              ^
///       v                              v              |
///  next free block                   Heap        returned pointer
/// ```
)]
#[repr(C)]
struct Header {
    link: HeaderLink,
    /// The size of the block, excluding the header
    size: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
union HeaderLink {
    /// Free blocks: the next free block
    next: Option<NonNull<Header>>,
    /// Allocated blocks: the owning heap
    heap: *const Heap,
}

/// A summary of a heap's free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStatus {
    /// The number of free blocks.
    pub fragments: usize,
    /// The total size of the free blocks, excluding their headers.
    pub total_free: usize,
    /// The size of the largest free block, excluding its header.
    pub largest: usize,
}

/// A first-fit heap.
///
/// Memory is donated with [`Self::add_region`]. When no free block is large
/// enough, the heap requests a block from its [`BlockProvider`] (if it has
/// one). Blocks obtained that way join the free list when freed.
///
/// ```
/// use tern_kernel::{Heap, HeapStatus, ALLOC_UNIT};
///
/// #[repr(align(16))]
/// struct Region([u8; 512]);
///
/// static HEAP: Heap = Heap::new();
/// let region = Box::leak(Box::new(Region([0; 512])));
/// unsafe { HEAP.add_region(region.0.as_mut_ptr(), 512) };
///
/// let p = HEAP.allocate(20).unwrap();
/// assert!(unsafe { Heap::usable_size(p) } >= 20);
/// unsafe { Heap::free(p) };
///
/// assert_eq!(HEAP.status().fragments, 1);
/// assert_eq!(HEAP.status().total_free, 512 - ALLOC_UNIT);
/// ```
pub struct Heap {
    free: spin::Mutex<FreeList>,
    provider: Option<&'static dyn BlockProvider>,
}

struct FreeList {
    first: Option<NonNull<Header>>,
}

// Safety: The free blocks are owned by the heap
unsafe impl Send for FreeList {}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Heap")
            .field("status", &self.status())
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Construct an empty heap without a block provider.
    pub const fn new() -> Self {
        Self {
            free: spin::Mutex::new(FreeList { first: None }),
            provider: None,
        }
    }

    /// Construct an empty heap that falls back to `provider`.
    pub const fn with_provider(provider: &'static dyn BlockProvider) -> Self {
        Self {
            free: spin::Mutex::new(FreeList { first: None }),
            provider: Some(provider),
        }
    }

    /// Donate the memory region `start..start + len` to the heap. The parts
    /// of the region that don't fit the allocation unit are ignored, and so is
    /// a region too small to hold a header and one unit.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes and must not be in use
    /// by anything else, including another heap.
    pub unsafe fn add_region(&self, start: *mut u8, len: usize) {
        let addr = start as usize;
        let Some(aligned) = align_up(addr, ALLOC_UNIT) else {
            return;
        };
        let Some(len) = len.checked_sub(aligned - addr) else {
            return;
        };
        let len = len & !(ALLOC_UNIT - 1);
        if len < ALLOC_UNIT * 2 {
            return;
        }

        let block = start.wrapping_add(aligned - addr).cast::<Header>();
        // Safety: `block` is in the region, which the caller lends us
        unsafe {
            block.write(Header {
                link: HeaderLink { next: None },
                size: len - ALLOC_UNIT,
            });
            self.insert_free(NonNull::new_unchecked(block));
        }
    }

    /// Allocate `size` bytes aligned to [`ALLOC_UNIT`].
    pub fn allocate(&'static self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned(size, ALLOC_UNIT)
    }

    /// Allocate `size` bytes aligned to `align`, a power of two. Alignments
    /// below [`ALLOC_UNIT`] are raised to it.
    pub fn allocate_aligned(&'static self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let align = align.max(ALLOC_UNIT);
        let size = align_up(size.max(1), ALLOC_UNIT)?;

        if let Some(p) = self.allocate_from_free_list(size, align) {
            return Some(p);
        }

        let provider = self.provider?;
        let block = provider.allocate(size.checked_add(ALLOC_UNIT)?, align, ALLOC_UNIT)?;
        log::trace!("heap: took a block of {size} bytes from the provider");

        let header = block.cast::<Header>();
        // Safety: The provider gave us `size + ALLOC_UNIT` bytes
        unsafe {
            header.as_ptr().write(Header {
                link: HeaderLink { heap: self },
                size,
            });
            Some(payload_of(header))
        }
    }

    fn allocate_from_free_list(&'static self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut free = self.free.lock();

        let mut prev: Option<NonNull<Header>> = None;
        let mut cursor = free.first;

        // Safety: The blocks in the free list are owned by us
        unsafe {
            while let Some(block) = cursor {
                let start = block.as_ptr() as usize;
                let body = start + ALLOC_UNIT;
                let end = body + (*block.as_ptr()).size;
                let next = (*block.as_ptr()).link.next;

                let fit = payload_address(start, align)
                    .filter(|&p| p.checked_add(size).map_or(false, |e| e <= end));
                let Some(p) = fit else {
                    prev = Some(block);
                    cursor = next;
                    continue;
                };

                let header = (p - ALLOC_UNIT) as *mut Header;

                // `after` is the free block the tail fragment (if any) should
                // follow
                let after = if p == body {
                    // The whole block is taken; unlink it
                    match prev {
                        Some(prev) => (*prev.as_ptr()).link.next = next,
                        None => free.first = next,
                    }
                    prev
                } else {
                    // Keep the leading fragment in place
                    (*block.as_ptr()).size = p - body - ALLOC_UNIT;
                    Some(block)
                };

                let mut granted = size;
                let remaining = end - (p + size);
                if remaining >= ALLOC_UNIT * 2 {
                    let tail = NonNull::new_unchecked((p + size) as *mut Header);
                    tail.as_ptr().write(Header {
                        link: HeaderLink { next },
                        size: remaining - ALLOC_UNIT,
                    });
                    match after {
                        Some(after) => (*after.as_ptr()).link.next = Some(tail),
                        None => free.first = Some(tail),
                    }
                } else {
                    // Too small to be a block of its own
                    granted += remaining;
                }

                header.write(Header {
                    link: HeaderLink { heap: self },
                    size: granted,
                });
                return Some(payload_of(NonNull::new_unchecked(header)));
            }
        }

        None
    }

    /// Return a block to the heap it was allocated from.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate`] or
    /// [`Self::allocate_aligned`] and not freed since.
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: Upheld by the caller
        unsafe {
            let header = header_of(ptr);
            let heap = &*(*header.as_ptr()).link.heap;
            heap.insert_free(header);
        }
    }

    /// Get the size of the block `ptr` points to. It can be larger than
    /// requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be an allocated block, as in [`Self::free`].
    pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
        // Safety: Upheld by the caller
        unsafe { (*header_of(ptr).as_ptr()).size }
    }

    /// Insert `block` into the free list, merging it with its neighbors.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid header of a block not in the free list.
    unsafe fn insert_free(&self, block: NonNull<Header>) {
        let mut free = self.free.lock();

        // Safety: The blocks in the free list are owned by us, and the caller
        // gives us `block`
        unsafe {
            // Find the last free block below `block`
            let mut prev: Option<NonNull<Header>> = None;
            let mut next = free.first;
            while let Some(p) = next {
                if p >= block {
                    break;
                }
                prev = Some(p);
                next = (*p.as_ptr()).link.next;
            }

            debug_assert!(
                next.map_or(true, |n| end_of(block) <= n.as_ptr() as usize),
                "freed block overlaps a free block"
            );

            (*block.as_ptr()).link.next = next;
            match prev {
                Some(prev) => (*prev.as_ptr()).link.next = Some(block),
                None => free.first = Some(block),
            }

            // Merge with the following block
            if let Some(n) = next {
                if end_of(block) == n.as_ptr() as usize {
                    (*block.as_ptr()).size += ALLOC_UNIT + (*n.as_ptr()).size;
                    (*block.as_ptr()).link.next = (*n.as_ptr()).link.next;
                }
            }

            // Merge with the preceding block
            if let Some(p) = prev {
                if end_of(p) == block.as_ptr() as usize {
                    (*p.as_ptr()).size += ALLOC_UNIT + (*block.as_ptr()).size;
                    (*p.as_ptr()).link.next = (*block.as_ptr()).link.next;
                }
            }
        }
    }

    /// Get a summary of the free list.
    pub fn status(&self) -> HeapStatus {
        let free = self.free.lock();
        let mut status = HeapStatus::default();
        let mut cursor = free.first;
        while let Some(block) = cursor {
            // Safety: The blocks in the free list are owned by us
            let (size, next) = unsafe { ((*block.as_ptr()).size, (*block.as_ptr()).link.next) };
            status.fragments += 1;
            status.total_free += size;
            status.largest = status.largest.max(size);
            cursor = next;
        }
        status
    }

    /// Verify the structure of the free list: the blocks are aligned, sorted
    /// by address, disjoint, and fully coalesced.
    pub fn check_integrity(&self) -> Result<(), HeapIntegrityError> {
        let free = self.free.lock();
        let mut cursor = free.first;
        while let Some(block) = cursor {
            let addr = block.as_ptr() as usize;
            // Safety: The blocks in the free list are owned by us
            let (size, next) = unsafe { ((*block.as_ptr()).size, (*block.as_ptr()).link.next) };
            if addr % ALLOC_UNIT != 0 || size % ALLOC_UNIT != 0 {
                return Err(HeapIntegrityError::Misaligned);
            }
            if let Some(n) = next {
                let end = addr + ALLOC_UNIT + size;
                let n = n.as_ptr() as usize;
                if n == end {
                    return Err(HeapIntegrityError::Uncoalesced);
                }
                if n < end {
                    return Err(HeapIntegrityError::Unordered);
                }
            }
            cursor = next;
        }
        Ok(())
    }
}

/// # Safety
///
/// `header` must point to a valid header.
unsafe fn end_of(header: NonNull<Header>) -> usize {
    // Safety: Upheld by the caller
    header.as_ptr() as usize + ALLOC_UNIT + unsafe { (*header.as_ptr()).size }
}

fn payload_of(header: NonNull<Header>) -> NonNull<u8> {
    // Safety: The payload follows the header, so the address is non-null
    unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(ALLOC_UNIT)) }
}

/// Find the payload address for an allocation aligned to `align` in the free
/// block at `start`. A leading fragment must be able to hold a header and one
/// unit.
fn payload_address(start: usize, align: usize) -> Option<usize> {
    let body = start + ALLOC_UNIT;
    let mut p = align_up(body, align)?;
    if p != body {
        while p - start < ALLOC_UNIT * 3 {
            p = p.checked_add(align)?;
        }
    }
    Some(p)
}

fn header_of(payload: NonNull<u8>) -> NonNull<Header> {
    // Safety: The header precedes the payload, at a non-null address
    unsafe { NonNull::new_unchecked(payload.as_ptr().sub(ALLOC_UNIT).cast::<Header>()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    /// Backing storage aligned to the allocation unit
    #[derive(Clone, Copy)]
    #[repr(C, align(16))]
    struct Unit([usize; 2]);

    fn new_heap(units: usize) -> (&'static Heap, usize) {
        let heap: &'static Heap = Box::leak(Box::new(Heap::new()));
        let region = Box::leak(vec![Unit([0; 2]); units].into_boxed_slice());
        let start = region.as_mut_ptr().cast::<u8>();
        unsafe { heap.add_region(start, units * ALLOC_UNIT) };
        (heap, start as usize)
    }

    #[test]
    fn unit_is_two_words() {
        assert_eq!(ALLOC_UNIT, mem::size_of::<usize>() * 2);
    }

    #[test]
    fn first_fit_split_and_coalesce() {
        let (heap, start) = new_heap(16);
        assert_eq!(
            heap.status(),
            HeapStatus {
                fragments: 1,
                total_free: 15 * ALLOC_UNIT,
                largest: 15 * ALLOC_UNIT
            }
        );

        let a = heap.allocate(1).unwrap();
        assert_eq!(a.as_ptr() as usize, start + ALLOC_UNIT);
        assert_eq!(unsafe { Heap::usable_size(a) }, ALLOC_UNIT);

        let b = heap.allocate(ALLOC_UNIT * 3).unwrap();
        let c = heap.allocate(ALLOC_UNIT).unwrap();
        assert_eq!(heap.status().total_free, (15 - 2 - 4 - 2) * ALLOC_UNIT);

        // Free in an order that exercises both merge directions
        unsafe { Heap::free(a) };
        unsafe { Heap::free(c) };
        assert_eq!(heap.status().fragments, 2);
        heap.check_integrity().unwrap();
        unsafe { Heap::free(b) };
        assert_eq!(heap.status().fragments, 1);
        assert_eq!(heap.status().total_free, 15 * ALLOC_UNIT);
        heap.check_integrity().unwrap();
    }

    #[test]
    fn slack_is_granted() {
        let (heap, _) = new_heap(4);
        // 3 units free; taking 2 leaves a single unit, which can't be a block
        let a = heap.allocate(ALLOC_UNIT * 2).unwrap();
        assert_eq!(unsafe { Heap::usable_size(a) }, ALLOC_UNIT * 3);
        assert_eq!(heap.status().fragments, 0);
        assert_eq!(heap.allocate(1), None);
        unsafe { Heap::free(a) };
        assert_eq!(heap.status().total_free, ALLOC_UNIT * 3);
    }

    #[test]
    fn aligned_allocation_keeps_leading_fragment() {
        let (heap, _) = new_heap(64);
        let align = ALLOC_UNIT * 8;
        let p = heap.allocate_aligned(10, align).unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0);
        heap.check_integrity().unwrap();
        unsafe { Heap::free(p) };
        assert_eq!(heap.status().fragments, 1);
        assert_eq!(heap.status().total_free, 63 * ALLOC_UNIT);
    }

    #[test]
    fn falls_back_to_provider() {
        static CORE: MemoryCore = MemoryCore::new();
        static HEAP: Heap = Heap::with_provider(&CORE);
        let region: &'static mut [usize] = Box::leak(vec![0usize; 64].into_boxed_slice());
        let len = region.len() * mem::size_of::<usize>();
        unsafe { CORE.init(NonNull::from(&mut region[0]).cast(), len) };

        // The heap itself has no memory
        let p = HEAP.allocate(40).unwrap();
        assert_eq!(unsafe { Heap::usable_size(p) }, align_up(40, ALLOC_UNIT).unwrap());
        unsafe { Heap::free(p) };
        assert_eq!(HEAP.status().fragments, 1);

        // Now served from the free list
        let q = HEAP.allocate(16).unwrap();
        assert_eq!(q, p);
    }

    #[test]
    fn oversized_requests_fail() {
        static CORE: MemoryCore = MemoryCore::new();
        static HEAP: Heap = Heap::with_provider(&CORE);
        let region: &'static mut [usize] = Box::leak(vec![0usize; 64].into_boxed_slice());
        let len = region.len() * mem::size_of::<usize>();
        unsafe { CORE.init(NonNull::from(&mut region[0]).cast(), len) };

        assert_eq!(HEAP.allocate(usize::MAX - 4), None);
        assert_eq!(HEAP.allocate(usize::MAX - ALLOC_UNIT + 1), None);
        assert_eq!(HEAP.allocate_aligned(16, 1 << (usize::BITS - 1)), None);

        // Nothing was consumed
        let p = HEAP.allocate(16).unwrap();
        unsafe { Heap::free(p) };
        HEAP.check_integrity().unwrap();
    }

    #[test]
    fn oversized_alignment_skips_free_blocks() {
        let (heap, _) = new_heap(16);
        assert_eq!(heap.allocate_aligned(16, 1 << (usize::BITS - 1)), None);
        assert_eq!(heap.status().total_free, 15 * ALLOC_UNIT);
    }

    #[test]
    fn integrity_errors() {
        let (heap, _) = new_heap(8);
        let a = heap.allocate(ALLOC_UNIT).unwrap();
        // Corrupt the free list by putting the allocated block in without
        // merging
        let header = header_of(a);
        {
            let mut free = heap.free.lock();
            unsafe { (*header.as_ptr()).link.next = free.first };
            free.first = Some(header);
        }
        assert_eq!(
            heap.check_integrity(),
            Err(HeapIntegrityError::Uncoalesced)
        );
    }

    /// Random allocate/free sequences keep the free list well-formed, and
    /// freeing everything restores a single block.
    #[quickcheck]
    fn random_sequence(cmds: Vec<(u8, u8)>) {
        let _ = env_logger::try_init();
        let (heap, _) = new_heap(128);
        let initial = heap.status();
        let mut live = Vec::new();

        for (op, arg) in cmds {
            if op % 3 != 0 || live.is_empty() {
                let align = ALLOC_UNIT << (arg % 3);
                if let Some(p) = heap.allocate_aligned(arg as usize, align) {
                    assert_eq!(p.as_ptr() as usize % align, 0);
                    assert!(unsafe { Heap::usable_size(p) } >= arg as usize);
                    live.push(p);
                }
            } else {
                let p = live.swap_remove(arg as usize % live.len());
                unsafe { Heap::free(p) };
            }
            heap.check_integrity().unwrap();
        }

        for p in live {
            unsafe { Heap::free(p) };
        }
        assert_eq!(heap.status(), initial);
    }
}
