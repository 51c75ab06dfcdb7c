//! Utility
#[macro_use]
pub(crate) mod pool;
pub(crate) mod intrusive_list;

/// Round `x` up to a multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
#[inline]
pub(crate) const fn align_up(x: usize, align: usize) -> Option<usize> {
    match x.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}
