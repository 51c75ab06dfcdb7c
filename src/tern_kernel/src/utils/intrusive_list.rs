//! Intrusive circular doubly linked list whose links are stored inside the
//! elements of an arena and addressed by index.
use core::fmt;

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self { first: None }
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A container whose elements carry a `Link` each.
pub trait LinkPool<Index> {
    fn link(&self, index: Index) -> Option<Link<Index>>;
    fn set_link(&mut self, index: Index, link: Option<Link<Index>>);

    #[inline]
    fn modify_link(&mut self, index: Index, f: impl FnOnce(&mut Link<Index>))
    where
        Index: Copy,
    {
        let mut link = linked(self.link(index));
        f(&mut link);
        self.set_link(index, Some(link));
    }
}

#[inline]
#[track_caller]
fn linked<Index>(link: Option<Link<Index>>) -> Link<Index> {
    match link {
        Some(link) => link,
        None => panic!("linked list is inconsistent"),
    }
}

impl<Index: Copy + PartialEq> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.first
    }

    #[inline]
    pub fn back(&self, pool: &(impl LinkPool<Index> + ?Sized)) -> Option<Index> {
        self.first.map(|first| linked(pool.link(first)).prev)
    }

    /// Get the element following `item`, or `None` if `item` is the last one.
    #[inline]
    pub fn next(&self, pool: &(impl LinkPool<Index> + ?Sized), item: Index) -> Option<Index> {
        let next = linked(pool.link(item)).next;
        if Some(next) == self.first {
            None
        } else {
            Some(next)
        }
    }

    /// Get the element preceding `item`, or `None` if `item` is the first one.
    #[inline]
    pub fn prev(&self, pool: &(impl LinkPool<Index> + ?Sized), item: Index) -> Option<Index> {
        if Some(item) == self.first {
            None
        } else {
            Some(linked(pool.link(item)).prev)
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    ///
    /// Panics if `item` is already linked.
    pub fn insert(
        &mut self,
        pool: &mut (impl LinkPool<Index> + ?Sized),
        item: Index,
        at: Option<Index>,
    ) {
        assert!(pool.link(item).is_none(), "item is already linked");

        let Some(first) = self.first else {
            assert!(at.is_none(), "linked list is inconsistent");
            pool.set_link(item, Some(Link { prev: item, next: item }));
            self.first = Some(item);
            return;
        };

        let next = at.unwrap_or(first);
        let prev = linked(pool.link(next)).prev;

        // prev.next = item
        pool.modify_link(prev, |l| l.next = item);
        // next.prev = item
        pool.modify_link(next, |l| l.prev = item);
        pool.set_link(item, Some(Link { prev, next }));

        if at == Some(first) {
            self.first = Some(item);
        }
    }

    #[inline]
    pub fn push_back(&mut self, pool: &mut (impl LinkPool<Index> + ?Sized), item: Index) {
        self.insert(pool, item, None);
    }

    #[inline]
    pub fn push_front(&mut self, pool: &mut (impl LinkPool<Index> + ?Sized), item: Index) {
        let first = self.first;
        self.insert(pool, item, first);
    }

    /// Remove `item` from the list. `item` must be a member of this list.
    pub fn remove(&mut self, pool: &mut (impl LinkPool<Index> + ?Sized), item: Index) {
        let Link { prev, next } = linked(pool.link(item));

        if next == item {
            debug_assert!(self.first == Some(item), "linked list is inconsistent");
            self.first = None;
        } else {
            pool.modify_link(prev, |l| l.next = next);
            pool.modify_link(next, |l| l.prev = prev);
            if self.first == Some(item) {
                self.first = Some(next);
            }
        }

        pool.set_link(item, None);
    }

    pub fn pop_front(&mut self, pool: &mut (impl LinkPool<Index> + ?Sized)) -> Option<Index> {
        let first = self.first?;
        self.remove(pool, first);
        Some(first)
    }

    pub fn pop_back(&mut self, pool: &mut (impl LinkPool<Index> + ?Sized)) -> Option<Index> {
        let last = self.back(pool)?;
        self.remove(pool, last);
        Some(last)
    }

    pub fn iter<'a, Pool: LinkPool<Index> + ?Sized>(&self, pool: &'a Pool) -> Iter<'a, Index, Pool> {
        Iter {
            head: *self,
            pool,
            next: self.first,
        }
    }
}

/// An iterator over the elements of a list, front to back.
pub struct Iter<'a, Index, Pool: ?Sized> {
    head: ListHead<Index>,
    pool: &'a Pool,
    next: Option<Index>,
}

impl<Index: Copy + PartialEq, Pool: LinkPool<Index> + ?Sized> Iterator for Iter<'_, Index, Pool> {
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.next?;
        self.next = self.head.next(self.pool, item);
        Some(item)
    }
}
