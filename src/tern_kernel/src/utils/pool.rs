//! Object arenas addressed by typed ids.
use core::{fmt, marker::PhantomData, ops};
use slab::Slab;

use super::intrusive_list::{Link, LinkPool};

/// An id type usable as an index into [`Pool`].
pub trait PoolId: Copy + Eq + fmt::Debug {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

/// Defines an opaque handle type for a kernel object.
macro_rules! define_id {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $Name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $Name(usize);

        impl $crate::utils::pool::PoolId for $Name {
            #[inline]
            fn from_index(index: usize) -> Self {
                Self(index)
            }

            #[inline]
            fn index(self) -> usize {
                self.0
            }
        }

        impl core::fmt::Debug for $Name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, concat!(stringify!($Name), "({})"), self.0)
            }
        }
    };
}

/// Implemented by pool elements that can be a member of an intrusive list.
pub trait Linked<Id> {
    fn link(&self) -> &Option<Link<Id>>;
    fn link_mut(&mut self) -> &mut Option<Link<Id>>;
}

/// A slab of `T` indexed by `Id`.
///
/// Indexing with an id whose slot is vacant panics. Such an id can only come
/// from a deleted object, which is a programming error.
pub struct Pool<Id, T> {
    slab: Slab<T>,
    _id: PhantomData<fn() -> Id>,
}

impl<Id: PoolId, T> Pool<Id, T> {
    pub fn new() -> Self {
        Self {
            slab: Slab::new(),
            _id: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> Id {
        Id::from_index(self.slab.insert(value))
    }

    /// The id the next call to `insert` will return.
    pub fn next_id(&self) -> Id {
        Id::from_index(self.slab.vacant_key())
    }

    #[track_caller]
    pub fn remove(&mut self, id: Id) -> T {
        match self.slab.try_remove(id.index()) {
            Some(x) => x,
            None => panic!("invalid id {id:?}"),
        }
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.slab.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> + '_ {
        self.slab.iter().map(|(i, x)| (Id::from_index(i), x))
    }
}

impl<Id: PoolId, T> Default for Pool<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: PoolId, T> ops::Index<Id> for Pool<Id, T> {
    type Output = T;

    #[inline]
    #[track_caller]
    fn index(&self, id: Id) -> &T {
        match self.slab.get(id.index()) {
            Some(x) => x,
            None => panic!("invalid id {id:?}"),
        }
    }
}

impl<Id: PoolId, T> ops::IndexMut<Id> for Pool<Id, T> {
    #[inline]
    #[track_caller]
    fn index_mut(&mut self, id: Id) -> &mut T {
        match self.slab.get_mut(id.index()) {
            Some(x) => x,
            None => panic!("invalid id {id:?}"),
        }
    }
}

impl<Id: PoolId, T: Linked<Id>> LinkPool<Id> for Pool<Id, T> {
    #[inline]
    fn link(&self, index: Id) -> Option<Link<Id>> {
        *self[index].link()
    }

    #[inline]
    fn set_link(&mut self, index: Id, link: Option<Link<Id>>) {
        *self[index].link_mut() = link;
    }
}

impl<Id: PoolId, T: fmt::Debug> fmt::Debug for Pool<Id, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
