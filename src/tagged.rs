//! ABA-safe tagged handles.
//!
//! Lock-free structures in this crate never link raw addresses. A node is named by a [Handle],
//! which is a 32-bit slot index into the arena of a [crate::ConcurrentFreeList]. Each shared
//! link pairs that handle with a [Tag] that advances whenever the link is updated in a way that
//! lets a slot be reused. The pair is a [TaggedPointer]. It is 8 bytes wide and lives in an
//! [AtomicTaggedPointer] backed by an [AdjacentWord]`<u32>`, so one CAS checks handle and tag
//! together.
//!
//! Without the tag, a thread which read handle `A`, stalled, and then resumed after `A` was
//! popped, recycled and pushed back, would see `A` again and wrongly succeed its CAS. With the
//! tag, the recycled `A` carries a different tag and the stale CAS fails.
//!
//! Because handles are indices rather than addresses, no bits of an address are stolen for the
//! tag, and no 16 byte CAS is needed on 64 bit targets.

use crate::atomic::AdjacentWord;
use core::fmt::{Debug, Formatter};
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

const NULL_INDEX: u32 = u32::MAX;

/// The largest number of slots a handle can address. `u32::MAX` itself is reserved for null.
pub const MAX_HANDLES: usize = NULL_INDEX as usize;

/// A nullable, non-owning reference to a slot of type `T`.
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub const NULL: Handle<T> = Handle {
        index: NULL_INDEX,
        _marker: PhantomData,
    };

    #[inline]
    pub(crate) fn from_index(index: u32) -> Self {
        debug_assert_ne!(index, NULL_INDEX, "slot index collides with the null handle");
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// The slot index, or `None` for the null handle.
    #[inline]
    pub fn index(self) -> Option<u32> {
        if self.is_null() {
            None
        } else {
            Some(self.index)
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.index == NULL_INDEX
    }

    #[inline]
    pub(crate) fn to_raw(self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self {
            index: raw,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.index.hash(state)
    }
}

impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.index() {
            Some(index) => write!(f, "Handle({index})"),
            None => f.write_str("Handle(null)"),
        }
    }
}

/// A wrapping generation counter.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Tag(u32);

impl Tag {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The tag after this one. Wraps around after `u32::MAX`.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// A [Handle] paired with a [Tag].
///
/// Construction and field access are plain value operations. Sharing one between threads
/// requires an [AtomicTaggedPointer].
pub struct TaggedPointer<T> {
    handle: Handle<T>,
    tag: Tag,
}

impl<T> TaggedPointer<T> {
    #[inline]
    pub fn new(handle: Handle<T>, tag: Tag) -> Self {
        Self { handle, tag }
    }

    #[inline]
    pub fn null() -> Self {
        Self::new(Handle::NULL, Tag::default())
    }

    #[inline]
    pub fn get(&self) -> Handle<T> {
        self.handle
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The tag the next update of this link should carry.
    #[inline]
    pub fn next_tag(&self) -> Tag {
        self.tag.next()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }

    /// The value which replaces `self` when a link is pointed at `handle`.
    #[inline]
    pub fn advance(&self, handle: Handle<T>) -> Self {
        Self::new(handle, self.next_tag())
    }

    #[inline]
    fn to_halves(&self) -> (u32, u32) {
        (self.handle.to_raw(), self.tag.value())
    }

    #[inline]
    fn from_halves((handle, tag): (u32, u32)) -> Self {
        Self::new(Handle::from_raw(handle), Tag::new(tag))
    }
}

impl<T> Clone for TaggedPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPointer<T> {}

impl<T> PartialEq for TaggedPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.tag == other.tag
    }
}

impl<T> Eq for TaggedPointer<T> {}

impl<T> Debug for TaggedPointer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "TaggedPointer({:?}, tag={})", self.handle, self.tag.value())
    }
}

/// A shared link holding a [TaggedPointer].
pub struct AtomicTaggedPointer<T> {
    word: AdjacentWord<u32>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicTaggedPointer<T> {
    pub fn new(value: TaggedPointer<T>) -> Self {
        let (handle, tag): (u32, u32) = value.to_halves();
        Self {
            word: AdjacentWord::new(handle, tag),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(TaggedPointer::null())
    }

    #[inline]
    pub fn load(&self) -> TaggedPointer<T> {
        TaggedPointer::from_halves(self.word.load_pair())
    }

    /// Overwrite the link. Only sound while no other thread may be racing a CAS against it.
    #[inline]
    pub fn store(&self, value: TaggedPointer<T>) {
        let (handle, tag): (u32, u32) = value.to_halves();
        self.word.store_pair(handle, tag)
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedPointer<T>,
        new: TaggedPointer<T>,
    ) -> Result<TaggedPointer<T>, TaggedPointer<T>> {
        self.word
            .compare_exchange_pair(current.to_halves(), new.to_halves())
            .map(TaggedPointer::from_halves)
            .map_err(TaggedPointer::from_halves)
    }

    #[inline]
    pub fn compare_and_swap(&self, current: TaggedPointer<T>, new: TaggedPointer<T>) -> bool {
        self.compare_exchange(current, new).is_ok()
    }

    /// Point the link at `handle` with the next tag, whatever it currently holds, and return the
    /// value it replaced.
    ///
    /// Unlike [AtomicTaggedPointer::store], this never erases a concurrent update: a stale thread
    /// whose CAS lands first simply has its value replaced with a newer tag.
    pub fn replace_handle(&self, handle: Handle<T>) -> TaggedPointer<T> {
        let mut current: TaggedPointer<T> = self.load();
        loop {
            match self.compare_exchange(current, current.advance(handle)) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T> Debug for AtomicTaggedPointer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicTaggedPointer").field(&self.load()).finish()
    }
}
