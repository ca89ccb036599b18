/// Class tags stored in the low bits of an object's `next` word.
///
/// Allocations are double-word aligned (see `wordalloc::ALLOC_ALIGN`), so
/// the low two bits of any object address are free to carry the class of
/// the object that owns the slot.
use crate::rawptr::RawPtr;

pub const TAG_BITS: usize = 2;
pub const TAG_MASK: usize = (1 << TAG_BITS) - 1;
pub const PTR_MASK: usize = !TAG_MASK;

pub const TAG_UNMARKED: usize = 0x0;
pub const TAG_MARKED: usize = 0x1;
pub const TAG_SCC_PTR: usize = 0x2;
pub const TAG_ISO: usize = 0x3;

/// Return the tag from the given word
pub fn get_tag(tagged_word: usize) -> usize {
    tagged_word & TAG_MASK
}

/// The ring class of an object, decoded from its `next` word.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Class {
    /// Ordinary region member, not yet visited this cycle
    Unmarked,
    /// Ordinary region member, visited this cycle
    Marked,
    /// Pointer into a frozen SCC of immutables; the real target is the
    /// SCC root
    SccPtr,
    /// Region entrypoint; terminates primary-ring traversal
    Iso,
}

impl Class {
    pub fn from_word(word: usize) -> Class {
        match get_tag(word) {
            TAG_UNMARKED => Class::Unmarked,
            TAG_MARKED => Class::Marked,
            TAG_SCC_PTR => Class::SccPtr,
            TAG_ISO => Class::Iso,
            _ => unreachable!(),
        }
    }
}

/// Pointer tagging operations on RawPtr<T>
pub trait Tagged<T> {
    fn tag(self, tag: usize) -> usize;
    fn untag(word: usize) -> RawPtr<T>;
}

impl<T> Tagged<T> for RawPtr<T> {
    fn tag(self, tag: usize) -> usize {
        debug_assert!(self.as_word() & TAG_MASK == 0);
        debug_assert!(tag & PTR_MASK == 0);
        self.as_word() | tag
    }

    fn untag(word: usize) -> RawPtr<T> {
        RawPtr::new((word & PTR_MASK) as *const T)
    }
}
