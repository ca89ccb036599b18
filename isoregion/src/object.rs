/// The per-object header and the operations the collector needs on it.
///
/// Every heap value managed by a region begins with an `ObjectHeader`:
/// a descriptor reference, a tagged `next` word linking the object into
/// one of its region's rings, and a small flags byte. The low bits of
/// the `next` word carry the object's ring class (see `classtag`), so
/// marking and unmarking never rewrite the pointer part of the word.
///
/// Objects flagged RC or COWN are not ring members at all: they are
/// referenced across regions, their `next` word holds a reference count
/// shifted above the tag bits, and the remembered set owns contributions
/// to that count.
use std::cell::Cell;
use std::mem::size_of;

use bitflags::bitflags;

use crate::classtag::{Class, Tagged, PTR_MASK, TAG_BITS, TAG_ISO, TAG_MARKED, TAG_MASK, TAG_SCC_PTR};
use crate::descriptor::Descriptor;
use crate::rawptr::RawPtr;
use crate::region::RegionTrace;

pub const OBJECT_HEADER_SIZE: usize = size_of::<ObjectHeader>();

bitflags! {
    /// Per-object bits outside the 2-bit class tag
    pub struct HeaderFlags: u8 {
        /// Reference-counted immutable, referenced (not owned) by regions
        const RC = 1 << 0;
        /// Concurrently-owned object, referenced (not owned) by regions
        const COWN = 1 << 1;
        /// The object has an entry in its region's external reference table
        const EXT_REF = 1 << 2;
    }
}

#[repr(C)]
pub struct ObjectHeader {
    desc: &'static Descriptor,
    link: Cell<usize>,
    flags: Cell<HeaderFlags>,
}

impl ObjectHeader {
    pub(crate) fn new(desc: &'static Descriptor) -> ObjectHeader {
        ObjectHeader {
            desc,
            link: Cell::new(0),
            flags: Cell::new(HeaderFlags::empty()),
        }
    }
}

/// A region-managed heap object. The payload follows the header in the
/// same allocation; its layout is the descriptor's business.
#[repr(C)]
pub struct Object {
    header: ObjectHeader,
}

impl Object {
    /// Write a fresh header into uninitialized memory at `ptr`
    pub(crate) unsafe fn init(ptr: RawPtr<Object>, desc: &'static Descriptor) {
        std::ptr::write(ptr.as_ptr() as *mut ObjectHeader, ObjectHeader::new(desc));
    }

    pub fn as_raw(&self) -> RawPtr<Object> {
        RawPtr::new(self as *const Object)
    }

    pub fn descriptor(&self) -> &'static Descriptor {
        self.header.desc
    }

    /// Allocated size in bytes, as recorded by the descriptor
    pub fn size(&self) -> usize {
        self.header.desc.size as usize
    }

    pub fn is_trivial(&self) -> bool {
        self.header.desc.is_trivial()
    }

    pub fn class(&self) -> Class {
        Class::from_word(self.header.link.get())
    }

    pub fn is_iso(&self) -> bool {
        self.class() == Class::Iso
    }

    /// A mutable object is an ordinary region member: not frozen, not a
    /// cown, not the region entrypoint.
    pub fn is_mutable(&self) -> bool {
        !self.is_rc() && !self.is_cown() && self.class() == Class::Unmarked
    }

    // -- ring links ---------------------------------------------------

    /// Set the next pointer, resetting the class to UNMARKED
    pub(crate) fn init_next(&self, next: RawPtr<Object>) {
        self.header.link.set(next.as_word());
    }

    /// Set the next pointer, preserving the current class tag
    pub(crate) fn set_next(&self, next: RawPtr<Object>) {
        let tag = self.header.link.get() & TAG_MASK;
        self.header.link.set(next.tag(tag));
    }

    /// The next ring member. Only legal on non-iso members; an iso's
    /// slot holds its region back-reference instead.
    pub(crate) fn get_next(&self) -> RawPtr<Object> {
        debug_assert!(self.class() != Class::Iso);
        RawPtr::untag(self.header.link.get())
    }

    /// The next ring member irrespective of the class tag
    pub(crate) fn get_next_any_mark(&self) -> RawPtr<Object> {
        RawPtr::untag(self.header.link.get())
    }

    // -- mark state ---------------------------------------------------

    pub(crate) fn mark(&self) {
        debug_assert!(self.class() == Class::Unmarked);
        self.header.link.set(self.header.link.get() | TAG_MARKED);
    }

    pub(crate) fn unmark(&self) {
        debug_assert!(self.class() == Class::Marked);
        self.header.link.set(self.header.link.get() & PTR_MASK);
    }

    // -- iso ----------------------------------------------------------

    /// Stamp this object as a region entrypoint. The `next` slot becomes
    /// the back-reference to the region metadata.
    pub(crate) fn init_iso(&self, region: RawPtr<RegionTrace>) {
        self.header.link.set(region.cast::<Object>().tag(TAG_ISO));
    }

    /// The region this iso is the entrypoint of
    pub fn region(&self) -> RawPtr<RegionTrace> {
        debug_assert!(self.is_iso());
        RawPtr::untag(self.header.link.get())
    }

    // -- external object stamps ---------------------------------------
    //
    // Frozen immutables and cowns are created by the surrounding
    // runtime; these initialisers exist so it can stamp their headers.

    /// Stamp as a reference-counted immutable (an SCC root)
    pub fn init_rc(&self, count: usize) {
        self.header.link.set(count << TAG_BITS);
        self.set_flag(HeaderFlags::RC);
    }

    /// Stamp as a concurrently-owned object
    pub fn init_cown(&self, count: usize) {
        self.header.link.set(count << TAG_BITS);
        self.set_flag(HeaderFlags::COWN);
    }

    /// Stamp as an interior member of a frozen SCC, pointing at `parent`
    /// on the path to the SCC root
    pub fn init_scc_ptr(&self, parent: RawPtr<Object>) {
        self.header.link.set(parent.tag(TAG_SCC_PTR));
    }

    pub fn is_rc(&self) -> bool {
        self.flags().contains(HeaderFlags::RC)
    }

    pub fn is_cown(&self) -> bool {
        self.flags().contains(HeaderFlags::COWN)
    }

    /// Resolve an SCC pointer chain to the reference-counted SCC root.
    /// Identity on objects that are already roots.
    pub fn immutable(&self) -> RawPtr<Object> {
        let mut p = self.as_raw();
        loop {
            let obj = unsafe { p.as_ref() };
            if obj.class() != Class::SccPtr {
                break;
            }
            p = obj.get_next_any_mark();
        }
        debug_assert!(unsafe { p.as_ref() }.is_rc());
        p
    }

    // -- reference counts (RC and COWN objects only) -------------------

    pub fn incref(&self) {
        debug_assert!(self.is_rc() || self.is_cown());
        self.header.link.set(self.header.link.get() + (1 << TAG_BITS));
    }

    /// Drop one count; true when the count reached zero
    pub fn decref(&self) -> bool {
        debug_assert!(self.is_rc() || self.is_cown());
        let word = self.header.link.get();
        debug_assert!(word >> TAG_BITS > 0);
        let word = word - (1 << TAG_BITS);
        self.header.link.set(word);
        word >> TAG_BITS == 0
    }

    pub fn ref_count(&self) -> usize {
        debug_assert!(self.is_rc() || self.is_cown());
        self.header.link.get() >> TAG_BITS
    }

    // -- flags ---------------------------------------------------------

    pub fn has_ext_ref(&self) -> bool {
        self.flags().contains(HeaderFlags::EXT_REF)
    }

    pub(crate) fn set_ext_ref(&self, on: bool) {
        let mut flags = self.flags();
        flags.set(HeaderFlags::EXT_REF, on);
        self.header.flags.set(flags);
    }

    fn flags(&self) -> HeaderFlags {
        self.header.flags.get()
    }

    fn set_flag(&self, flag: HeaderFlags) {
        self.header.flags.set(self.flags() | flag);
    }

    // -- descriptor callbacks ------------------------------------------

    /// Push this object's outgoing references onto the worklist
    pub fn trace(&self, stack: &mut ObjectStack) {
        if let Some(trace) = self.header.desc.trace {
            trace(self, stack);
        }
    }

    pub(crate) fn finalise(&self) {
        if let Some(finaliser) = self.header.desc.finaliser {
            finaliser(self);
        }
    }

    pub(crate) fn destruct(&self) {
        if let Some(destructor) = self.header.desc.destructor {
            destructor(self);
        }
    }

    /// Enumerate this object's fields and push every reference to an iso
    /// of a *different* region onto `collect`. Must run before any
    /// destructor in the same sweep: it inspects referent headers, which
    /// destructors may transitively free.
    pub(crate) unsafe fn find_iso_fields(
        &self,
        region_iso: RawPtr<Object>,
        scratch: &mut ObjectStack,
        collect: &mut ObjectStack,
    ) {
        debug_assert!(scratch.is_empty());
        self.trace(scratch);
        while let Some(p) = scratch.pop() {
            if p.as_ref().class() == Class::Iso && p != region_iso {
                collect.push(p);
            }
        }
    }

    /// Pointer to the payload that follows the header. The layout of the
    /// payload is defined by the descriptor, not by this crate.
    pub unsafe fn data(&self) -> *mut u8 {
        (self as *const Object as *mut u8).add(OBJECT_HEADER_SIZE)
    }
}

/// An explicit worklist of objects. Mark and sweep traversals use this
/// instead of the host call stack; object graphs may be arbitrarily deep.
pub struct ObjectStack {
    stack: Vec<RawPtr<Object>>,
}

impl ObjectStack {
    pub fn new() -> ObjectStack {
        ObjectStack { stack: Vec::new() }
    }

    pub fn push(&mut self, ptr: RawPtr<Object>) {
        self.stack.push(ptr);
    }

    pub fn pop(&mut self) -> Option<RawPtr<Object>> {
        self.stack.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    static PLAIN: Descriptor = Descriptor {
        size: 64,
        trace: None,
        finaliser: None,
        destructor: None,
        has_iso_fields: false,
    };

    // A raw backing buffer with enough alignment for tag bits
    fn buffer() -> Vec<u64> {
        vec![0u64; 32]
    }

    unsafe fn object_at(buf: &mut [u64], index: usize) -> RawPtr<Object> {
        let ptr = RawPtr::new(buf.as_ptr().add(index) as *const Object);
        Object::init(ptr, &PLAIN);
        ptr
    }

    #[test]
    fn test_new_object_is_unmarked() {
        let mut buf = buffer();
        let o = unsafe { object_at(&mut buf, 0) };
        let o = unsafe { o.as_ref() };

        assert!(o.class() == Class::Unmarked);
        assert!(o.is_mutable());
        assert!(o.is_trivial());
        assert!(o.size() == 64);
        assert!(!o.has_ext_ref());
    }

    #[test]
    fn test_mark_preserves_next() {
        let mut buf = buffer();
        let o = unsafe { object_at(&mut buf, 0) };
        let n = unsafe { object_at(&mut buf, 16) };
        let o = unsafe { o.as_ref() };

        o.init_next(n);
        assert!(o.get_next() == n);

        o.mark();
        assert!(o.class() == Class::Marked);
        assert!(o.get_next_any_mark() == n);

        o.unmark();
        assert!(o.class() == Class::Unmarked);
        assert!(o.get_next() == n);
    }

    #[test]
    fn test_set_next_preserves_mark() {
        let mut buf = buffer();
        let o = unsafe { object_at(&mut buf, 0) };
        let a = unsafe { object_at(&mut buf, 8) };
        let b = unsafe { object_at(&mut buf, 16) };
        let o = unsafe { o.as_ref() };

        o.init_next(a);
        o.mark();
        o.set_next(b);

        assert!(o.class() == Class::Marked);
        assert!(o.get_next_any_mark() == b);
    }

    #[test]
    fn test_scc_chain_resolves_to_root() {
        let mut buf = buffer();
        let root = unsafe { object_at(&mut buf, 0) };
        let mid = unsafe { object_at(&mut buf, 8) };
        let leaf = unsafe { object_at(&mut buf, 16) };

        unsafe {
            root.as_ref().init_rc(1);
            mid.as_ref().init_scc_ptr(root);
            leaf.as_ref().init_scc_ptr(mid);

            assert!(leaf.as_ref().immutable() == root);
            assert!(mid.as_ref().immutable() == root);
            assert!(root.as_ref().immutable() == root);
        }
    }

    #[test]
    fn test_ref_counts() {
        let mut buf = buffer();
        let imm = unsafe { object_at(&mut buf, 0) };
        let imm = unsafe { imm.as_ref() };

        imm.init_rc(1);
        assert!(imm.ref_count() == 1);

        imm.incref();
        assert!(imm.ref_count() == 2);

        assert!(!imm.decref());
        assert!(imm.decref());
        assert!(imm.ref_count() == 0);
    }
}
