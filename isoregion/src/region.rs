/// Trace regions: object graphs rooted at a single isolated object and
/// reclaimed by a local mark-and-sweep collector.
///
/// Every member of a trace region sits on one of two circular intrusive
/// rings threaded through the objects' `next` slots and anchored at the
/// region metadata. The primary ring holds the objects whose triviality
/// matches the iso's and always ends at the iso; the secondary ring holds
/// the complement and is tracked with head and tail pointers so two
/// regions can be merged in constant time.
///
/// ```text
///                     +------> iso
///                     |         |
///                 member_n   RegionTrace
///                     |      (metadata)
///                    ...        |
///                     +--- member_1
/// ```
///
/// The metadata itself carries an object header, so ring traversal code
/// never needs a special case for the anchor: the iso's `next` slot is
/// the back-reference to the metadata.
use std::cell::{Cell, RefCell};
use std::mem::size_of;
use std::ptr;
use std::ptr::NonNull;

use log::debug;

use wordalloc::RawAlloc;

use crate::classtag::{Class, TAG_MASK};
use crate::descriptor::Descriptor;
use crate::error::RegionError;
use crate::extref::{ExtRef, ExternalRefTable};
use crate::object::{Object, ObjectHeader, ObjectStack, OBJECT_HEADER_SIZE};
use crate::rawptr::RawPtr;
use crate::remset::{RememberedSet, Transfer};
use crate::sizeclass::{class_to_size, size_to_class};

/// Descriptor of the region metadata object itself. Metadata is swept by
/// hand, so it needs no trace, finaliser or destructor; what matters is
/// that stamping every metadata object with this one descriptor makes
/// `is_trace_region` a single comparison.
pub static REGION_TRACE_DESC: Descriptor = Descriptor {
    size: size_of::<RegionTrace>() as u32,
    trace: None,
    finaliser: None,
    destructor: None,
    has_iso_fields: false,
};

#[derive(Debug, Copy, Clone, PartialEq)]
enum RingKind {
    Trivial,
    NonTrivial,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum SweepMode {
    /// Ordinary collection: the iso survives
    Live,
    /// Release: everything goes, the iso included
    All,
}

/// Region metadata for a trace region. Owned by the region's iso; owns
/// every object on its rings.
#[repr(C)]
pub struct RegionTrace {
    header: ObjectHeader,

    // secondary ring anchor and tail; both point back here when empty
    next_not_root: Cell<RawPtr<Object>>,
    last_not_root: Cell<RawPtr<Object>>,

    current_memory_used: Cell<usize>,
    previous_memory_used: Cell<u8>,

    remset: RefCell<RememberedSet>,
    ext_refs: RefCell<ExternalRefTable>,
}

impl RegionTrace {
    // -- identification ------------------------------------------------

    /// Whether `o` is the metadata object of a trace region
    pub unsafe fn is_trace_region(o: RawPtr<Object>) -> bool {
        ptr::eq(o.as_ref().descriptor(), &REGION_TRACE_DESC)
    }

    /// The metadata of the region `iso` is the entrypoint of
    ///
    /// # Safety
    ///
    /// `iso` must be a live iso object of a trace region.
    pub unsafe fn get(iso: RawPtr<Object>) -> RawPtr<RegionTrace> {
        debug_assert!(iso.as_ref().is_iso());
        let reg = iso.as_ref().region();
        debug_assert!(Self::is_trace_region(reg.cast::<Object>()));
        reg
    }

    // -- region operations ---------------------------------------------

    /// Create a new trace region rooted at a fresh object of type `desc`.
    /// The object becomes the region's iso and sole member.
    ///
    /// # Safety
    ///
    /// `desc.size` must cover at least the object header; the payload is
    /// returned uninitialized.
    pub unsafe fn create<A: RawAlloc>(
        mem: &A,
        desc: &'static Descriptor,
    ) -> Result<RawPtr<Object>, RegionError> {
        let o = Self::alloc_object(mem, desc)?;

        let raw = match mem.alloc(size_of::<RegionTrace>()) {
            Ok(raw) => raw,
            Err(e) => {
                // no partial region escapes a failed create
                Self::dealloc_object(mem, o);
                return Err(e.into());
            }
        };

        let reg_ptr = raw.as_ptr() as *mut RegionTrace;
        let meta = RawPtr::new(reg_ptr as *const Object);

        ptr::write(
            reg_ptr,
            RegionTrace {
                header: ObjectHeader::new(&REGION_TRACE_DESC),
                next_not_root: Cell::new(meta),
                last_not_root: Cell::new(meta),
                current_memory_used: Cell::new(0),
                previous_memory_used: Cell::new(0),
                remset: RefCell::new(RememberedSet::new()),
                ext_refs: RefCell::new(ExternalRefTable::new()),
            },
        );

        let reg = &*reg_ptr;
        reg.as_obj().init_next(o);
        o.as_ref().init_iso(RawPtr::new(reg_ptr));
        reg.use_memory(desc.size as usize);

        Ok(o)
    }

    /// Allocate a new object of type `desc` in the region entered through
    /// `in_iso`, adding it to the ring matching its triviality.
    ///
    /// # Safety
    ///
    /// `in_iso` must be a live iso of a trace region; the payload is
    /// returned uninitialized.
    pub unsafe fn alloc<A: RawAlloc>(
        mem: &A,
        in_iso: RawPtr<Object>,
        desc: &'static Descriptor,
    ) -> Result<RawPtr<Object>, RegionError> {
        let reg = Self::get(in_iso);
        let o = Self::alloc_object(mem, desc)?;

        reg.as_ref().append_one(o);
        reg.as_ref().use_memory(desc.size as usize);

        Ok(o)
    }

    /// Register a cross-region reference from `into_iso`'s region to the
    /// immutable or cown `target`. SCC pointers are resolved to their
    /// root first. `Transfer::Yes` consumes the caller's reference-count
    /// contribution; `Transfer::No` takes a fresh one.
    ///
    /// # Safety
    ///
    /// `into_iso` must be a live iso of a trace region; `target` must be
    /// a live immutable or cown.
    pub unsafe fn insert(into_iso: RawPtr<Object>, target: RawPtr<Object>, transfer: Transfer) {
        let reg = Self::get(into_iso);

        let target = if target.as_ref().class() == Class::SccPtr {
            target.as_ref().immutable()
        } else {
            target
        };
        debug_assert!(target.as_ref().is_rc() || target.as_ref().is_cown());

        reg.as_ref().remset.borrow_mut().insert(target, transfer);
    }

    /// Merge `other_iso`'s region into `into_iso`'s region. The donor's
    /// rings are spliced in constant time, its tables are absorbed, and
    /// its metadata is freed. The donor iso becomes an ordinary member.
    ///
    /// # Safety
    ///
    /// Both arguments must be live isos of two distinct trace regions.
    pub unsafe fn merge<A: RawAlloc>(
        mem: &A,
        into_iso: RawPtr<Object>,
        other_iso: RawPtr<Object>,
    ) {
        debug_assert!(other_iso.as_ref().is_iso());

        let reg = Self::get(into_iso);
        let other = other_iso.as_ref().region();
        debug_assert!(reg != other);

        if !Self::is_trace_region(other.cast::<Object>()) {
            panic!("merge of a non-trace region");
        }

        debug!(
            "region merge: {:#x} <- {:#x}",
            into_iso.as_word(),
            other_iso.as_word()
        );

        reg.as_ref().merge_internal(other_iso, other.as_ref());

        let donor_refs = other.as_ref().ext_refs.replace(ExternalRefTable::new());
        reg.as_ref().ext_refs.borrow_mut().merge(donor_refs);

        let donor_set = other.as_ref().remset.replace(RememberedSet::new());
        reg.as_ref().remset.borrow_mut().merge(donor_set);

        Self::dealloc_region(mem, other);
    }

    /// Make `next` the region's iso in place of `prev`. `prev` becomes an
    /// ordinary member; if the two differ in triviality the rings swap
    /// roles.
    ///
    /// # Safety
    ///
    /// `prev` must be the region's current iso and `next` a mutable
    /// member of the same region.
    pub unsafe fn swap_root(prev: RawPtr<Object>, next: RawPtr<Object>) {
        debug_assert!(prev != next);
        debug_assert!(prev.as_ref().is_iso());
        debug_assert!(next.as_ref().is_mutable());

        let reg = Self::get(prev);
        debug_assert!(reg.cast::<Object>() != next);

        reg.as_ref().swap_root_internal(prev, next);
    }

    /// Collect the region entered through `o`: mark everything reachable
    /// from the iso, sweep the rest, and release any subregions that
    /// became unreachable.
    ///
    /// # Safety
    ///
    /// `o` must be a live iso of a trace region, exclusively held.
    pub unsafe fn gc<A: RawAlloc>(mem: &A, o: RawPtr<Object>) {
        debug!("region gc requested for iso {:#x}", o.as_word());
        debug_assert!(o.as_ref().is_iso());

        let reg = Self::get(o);
        let mut f = ObjectStack::new();
        let mut collect = ObjectStack::new();
        let mut marked = 0;

        reg.as_ref().mark(o, &mut f, &mut marked);
        reg.as_ref()
            .sweep(mem, o, &mut f, &mut collect, marked, SweepMode::Live);

        Self::release_unreachable(mem, &mut f, &mut collect);
    }

    /// Destroy the region entered through `o`, all of its members, and
    /// every subregion reachable only through it.
    ///
    /// # Safety
    ///
    /// `o` must be a live iso of a trace region, exclusively held.
    pub unsafe fn release<A: RawAlloc>(mem: &A, o: RawPtr<Object>) {
        debug_assert!(o.as_ref().is_iso());

        let reg = Self::get(o);
        let mut f = ObjectStack::new();
        let mut collect = ObjectStack::new();

        Self::release_internal(mem, reg, o, &mut f, &mut collect);
        Self::release_unreachable(mem, &mut f, &mut collect);
    }

    // -- memory accounting ---------------------------------------------

    /// Live bytes observed by the last sweep, bumped on every allocation
    /// since. One half of the caller's GC trigger heuristic.
    pub fn current_memory_used(&self) -> usize {
        self.current_memory_used.get()
    }

    /// Decoded size-class bound of the previous sweep's live bytes. The
    /// other half of the caller's GC trigger heuristic.
    pub fn previous_memory_used(&self) -> usize {
        class_to_size(self.previous_memory_used.get())
    }

    // -- external references -------------------------------------------

    /// Hand out a stable handle to `object`, an interior member of the
    /// region entered through `iso`.
    ///
    /// # Safety
    ///
    /// `iso` must be a live iso of a trace region and `object` one of the
    /// region's members.
    pub unsafe fn create_external_ref(iso: RawPtr<Object>, object: RawPtr<Object>) -> ExtRef {
        let reg = Self::get(iso);
        #[cfg(debug_assertions)]
        assert!(reg.as_ref().debug_is_in_region(object));
        reg.as_ref().ext_refs.borrow_mut().create(object)
    }

    /// Resolve a handle to its object, if the object is still alive
    ///
    /// # Safety
    ///
    /// `iso` must be a live iso of a trace region.
    pub unsafe fn external_ref_target(
        iso: RawPtr<Object>,
        handle: ExtRef,
    ) -> Option<RawPtr<Object>> {
        Self::get(iso).as_ref().ext_refs.borrow().get(handle)
    }

    /// Retire the handle held by `object`, if any
    ///
    /// # Safety
    ///
    /// `iso` must be a live iso of a trace region.
    pub unsafe fn erase_external_ref(iso: RawPtr<Object>, object: RawPtr<Object>) {
        Self::get(iso).as_ref().ext_refs.borrow_mut().erase(object);
    }

    // -- allocation plumbing -------------------------------------------

    unsafe fn alloc_object<A: RawAlloc>(
        mem: &A,
        desc: &'static Descriptor,
    ) -> Result<RawPtr<Object>, RegionError> {
        debug_assert!(desc.size as usize >= OBJECT_HEADER_SIZE);

        let raw = mem.alloc(desc.size as usize)?;
        let o = RawPtr::new(raw.as_ptr() as *const Object);
        debug_assert!(o.as_word() & TAG_MASK == 0);

        Object::init(o, desc);
        Ok(o)
    }

    unsafe fn dealloc_object<A: RawAlloc>(mem: &A, o: RawPtr<Object>) {
        let size = o.as_ref().size();
        mem.dealloc(NonNull::new_unchecked(o.as_ptr() as *mut u8), size);
    }

    unsafe fn dealloc_region<A: RawAlloc>(mem: &A, reg: RawPtr<RegionTrace>) {
        let ptr = reg.as_ptr() as *mut RegionTrace;
        ptr::drop_in_place(ptr);
        mem.dealloc(
            NonNull::new_unchecked(ptr as *mut u8),
            size_of::<RegionTrace>(),
        );
    }

    // -- ring management -----------------------------------------------

    fn self_ptr(&self) -> RawPtr<RegionTrace> {
        RawPtr::new(self as *const RegionTrace)
    }

    fn as_object(&self) -> RawPtr<Object> {
        RawPtr::new(self as *const RegionTrace as *const Object)
    }

    // the metadata shares the object header, so ring code can treat it
    // as just another node
    fn as_obj(&self) -> &Object {
        unsafe { &*(self as *const RegionTrace as *const Object) }
    }

    fn get_next(&self) -> RawPtr<Object> {
        self.as_obj().get_next()
    }

    unsafe fn append_one(&self, o: RawPtr<Object>) {
        self.append(o, o);
    }

    /// Splice the chain `[hd ... tl]` into the ring matching `hd`'s
    /// triviality, immediately after the metadata. New members go in at
    /// the front so the iso stays the primary ring's terminator.
    unsafe fn append(&self, hd: RawPtr<Object>, tl: RawPtr<Object>) {
        let p = self.get_next();

        if hd.as_ref().is_trivial() == p.as_ref().is_trivial() {
            tl.as_ref().init_next(p);
            self.as_obj().init_next(hd);
        } else {
            tl.as_ref().init_next(self.next_not_root.get());
            self.next_not_root.set(hd);

            if self.last_not_root.get() == self.as_object() {
                self.last_not_root.set(tl);
            }
        }
    }

    unsafe fn merge_internal(&self, o: RawPtr<Object>, other: &RegionTrace) {
        debug_assert!(o.as_ref().region() == other.self_ptr());

        // donor primary ring: its head is the donor metadata's next, its
        // tail is the donor iso, which the splice demotes to an ordinary
        // member by overwriting its class
        let head = other.get_next();
        if head != other.as_object() {
            self.append(head, o);
        }

        // donor secondary ring
        let head = other.next_not_root.get();
        if head != other.as_object() {
            self.append(head, other.last_not_root.get());
        }

        self.current_memory_used
            .set(self.current_memory_used.get() + other.current_memory_used.get());

        // both baselines feed the merged region's GC trigger
        let combined = class_to_size(self.previous_memory_used.get())
            + class_to_size(other.previous_memory_used.get());
        self.previous_memory_used.set(size_to_class(combined));
    }

    unsafe fn swap_root_internal(&self, prev: RawPtr<Object>, next: RawPtr<Object>) {
        #[cfg(debug_assertions)]
        assert!(self.debug_is_in_region(next));
        let mut prev = prev;

        // if the new root lives in the secondary ring, the rings swap
        // roles: the old root becomes the new secondary's terminator
        if prev.as_ref().is_trivial() != next.as_ref().is_trivial() {
            debug_assert!(
                self.last_not_root.get().as_ref().get_next_any_mark() == self.as_object()
            );

            let t = self.get_next();
            self.as_obj().init_next(self.next_not_root.get());
            self.next_not_root.set(t);

            let t = self.last_not_root.get();
            self.last_not_root.set(prev);
            prev.as_ref().init_next(self.as_object());
            prev = t;
        }

        // after a ring swap prev may already be next; then only the class
        // stamp below remains
        if prev != next {
            // the metadata object can never be a root
            debug_assert!(prev != self.as_object());
            debug_assert!(prev.as_ref().get_next_any_mark() == self.as_object());
            debug_assert!(next.as_ref().get_next() != self.as_object());

            let x = self.get_next();
            let y = next.as_ref().get_next();

            prev.as_ref().init_next(x);
            self.as_obj().init_next(y);
        }

        next.as_ref().init_iso(self.self_ptr());
    }

    // -- mark ----------------------------------------------------------

    /// Mark every object reachable from the iso by intra-region
    /// references. Subregion entrypoints are not traced through;
    /// immutables and cowns are registered with the remembered set.
    unsafe fn mark(&self, iso: RawPtr<Object>, dfs: &mut ObjectStack, marked: &mut usize) {
        iso.as_ref().trace(dfs);

        while let Some(p) = dfs.pop() {
            let obj = p.as_ref();

            if obj.is_rc() || obj.is_cown() {
                self.remset.borrow_mut().mark(p, marked);
                continue;
            }

            match obj.class() {
                Class::Iso | Class::Marked => {}
                Class::Unmarked => {
                    obj.mark();
                    obj.trace(dfs);
                }
                Class::SccPtr => {
                    let root = obj.immutable();
                    self.remset.borrow_mut().mark(root, marked);
                }
            }
        }
    }

    // -- sweep ---------------------------------------------------------

    unsafe fn sweep<A: RawAlloc>(
        &self,
        mem: &A,
        iso: RawPtr<Object>,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
        marked: usize,
        mode: SweepMode,
    ) {
        self.current_memory_used.set(0);

        let primary = if iso.as_ref().is_trivial() {
            RingKind::Trivial
        } else {
            RingKind::NonTrivial
        };

        // non-trivial ring first: its finalisers may still read trivial
        // members
        self.sweep_ring(mem, iso, RingKind::NonTrivial, primary, f, collect, mode);
        self.sweep_ring(mem, iso, RingKind::Trivial, primary, f, collect, mode);

        self.remset.borrow_mut().sweep_set(marked);
        self.previous_memory_used
            .set(size_to_class(self.current_memory_used.get()));
    }

    unsafe fn sweep_ring<A: RawAlloc>(
        &self,
        mem: &A,
        iso: RawPtr<Object>,
        ring: RingKind,
        primary: RingKind,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
        mode: SweepMode,
    ) {
        let meta = self.as_object();
        let mut prev = meta;
        let mut p = if ring == primary {
            self.get_next()
        } else {
            self.next_not_root.get()
        };

        // unreachable non-trivial members are finalised during the walk
        // and torn down afterwards in two phases
        let mut pending = RawPtr::null();

        // the walk unlinks as it goes, so no iterator here
        while p != meta {
            match p.as_ref().class() {
                Class::Iso => {
                    // the iso is always the last member of its ring
                    debug_assert!(p.as_ref().get_next_any_mark() == meta);
                    debug_assert!(p.as_ref().region() == self.self_ptr());

                    if mode == SweepMode::All {
                        self.sweep_object(mem, p, ring, &mut pending);
                    } else {
                        self.use_memory(p.as_ref().size());
                    }
                    p = meta;
                }

                Class::Marked => {
                    debug_assert!(mode == SweepMode::Live);
                    self.use_memory(p.as_ref().size());
                    p.as_ref().unmark();
                    prev = p;
                    p = p.as_ref().get_next();
                }

                Class::Unmarked => {
                    let q = p.as_ref().get_next();
                    self.sweep_object(mem, p, ring, &mut pending);

                    if ring != primary && prev == meta {
                        self.next_not_root.set(q);
                    } else {
                        prev.as_ref().set_next(q);
                    }
                    if ring != primary && self.last_not_root.get() == p {
                        self.last_not_root.set(prev);
                    }

                    p = q;
                }

                Class::SccPtr => panic!("corrupt class tag in ring"),
            }
        }

        if ring == RingKind::NonTrivial {
            // phase one: find iso fields of everything about to die while
            // every referent header is still intact; destructors may free
            // transitively and invalidate the region check
            let mut p = pending;
            while !p.is_null() {
                p.as_ref().find_iso_fields(iso, f, collect);
                p = p.as_ref().get_next();
            }

            // phase two: tear down and deallocate
            let mut p = pending;
            while !p.is_null() {
                let q = p.as_ref().get_next();
                p.as_ref().destruct();
                Self::dealloc_object(mem, p);
                p = q;
            }
        }
    }

    /// Dispose of one unreachable member. Trivial objects go immediately;
    /// non-trivial objects are finalised and queued on the pending list
    /// through their now-unlinked `next` slot.
    unsafe fn sweep_object<A: RawAlloc>(
        &self,
        mem: &A,
        p: RawPtr<Object>,
        ring: RingKind,
        pending: &mut RawPtr<Object>,
    ) {
        debug_assert!(
            p.as_ref().class() == Class::Iso || p.as_ref().class() == Class::Unmarked
        );

        match ring {
            RingKind::Trivial => {
                debug_assert!(p.as_ref().is_trivial());

                if p.as_ref().has_ext_ref() {
                    self.ext_refs.borrow_mut().erase(p);
                }
                Self::dealloc_object(mem, p);
            }

            RingKind::NonTrivial => {
                debug_assert!(!p.as_ref().is_trivial());

                p.as_ref().finalise();

                // other finalisers may still read this object
                p.as_ref().init_next(*pending);
                *pending = p;
            }
        }
    }

    // -- release -------------------------------------------------------

    /// Drain `collect`: every entry is the iso of a region that just
    /// became unreachable. Dispatches on the target's region kind;
    /// releases may enqueue further subregions onto the same stack.
    unsafe fn release_unreachable<A: RawAlloc>(
        mem: &A,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
    ) {
        while let Some(o) = collect.pop() {
            debug_assert!(o.as_ref().is_iso());
            debug!("releasing unreachable subregion {:#x}", o.as_word());

            let reg = o.as_ref().region();
            if Self::is_trace_region(reg.cast::<Object>()) {
                Self::release_internal(mem, reg, o, f, collect);
            } else {
                panic!("unknown region kind");
            }
        }
    }

    /// Sweep every member of `reg` including the iso, then free the
    /// metadata. Subregions are only enqueued, not released.
    unsafe fn release_internal<A: RawAlloc>(
        mem: &A,
        reg: RawPtr<RegionTrace>,
        o: RawPtr<Object>,
        f: &mut ObjectStack,
        collect: &mut ObjectStack,
    ) {
        debug!("region release: trace region {:#x}", o.as_word());

        reg.as_ref().sweep(mem, o, f, collect, 0, SweepMode::All);
        Self::dealloc_region(mem, reg);
    }

    fn use_memory(&self, size: usize) {
        self.current_memory_used
            .set(self.current_memory_used.get() + size);
    }

    // -- iteration -----------------------------------------------------

    /// Iterate the region's members without disturbing mark state. The
    /// rings must not be mutated while iterating; sweep uses its own
    /// unlinking traversal instead.
    pub fn objects(&self, kind: IterKind) -> Objects {
        let q = self.get_next();

        let start = match kind {
            IterKind::All => q,
            IterKind::Trivial => {
                if unsafe { q.as_ref() }.is_trivial() {
                    q
                } else {
                    self.next_not_root.get()
                }
            }
            IterKind::NonTrivial => {
                if !unsafe { q.as_ref() }.is_trivial() {
                    q
                } else {
                    self.next_not_root.get()
                }
            }
        };

        Objects {
            reg: self,
            kind,
            ptr: if start == self.as_object() {
                None
            } else {
                Some(start)
            },
        }
    }

    #[cfg(debug_assertions)]
    fn debug_is_in_region(&self, o: RawPtr<Object>) -> bool {
        self.objects(IterKind::All).any(|p| p == o)
    }
}

/// Which members `RegionTrace::objects` visits
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum IterKind {
    All,
    Trivial,
    NonTrivial,
}

pub struct Objects<'a> {
    reg: &'a RegionTrace,
    kind: IterKind,
    ptr: Option<RawPtr<Object>>,
}

impl<'a> Iterator for Objects<'a> {
    type Item = RawPtr<Object>;

    fn next(&mut self) -> Option<RawPtr<Object>> {
        let current = self.ptr?;
        let meta = self.reg.as_object();
        let q = unsafe { current.as_ref() }.get_next_any_mark();

        self.ptr = if q != meta {
            Some(q)
        } else if self.kind == IterKind::All
            && current != self.reg.last_not_root.get()
            && self.reg.next_not_root.get() != meta
        {
            // the primary ring just finished at the iso; continue with
            // the secondary ring
            debug_assert!(unsafe { current.as_ref() }.is_iso());
            Some(self.reg.next_not_root.get())
        } else {
            None
        };

        Some(current)
    }
}
