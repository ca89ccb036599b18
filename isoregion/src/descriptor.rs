/// Process-wide object descriptors.
///
/// A `Descriptor` is an immutable, shared record describing one kind of
/// heap object: its allocated size, how to enumerate its outgoing
/// references, and what to run when an instance dies. Descriptors are
/// expected to live in statics so that identity comparison is meaningful.
use crate::object::{Object, ObjectStack};

/// Enumerate an object's outgoing references into the worklist
pub type TraceFn = fn(&Object, &mut ObjectStack);

/// Invoked before destruction; may read (but not resurrect) siblings
pub type FinaliserFn = fn(&Object);

/// Pure teardown, invoked immediately before deallocation
pub type DestructorFn = fn(&Object);

pub struct Descriptor {
    /// Allocated size in bytes, including the object header
    pub size: u32,
    pub trace: Option<TraceFn>,
    pub finaliser: Option<FinaliserFn>,
    pub destructor: Option<DestructorFn>,
    /// Whether instances may hold references to isos of other regions
    pub has_iso_fields: bool,
}

impl Descriptor {
    /// An object is trivial when nothing needs to happen at its death:
    /// no finaliser, no destructor, no subregions to release. Triviality
    /// decides which ring an object lives in.
    pub fn is_trivial(&self) -> bool {
        self.finaliser.is_none() && self.destructor.is_none() && !self.has_iso_fields
    }
}
