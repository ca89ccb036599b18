//! Trace regions: containers of mutually reachable heap objects that
//! share a lifetime, rooted at a single isolated object and reclaimed
//! together, either by a local mark-and-sweep collection or in bulk.

mod classtag;
mod descriptor;
mod error;
mod extref;
mod object;
mod rawptr;
mod region;
mod remset;
mod sizeclass;

pub use crate::classtag::Class;

pub use crate::descriptor::{Descriptor, DestructorFn, FinaliserFn, TraceFn};

pub use crate::error::RegionError;

pub use crate::extref::{ExtRef, ExternalRefTable};

pub use crate::object::{HeaderFlags, Object, ObjectStack, OBJECT_HEADER_SIZE};

pub use crate::rawptr::RawPtr;

pub use crate::region::{IterKind, Objects, RegionTrace, REGION_TRACE_DESC};

pub use crate::remset::{RememberedSet, Transfer};

pub use crate::sizeclass::{class_to_size, size_to_class};
