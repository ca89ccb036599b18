/// The external reference table: a per-region map from stable opaque
/// handles to interior objects. Handles stay valid across merges and
/// root swaps; an entry disappears when its object is swept or when the
/// caller erases it.
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;

use crate::object::Object;
use crate::rawptr::RawPtr;

/// An opaque, process-unique handle to an interior object of a region
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExtRef(u64);

// handles are unique across all tables, so merged tables never collide
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub struct ExternalRefTable {
    by_handle: FnvHashMap<u64, RawPtr<Object>>,
    by_object: FnvHashMap<RawPtr<Object>, u64>,
}

impl ExternalRefTable {
    pub fn new() -> ExternalRefTable {
        ExternalRefTable {
            by_handle: FnvHashMap::default(),
            by_object: FnvHashMap::default(),
        }
    }

    /// Hand out a stable handle for `object`, at most one per object
    pub unsafe fn create(&mut self, object: RawPtr<Object>) -> ExtRef {
        debug_assert!(!object.as_ref().has_ext_ref());

        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        self.by_handle.insert(handle, object);
        self.by_object.insert(object, handle);
        object.as_ref().set_ext_ref(true);

        ExtRef(handle)
    }

    pub fn get(&self, handle: ExtRef) -> Option<RawPtr<Object>> {
        self.by_handle.get(&handle.0).copied()
    }

    /// Drop the entry for `object`, if any. Called when the object is
    /// swept or when the caller retires the handle.
    pub unsafe fn erase(&mut self, object: RawPtr<Object>) {
        if let Some(handle) = self.by_object.remove(&object) {
            self.by_handle.remove(&handle);
            object.as_ref().set_ext_ref(false);
        }
    }

    /// Absorb another region's table; handles keep their values
    pub fn merge(&mut self, other: ExternalRefTable) {
        self.by_handle.extend(other.by_handle);
        self.by_object.extend(other.by_object);
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::descriptor::Descriptor;

    static PLAIN: Descriptor = Descriptor {
        size: 32,
        trace: None,
        finaliser: None,
        destructor: None,
        has_iso_fields: false,
    };

    fn fake_object() -> RawPtr<Object> {
        let buf: Box<[u64; 8]> = Box::new([0; 8]);
        let ptr = RawPtr::new(Box::into_raw(buf) as *const Object);
        unsafe { Object::init(ptr, &PLAIN) };
        ptr
    }

    #[test]
    fn test_create_get_erase() {
        let mut table = ExternalRefTable::new();
        let o = fake_object();

        let handle = unsafe { table.create(o) };
        assert!(unsafe { o.as_ref() }.has_ext_ref());
        assert!(table.get(handle) == Some(o));

        unsafe { table.erase(o) };
        assert!(!unsafe { o.as_ref() }.has_ext_ref());
        assert!(table.get(handle) == None);
        assert!(table.len() == 0);
    }

    #[test]
    fn test_erase_without_entry_is_harmless() {
        let mut table = ExternalRefTable::new();
        let o = fake_object();

        unsafe { table.erase(o) };
        assert!(table.len() == 0);
    }

    #[test]
    fn test_merge_keeps_handles_valid() {
        let mut ours = ExternalRefTable::new();
        let mut theirs = ExternalRefTable::new();

        let a = fake_object();
        let b = fake_object();

        let ha = unsafe { ours.create(a) };
        let hb = unsafe { theirs.create(b) };
        assert!(ha != hb);

        ours.merge(theirs);

        assert!(ours.get(ha) == Some(a));
        assert!(ours.get(hb) == Some(b));
        assert!(ours.len() == 2);
    }
}
