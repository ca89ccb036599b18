use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

/// A container for a bare pointer to an object of type `T`.
/// At this level, compile-time type information is still
/// part of the type.
pub struct RawPtr<T: Sized> {
    ptr: *const T,
}

impl<T: Sized> RawPtr<T> {
    /// Create a new RawPtr from a bare pointer
    pub fn new(ptr: *const T) -> RawPtr<T> {
        RawPtr { ptr }
    }

    /// The null pointer, used as the end marker of sweep-time lists
    pub fn null() -> RawPtr<T> {
        RawPtr {
            ptr: std::ptr::null(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Get a `*const` copy of the bare pointer
    pub fn as_ptr(self) -> *const T {
        self.ptr
    }

    /// The pointer as a bare word, for tagging and address comparison
    pub fn as_word(self) -> usize {
        self.ptr as usize
    }

    /// Reinterpret the pointee type without changing the address
    pub fn cast<U>(self) -> RawPtr<U> {
        RawPtr::new(self.ptr as *const U)
    }

    /// Get a `NonNull` copy of the bare pointer. Panics on null.
    pub fn non_null(self) -> NonNull<T> {
        NonNull::new(self.ptr as *mut T).expect("null RawPtr")
    }

    /// Get a `&` reference to the object. Unsafe because there are no
    /// guarantees at this level about the pointer's validity, and the
    /// returned lifetime is whatever the caller asks for.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.ptr
    }
}

impl<T> Clone for RawPtr<T> {
    fn clone(&self) -> RawPtr<T> {
        RawPtr { ptr: self.ptr }
    }
}

impl<T> Copy for RawPtr<T> {}

impl<T: Sized> PartialEq for RawPtr<T> {
    fn eq(&self, other: &RawPtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Sized> Eq for RawPtr<T> {}

/// Identity hashing, so tables can key on object addresses
impl<T: Sized> Hash for RawPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.ptr as usize);
    }
}

impl<T> fmt::Debug for RawPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawPtr({:p})", self.ptr)
    }
}
