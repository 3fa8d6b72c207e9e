//! Opaque handle type and the process-wide (per-`Runtime`) handle registry.
//!
//! A single `HandleRegistry`, owned by the `Runtime`, holds every live
//! object behind a type-erased `Arc<dyn Any>` and downcasts at lookup
//! time, rather than giving each object kind its own static
//! `handle -> *mut T` map (which has an initialization-order hazard and
//! can't support more than one runtime instance per process).

use hashbrown::HashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A 64-bit opaque identifier exchanged with clients.
///
/// Handles are stable for the lifetime of the object they name and are
/// released when the object is destroyed. The default materialisation is
/// a monotonically increasing counter; callers that need the handle to be
/// directly dereferenceable (signals) mint their own via
/// [`Handle::from_raw`] instead of going through the registry's allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn from_raw(v: u64) -> Handle {
        Handle(v)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Type-erased, reference-counted home for every live core object.
///
/// Readers-writer locked: lookups (the hot path, e.g. resolving a
/// `kernel_object` handle on every dispatched packet) take a shared lock;
/// registration/removal take an exclusive one.
pub struct HandleRegistry {
    next: AtomicU64,
    objects: RwLock<HashMap<Handle, Arc<dyn Any + Send + Sync>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        HandleRegistry {
            // 0 is reserved for `Handle::NULL`.
            next: AtomicU64::new(1),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Mints a fresh handle and registers `object` under it.
    pub fn insert<T: Any + Send + Sync>(&self, object: T) -> Handle {
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed));
        self.insert_at(handle, object);
        handle
    }

    /// Registers `object` under a caller-chosen handle (used by `Signal`,
    /// whose handle must equal the address of its value cell rather than
    /// an allocator-assigned counter).
    pub fn insert_at<T: Any + Send + Sync>(&self, handle: Handle, object: T) {
        self.objects
            .write()
            .expect("handle registry poisoned")
            .insert(handle, Arc::new(object));
    }

    /// Mints a fresh handle for an `Arc` the caller already holds
    /// elsewhere (e.g. a `Queue` also kept in an agent's drain list),
    /// rather than wrapping it in a second `Arc` the way `insert` would.
    pub fn insert_arc<T: Any + Send + Sync>(&self, object: Arc<T>) -> Handle {
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed));
        self.objects
            .write()
            .expect("handle registry poisoned")
            .insert(handle, object as Arc<dyn Any + Send + Sync>);
        handle
    }

    /// Resolves a handle to a strongly-typed `Arc`, or `None` if the
    /// handle is stale, null, or names an object of a different type.
    pub fn get<T: Any + Send + Sync>(&self, handle: Handle) -> Option<Arc<T>> {
        if handle.is_null() {
            return None;
        }
        let objects = self.objects.read().expect("handle registry poisoned");
        let any = objects.get(&handle)?.clone();
        any.downcast::<T>().ok()
    }

    /// Releases the handle. Returns whether it was present.
    pub fn remove(&self, handle: Handle) -> bool {
        self.objects
            .write()
            .expect("handle registry poisoned")
            .remove(&handle)
            .is_some()
    }

    /// Drops every registered object. Used by `Runtime::shut_down` when the
    /// caller guarantees there are no dangling references left, mirroring
    /// `HSAObjectMapping::garbageCollect`.
    pub fn garbage_collect(&self) {
        self.objects.write().expect("handle registry poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("handle registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let reg = HandleRegistry::new();
        let h = reg.insert(42u32);
        assert_eq!(*reg.get::<u32>(h).unwrap(), 42);
    }

    #[test]
    fn wrong_type_misses() {
        let reg = HandleRegistry::new();
        let h = reg.insert(42u32);
        assert!(reg.get::<u64>(h).is_none());
    }

    #[test]
    fn remove_releases_handle() {
        let reg = HandleRegistry::new();
        let h = reg.insert(1u8);
        assert!(reg.remove(h));
        assert!(reg.get::<u8>(h).is_none());
        assert!(!reg.remove(h));
    }

    #[test]
    fn null_handle_never_resolves() {
        let reg = HandleRegistry::new();
        assert!(reg.get::<u8>(Handle::NULL).is_none());
    }

    #[test]
    fn insert_arc_shares_the_same_allocation() {
        let reg = HandleRegistry::new();
        let shared = Arc::new(7u32);
        let h = reg.insert_arc(shared.clone());
        let resolved = reg.get::<u32>(h).unwrap();
        assert!(Arc::ptr_eq(&shared, &resolved));
    }
}
