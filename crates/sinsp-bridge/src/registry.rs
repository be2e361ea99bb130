use std::any::Any;
use std::ffi::c_void;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

/// A retained reference to plugin memory.
pub type Retained = Arc<dyn Any + Send + Sync>;

/// Opaque, address-sized token naming a registry entry.
///
/// Tokens come from a monotonically increasing counter and are never reused,
/// so a token that outlives its entry can only ever miss on lookup.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundaryHandle(NonZeroU64);

impl BoundaryHandle {
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The handle as an opaque pointer-sized value for the native side.
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as usize as *mut c_void
    }

    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        Self::from_raw(ptr as usize as u64)
    }
}

/// Table of references the native side may still dereference.
///
/// Anything stored here stays alive until it is explicitly deleted; there is
/// no eviction. Safe for concurrent use from worker threads and host threads.
pub struct PointerRegistry {
    entries: DashMap<BoundaryHandle, Retained>,
    next: AtomicU64,
}

impl PointerRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Mint a fresh handle and retain `value` under it.
    pub fn pin(&self, value: Retained) -> BoundaryHandle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        // Counter starts at 1 and would need 2^64 pins to wrap.
        let handle = BoundaryHandle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN));
        self.entries.insert(handle, value);
        trace!(handle = handle.as_raw(), "pinned");
        handle
    }

    /// Retain `value` under `handle`, replacing any earlier value.
    ///
    /// Returns the replaced reference so it is dropped by the caller rather
    /// than kept alive by the table.
    pub fn store(&self, handle: BoundaryHandle, value: Retained) -> Option<Retained> {
        self.entries.insert(handle, value)
    }

    pub fn get(&self, handle: BoundaryHandle) -> Option<Retained> {
        self.entries.get(&handle).map(|v| v.value().clone())
    }

    /// Typed lookup; `None` when missing or when the value is of another type.
    pub fn get_as<T: Any + Send + Sync>(&self, handle: BoundaryHandle) -> Option<Arc<T>> {
        self.get(handle)?.downcast::<T>().ok()
    }

    /// Stop retaining `handle`. Deleting a missing handle is a no-op.
    pub fn delete(&self, handle: BoundaryHandle) -> Option<Retained> {
        let removed = self.entries.remove(&handle).map(|(_, v)| v);
        if removed.is_some() {
            trace!(handle = handle.as_raw(), "released");
        }
        removed
    }

    pub fn contains(&self, handle: BoundaryHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PointerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pin_and_lookup() {
        let registry = PointerRegistry::new();
        let handle = registry.pin(Arc::new(42u32));

        assert!(registry.contains(handle));
        assert_eq!(*registry.get_as::<u32>(handle).unwrap(), 42);
        assert!(registry.get_as::<String>(handle).is_none());
    }

    #[test]
    fn test_delete_then_lookup_fails() {
        let registry = PointerRegistry::new();
        let handle = registry.pin(Arc::new("ctx".to_string()));

        assert!(registry.delete(handle).is_some());
        assert!(registry.get(handle).is_none());
        assert!(!registry.contains(handle));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let registry = PointerRegistry::new();
        let handle = registry.pin(Arc::new(1u8));
        registry.delete(handle);

        assert!(registry.delete(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_store_twice_last_write_wins_without_leak() {
        let registry = PointerRegistry::new();
        let first = Arc::new(1u64);
        let handle = registry.pin(first.clone());

        let replaced = registry.store(handle, Arc::new(2u64));
        drop(replaced);

        assert_eq!(*registry.get_as::<u64>(handle).unwrap(), 2);
        // Only the test still holds the first value.
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let registry = PointerRegistry::new();
        let a = registry.pin(Arc::new(()));
        registry.delete(a);
        let b = registry.pin(Arc::new(()));

        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
    }

    #[test]
    fn test_handle_pointer_round_trip() {
        let registry = PointerRegistry::new();
        let handle = registry.pin(Arc::new(()));

        assert_eq!(BoundaryHandle::from_ptr(handle.as_ptr()), Some(handle));
        assert_eq!(BoundaryHandle::from_raw(0), None);
    }

    #[test]
    fn test_concurrent_pin_delete() {
        let registry = Arc::new(PointerRegistry::new());

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for j in 0..200u64 {
                        let h = registry.pin(Arc::new(i * 1000 + j));
                        assert_eq!(*registry.get_as::<u64>(h).unwrap(), i * 1000 + j);
                        registry.delete(h);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
