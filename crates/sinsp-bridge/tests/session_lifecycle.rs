use std::sync::Arc;

use parking_lot::Mutex;
use sinsp_bridge::{
    marshal, BridgeError, NativeEventArray, PluginEvent, PointerRegistry, ReturnCode,
    StateContainer,
};

struct Counter {
    next: u64,
    limit: u64,
}

fn open_session(registry: &Arc<PointerRegistry>, limit: u64) -> *mut std::ffi::c_void {
    let session = Arc::new(Mutex::new(Counter { next: 0, limit }));
    let mut container = StateContainer::new(registry.clone());
    container.set_context(Some(session.clone()));

    let batch = container.batch_context().unwrap();
    batch
        .start(move || {
            let mut s = session.lock();
            if s.next >= s.limit {
                return Err(BridgeError::Eof);
            }
            s.next += 1;
            Ok(PluginEvent::new(format!("evt{}", s.next), s.next))
        })
        .unwrap();

    container.into_raw()
}

#[test]
fn test_batch_short_then_exhausted() {
    let registry = Arc::new(PointerRegistry::new());
    let raw = open_session(&registry, 3);
    let container = unsafe { StateContainer::from_raw_ref(raw) }.unwrap();
    let batch = container.batch_context().unwrap();

    let first = batch.request_batch(8).unwrap();
    assert_eq!(first.rc, ReturnCode::Success);
    assert_eq!(first.events.len(), 3);

    let array = marshal(&first.events).unwrap();
    let (ptr, len) = array.into_raw();
    let back = unsafe { NativeEventArray::from_raw(ptr, len) };
    assert_eq!(back.payload(2).unwrap(), b"evt3");
    assert_eq!(back.records()[2].ts, 3);

    // Exhaustion is sticky for the rest of the session.
    let second = batch.request_batch(8);
    assert_eq!(second.unwrap_err().return_code(), ReturnCode::Eof);

    drop(batch);
    unsafe { StateContainer::destroy(raw) }.unwrap();
    assert!(registry.is_empty());
}

#[test]
fn test_empty_first_batch_surfaces_code() {
    let registry = Arc::new(PointerRegistry::new());
    let raw = open_session(&registry, 0);
    let container = unsafe { StateContainer::from_raw_ref(raw) }.unwrap();

    let batch = container.batch_context().unwrap().request_batch(8).unwrap();
    assert!(batch.events.is_empty());
    assert_eq!(batch.rc, ReturnCode::Eof);

    unsafe { StateContainer::destroy(raw) }.unwrap();
}

#[test]
fn test_sessions_share_registry_but_not_state() {
    let registry = Arc::new(PointerRegistry::new());
    let a = open_session(&registry, 10);
    let b = open_session(&registry, 10);
    assert_eq!(registry.len(), 4);

    let ca = unsafe { StateContainer::from_raw_ref(a) }.unwrap();
    let cb = unsafe { StateContainer::from_raw_ref(b) }.unwrap();
    ca.batch_context().unwrap().request_next().unwrap();
    ca.batch_context().unwrap().request_next().unwrap();
    let from_b = cb.batch_context().unwrap().request_next().unwrap();
    assert_eq!(from_b.timestamp, 1);

    unsafe { StateContainer::destroy(a) }.unwrap();
    assert_eq!(registry.len(), 2);
    unsafe { StateContainer::destroy(b) }.unwrap();
    assert!(registry.is_empty());
}
