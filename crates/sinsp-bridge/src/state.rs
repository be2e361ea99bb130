//! Opaque state handed to the host as plugin state or per-session open state.
//!
//! A container owns at most one byte buffer and refers to at most one context
//! value and one [`BatchDispatchContext`] through the [`PointerRegistry`]. The
//! host only ever sees a raw pointer to the container itself.

use std::any::Any;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::batch::BatchDispatchContext;
use crate::error::{BridgeError, Result};
use crate::registry::{BoundaryHandle, PointerRegistry, Retained};

const CONTAINER_TAG: u64 = 0x5349_4e53_5053_5443;

// `tag` must stay the first field: raw pointers are checked by reading it
// before any reference to the container is formed.
#[repr(C)]
pub struct StateContainer {
    tag: u64,
    registry: Arc<PointerRegistry>,
    buffer: Mutex<Option<Box<[u8]>>>,
    context: Option<BoundaryHandle>,
    batch: Option<BoundaryHandle>,
}

impl StateContainer {
    pub fn new(registry: Arc<PointerRegistry>) -> Self {
        Self {
            tag: CONTAINER_TAG,
            registry,
            buffer: Mutex::new(None),
            context: None,
            batch: None,
        }
    }

    pub fn registry(&self) -> &Arc<PointerRegistry> {
        &self.registry
    }

    /// Replace the owned buffer with a zeroed one of `size` bytes.
    ///
    /// Any earlier buffer is freed first; `size == 0` only frees.
    pub fn make_buffer(&self, size: usize) {
        let mut buffer = self.buffer.lock();
        *buffer = None;
        if size > 0 {
            *buffer = Some(vec![0u8; size].into_boxed_slice());
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().as_ref().map_or(0, |b| b.len())
    }

    /// Copy as much of `bytes` as fits after `offset`; returns the count copied.
    pub fn copy_into(&self, bytes: &[u8], offset: usize) -> usize {
        let mut buffer = self.buffer.lock();
        let Some(buf) = buffer.as_mut() else {
            return 0;
        };
        if offset >= buf.len() {
            return 0;
        }
        let n = (buf.len() - offset).min(bytes.len());
        buf[offset..offset + n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Replace the buffer with a copy of `bytes` and return a pointer to it,
    /// all under one lock. Null for empty input.
    pub fn fill_buffer(&self, bytes: &[u8]) -> *const u8 {
        let mut buffer = self.buffer.lock();
        *buffer = None;
        if bytes.is_empty() {
            return ptr::null();
        }
        buffer.insert(Box::from(bytes)).as_ptr()
    }

    /// Snapshot of the buffer contents.
    pub fn buffer_bytes(&self) -> Vec<u8> {
        self.buffer.lock().as_deref().map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Raw pointer to the first buffer byte, null without a buffer.
    ///
    /// The length is whatever was last passed to [`make_buffer`](Self::make_buffer);
    /// the pointer dangles after the next `make_buffer` call or destruction.
    pub fn buffer_view(&self) -> *const u8 {
        self.buffer
            .lock()
            .as_ref()
            .map_or(ptr::null(), |b| b.as_ptr())
    }

    /// Install `ctx` as the context, returning whatever it replaces.
    ///
    /// Installing a context also installs a fresh [`BatchDispatchContext`];
    /// the previous context and its dispatch context come back in the
    /// [`ReleasedContext`] for the caller to release.
    pub fn replace_context(&mut self, ctx: Option<Retained>) -> ReleasedContext {
        let released = ReleasedContext {
            registry: Arc::clone(&self.registry),
            context: self.context.take(),
            batch: self.batch.take(),
        };

        if let Some(value) = ctx {
            self.context = Some(self.registry.pin(value));
            let batch: Retained = Arc::new(BatchDispatchContext::new());
            self.batch = Some(self.registry.pin(batch));
        }

        released
    }

    /// Replace the context and release the previous one immediately.
    pub fn set_context(&mut self, ctx: Option<Retained>) {
        self.replace_context(ctx).release();
    }

    pub fn context_handle(&self) -> Option<BoundaryHandle> {
        self.context
    }

    pub fn context(&self) -> Option<Retained> {
        self.registry.get(self.context?)
    }

    pub fn context_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.registry.get_as::<T>(self.context?)
    }

    pub fn batch_handle(&self) -> Option<BoundaryHandle> {
        self.batch
    }

    pub fn batch_context(&self) -> Option<Arc<BatchDispatchContext>> {
        self.registry.get_as::<BatchDispatchContext>(self.batch?)
    }

    /// Move the container to the heap and hand out the raw pointer.
    pub fn into_raw(self) -> *mut c_void {
        Box::into_raw(Box::new(self)).cast()
    }

    /// Borrow the container behind a host-held pointer.
    ///
    /// Null and foreign pointers fail loudly.
    ///
    /// # Safety
    /// `raw` must be null or come from [`into_raw`](Self::into_raw) and not yet
    /// be passed to [`destroy`](Self::destroy). Using a destroyed container is
    /// a caller contract breach and undefined behaviour.
    pub unsafe fn from_raw_ref<'a>(raw: *mut c_void) -> Result<&'a StateContainer> {
        if raw.is_null() {
            return Err(BridgeError::ProtocolViolation("null state container"));
        }
        if ptr::read(raw as *const u64) != CONTAINER_TAG {
            return Err(BridgeError::ProtocolViolation("not a state container"));
        }
        Ok(&*(raw as *const StateContainer))
    }

    /// Mutable variant of [`from_raw_ref`](Self::from_raw_ref).
    ///
    /// # Safety
    /// As for `from_raw_ref`, and no other reference to the container may be live.
    pub unsafe fn from_raw_mut<'a>(raw: *mut c_void) -> Result<&'a mut StateContainer> {
        Self::from_raw_ref(raw)?;
        Ok(&mut *(raw as *mut StateContainer))
    }

    /// Free a container created by [`into_raw`](Self::into_raw).
    ///
    /// Releases the buffer, then the context, which cascades to the dispatch
    /// context and joins its worker.
    ///
    /// # Safety
    /// Must be called exactly once per `into_raw`, with no call in flight on
    /// the container or its session.
    pub unsafe fn destroy(raw: *mut c_void) -> Result<()> {
        Self::from_raw_ref(raw)?;
        drop(Box::from_raw(raw as *mut StateContainer));
        Ok(())
    }
}

impl Drop for StateContainer {
    fn drop(&mut self) {
        self.make_buffer(0);
        self.set_context(None);
        self.tag = 0;
        trace!("state container destroyed");
    }
}

/// Resources detached from a container by [`StateContainer::replace_context`].
///
/// Dropping it releases them as well; call [`release`](Self::release) to make
/// the point of release explicit.
#[must_use = "released resources stay pinned until release() is called or the value is dropped"]
pub struct ReleasedContext {
    registry: Arc<PointerRegistry>,
    context: Option<BoundaryHandle>,
    batch: Option<BoundaryHandle>,
}

impl ReleasedContext {
    pub fn context_handle(&self) -> Option<BoundaryHandle> {
        self.context
    }

    pub fn batch_handle(&self) -> Option<BoundaryHandle> {
        self.batch
    }

    /// Stop the dispatch worker and unpin both entries.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(handle) = self.batch.take() {
            if let Some(batch) = self
                .registry
                .delete(handle)
                .and_then(|v| v.downcast::<BatchDispatchContext>().ok())
            {
                batch.shutdown();
            }
        }
        if let Some(handle) = self.context.take() {
            self.registry.delete(handle);
        }
    }
}

impl Drop for ReleasedContext {
    fn drop(&mut self) {
        self.release_now();
    }
}
