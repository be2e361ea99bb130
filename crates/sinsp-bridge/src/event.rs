use std::mem;
use std::ptr::{self, NonNull};

use crate::abi::ss_plugin_event;
use crate::error::{BridgeError, Result};
use crate::native;

/// One event produced by a source plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEvent {
    pub data: Vec<u8>,
    pub timestamp: u64,
    pub evtnum: Option<u64>,
}

impl PluginEvent {
    pub fn new(data: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            evtnum: None,
        }
    }

    pub fn with_evtnum(mut self, evtnum: u64) -> Self {
        self.evtnum = Some(evtnum);
        self
    }
}

/// A contiguous, `malloc`-owned array of event records and their payloads.
///
/// While held on the Rust side everything is freed on drop. [`into_raw`]
/// transfers the whole block to the host, which frees each payload and then
/// the array itself.
///
/// [`into_raw`]: NativeEventArray::into_raw
#[derive(Debug)]
pub struct NativeEventArray {
    records: Option<NonNull<ss_plugin_event>>,
    len: usize,
}

// The array exclusively owns its allocations.
unsafe impl Send for NativeEventArray {}

impl NativeEventArray {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn records(&self) -> &[ss_plugin_event] {
        match self.records {
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Payload bytes of record `idx`.
    pub fn payload(&self, idx: usize) -> Option<&[u8]> {
        let rec = self.records().get(idx)?;
        Some(unsafe { native::borrow_bytes(rec.data, rec.datalen) })
    }

    /// Hand the block to the host. The returned pointer is null for an empty array.
    pub fn into_raw(self) -> (*mut ss_plugin_event, u32) {
        let raw = self.records.map_or(ptr::null_mut(), NonNull::as_ptr);
        let len = self.len as u32;
        mem::forget(self);
        (raw, len)
    }

    /// Reclaim a block previously returned by [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// `raw` must be null or an array of `len` records produced by [`marshal`]
    /// that has not been freed.
    pub unsafe fn from_raw(raw: *mut ss_plugin_event, len: u32) -> Self {
        let records = NonNull::new(raw);
        Self {
            len: if records.is_some() { len as usize } else { 0 },
            records,
        }
    }
}

impl Drop for NativeEventArray {
    fn drop(&mut self) {
        if let Some(p) = self.records.take() {
            unsafe {
                for rec in std::slice::from_raw_parts(p.as_ptr(), self.len) {
                    native::free(rec.data as *mut u8);
                }
                native::free(p.as_ptr());
            }
        }
    }
}

/// Convert `events` into one native array suitable for returning to the host.
///
/// Either every record is filled or nothing is: on any allocation failure the
/// buffers allocated so far are freed and the whole call fails.
pub fn marshal(events: &[PluginEvent]) -> Result<NativeEventArray> {
    marshal_with(events, native::copy_bytes)
}

pub(crate) fn marshal_with<F>(events: &[PluginEvent], mut copy: F) -> Result<NativeEventArray>
where
    F: FnMut(&[u8]) -> Result<NonNull<u8>>,
{
    if events.is_empty() {
        return Ok(NativeEventArray {
            records: None,
            len: 0,
        });
    }

    for evt in events {
        if u32::try_from(evt.data.len()).is_err() {
            return Err(BridgeError::Allocation {
                size: evt.data.len(),
            });
        }
    }

    let size = events.len() * mem::size_of::<ss_plugin_event>();
    let records = native::alloc(size)?.cast::<ss_plugin_event>();

    let mut payloads: Vec<NonNull<u8>> = Vec::with_capacity(events.len());
    for (idx, evt) in events.iter().enumerate() {
        let data = match copy(&evt.data) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    for p in payloads {
                        native::free(p.as_ptr());
                    }
                    native::free(records.as_ptr());
                }
                return Err(e);
            }
        };
        payloads.push(data);
        unsafe {
            records.as_ptr().add(idx).write(ss_plugin_event {
                evtnum: evt.evtnum.unwrap_or(0),
                data: data.as_ptr(),
                datalen: evt.data.len() as u32,
                ts: evt.timestamp,
            });
        }
    }

    Ok(NativeEventArray {
        records: Some(records),
        len: events.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_two_events() {
        let events = vec![PluginEvent::new("a", 1), PluginEvent::new("bb", 2)];
        let array = marshal(&events).unwrap();

        assert_eq!(array.len(), 2);
        let recs = array.records();
        assert_eq!(recs[0].datalen, 1);
        assert_eq!(recs[1].datalen, 2);
        assert_eq!(recs[0].ts, 1);
        assert_eq!(recs[1].ts, 2);
        assert_eq!(array.payload(0).unwrap(), b"a");
        assert_eq!(array.payload(1).unwrap(), b"bb");
    }

    #[test]
    fn test_marshal_through_raw_handoff() {
        let events = vec![PluginEvent::new("abc", 7).with_evtnum(3)];
        let (raw, len) = marshal(&events).unwrap().into_raw();
        assert!(!raw.is_null());

        let back = unsafe { NativeEventArray::from_raw(raw, len) };
        assert_eq!(back.records()[0].evtnum, 3);
        assert_eq!(back.payload(0).unwrap(), b"abc");
    }

    #[test]
    fn test_marshal_empty_is_null() {
        let (raw, len) = marshal(&[]).unwrap().into_raw();
        assert!(raw.is_null());
        assert_eq!(len, 0);
    }

    #[test]
    fn test_payloads_are_independent() {
        let events = vec![PluginEvent::new("x", 1), PluginEvent::new("x", 1)];
        let array = marshal(&events).unwrap();
        let recs = array.records();
        assert_ne!(recs[0].data, recs[1].data);
    }

    #[test]
    fn test_mid_sequence_failure_is_atomic() {
        let events: Vec<_> = (0..4).map(|i| PluginEvent::new(vec![i; 8], 0)).collect();
        let mut calls = 0;
        let result = marshal_with(&events, |bytes| {
            calls += 1;
            if calls == 3 {
                Err(BridgeError::Allocation { size: bytes.len() })
            } else {
                native::copy_bytes(bytes)
            }
        });

        assert!(matches!(result, Err(BridgeError::Allocation { size: 8 })));
        assert_eq!(calls, 3);
    }
}
