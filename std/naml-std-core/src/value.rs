//!
//! Runtime Heap Objects
//!
//! Every heap object handed to naml code starts with a `HeapHeader` so the
//! generated code can incref/decref it without knowing its concrete type.
//! The object is dropped by whichever decref observes the count reach zero.
//!
//! The standard library crates that expose native resources to naml
//! (threads, locks) embed the header in their own `#[repr(C)]` wrappers and
//! provide typed `*_incref` / `*_decref` entry points on top of it.
//!

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Type tags for heap objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTag {
    String = 0,
    Thread = 9,
    Lock = 10,
}

/// Header for all heap-allocated objects
#[repr(C)]
pub struct HeapHeader {
    pub refcount: AtomicUsize,
    pub tag: HeapTag,
    pub _pad: [u8; 7],
}

impl HeapHeader {
    pub fn new(tag: HeapTag) -> Self {
        Self {
            refcount: AtomicUsize::new(1),
            tag,
            _pad: [0; 7],
        }
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when this call released the last reference.
    pub fn decref(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// A heap-allocated string
#[repr(C)]
pub struct NamlString {
    pub header: HeapHeader,
    pub len: usize,
    pub data: [u8; 0],
}

impl NamlString {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// Copies the contents out, replacing invalid UTF-8 sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

fn string_layout(len: usize) -> Layout {
    match Layout::from_size_align(
        std::mem::size_of::<NamlString>() + len,
        std::mem::align_of::<NamlString>(),
    ) {
        Ok(layout) => layout,
        Err(_) => panic!("String of {} bytes exceeds the maximum allocation size", len),
    }
}

/// Allocate a new string on the heap
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_string_new(data: *const u8, len: usize) -> *mut NamlString {
    unsafe {
        let ptr = alloc(string_layout(len)) as *mut NamlString;
        if ptr.is_null() {
            panic!("Failed to allocate string");
        }

        std::ptr::addr_of_mut!((*ptr).header).write(HeapHeader::new(HeapTag::String));
        std::ptr::addr_of_mut!((*ptr).len).write(len);

        if !data.is_null() && len > 0 {
            std::ptr::copy_nonoverlapping(data, (*ptr).data.as_mut_ptr(), len);
        }

        ptr
    }
}

/// Allocate a naml string holding a copy of `s`
pub fn naml_string_from_str(s: &str) -> *mut NamlString {
    unsafe { naml_string_new(s.as_ptr(), s.len()) }
}

/// Increment reference count of a string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_string_incref(s: *mut NamlString) {
    if !s.is_null() {
        unsafe { (*s).header.incref(); }
    }
}

/// Decrement reference count and free if zero
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_string_decref(s: *mut NamlString) {
    if !s.is_null() {
        unsafe {
            if (*s).header.decref() {
                dealloc(s as *mut u8, string_layout((*s).len));
            }
        }
    }
}

/// Get string length
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_string_len(s: *const NamlString) -> i64 {
    if s.is_null() {
        0
    } else {
        unsafe { (*s).len as i64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let s = naml_string_from_str("deadlock avoided");
        unsafe {
            assert_eq!(naml_string_len(s), 16);
            assert_eq!((*s).to_string_lossy(), "deadlock avoided");
            assert_eq!((*s).header.tag, HeapTag::String);
            naml_string_decref(s);
        }
    }

    #[test]
    fn test_header_decref_reports_last_release() {
        let header = HeapHeader::new(HeapTag::Lock);
        header.incref();
        assert_eq!(header.refcount(), 2);
        assert!(!header.decref());
        assert!(header.decref());
    }
}
