//!
//! Exception Handling Primitives
//!
//! Each OS thread has its own pending-exception slot. Runtime functions that
//! fail store an exception pointer there and return a sentinel; the generated
//! code checks the slot after the call and unwinds to the nearest catch.
//!
//! Every exception object starts with the same two words:
//! - Offset 0: message pointer (`*const NamlString`)
//! - Offset 8: stack pointer (0 when no trace was captured)
//!
//! Exception Type IDs:
//! - 0: Unknown/User-defined exception
//! - 1: IOError
//! - 6: TimeoutError
//! - 7: ThreadError
//!

use std::cell::Cell;

use crate::value::NamlString;

thread_local! {
    static CURRENT_EXCEPTION: Cell<*mut u8> = const { Cell::new(std::ptr::null_mut()) };
    static CURRENT_EXCEPTION_TYPE_ID: Cell<i64> = const { Cell::new(0) };
}

pub const EXCEPTION_TYPE_UNKNOWN: i64 = 0;
pub const EXCEPTION_TYPE_IO_ERROR: i64 = 1;
pub const EXCEPTION_TYPE_TIMEOUT_ERROR: i64 = 6;
pub const EXCEPTION_TYPE_THREAD_ERROR: i64 = 7;

/// Set the current exception (called by throw)
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_set(exception_ptr: *mut u8) {
    CURRENT_EXCEPTION.with(|ex| ex.set(exception_ptr));
}

/// Set the current exception with type ID
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_set_typed(exception_ptr: *mut u8, type_id: i64) {
    CURRENT_EXCEPTION.with(|ex| ex.set(exception_ptr));
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.set(type_id));
}

/// Get the current exception type ID
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_get_type_id() -> i64 {
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.get())
}

/// Get the current exception pointer (0 if none)
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_get() -> *mut u8 {
    CURRENT_EXCEPTION.with(|ex| ex.get())
}

/// Clear the current exception (called after catch handles it)
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_clear() {
    CURRENT_EXCEPTION.with(|ex| ex.set(std::ptr::null_mut()));
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.set(0));
}

/// Check if there's a pending exception
#[unsafe(no_mangle)]
pub extern "C" fn naml_exception_check() -> i64 {
    CURRENT_EXCEPTION.with(|ex| if ex.get().is_null() { 0 } else { 1 })
}

/// Reads the message word of an exception object.
///
/// # Safety
/// `exception` must be null or point to an exception laid out as described
/// in the module docs.
pub unsafe fn exception_message(exception: *const u8) -> Option<String> {
    if exception.is_null() {
        return None;
    }
    unsafe {
        let message = *(exception as *const *const NamlString);
        if message.is_null() {
            None
        } else {
            Some((*message).to_string_lossy())
        }
    }
}

/// Removes the pending exception of the calling thread, if any, and returns
/// its type ID and message.
///
/// The exception object itself stays owned by the generated code.
pub fn take_pending_exception() -> Option<(i64, Option<String>)> {
    let ptr = naml_exception_get();
    if ptr.is_null() {
        return None;
    }
    let type_id = naml_exception_get_type_id();
    let message = unsafe { exception_message(ptr) };
    naml_exception_clear();
    Some((type_id, message))
}
