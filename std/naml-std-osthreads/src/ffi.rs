//!
//! naml Bindings
//!
//! Runtime entry points called by generated code. Threads and locks are
//! handed to naml as refcounted heap objects; the final `*_decref` disposes
//! the underlying handle or lock.
//!
//! Blocking calls return 1 on success and 0 on timeout. Fatal errors throw a
//! `ThreadError` exception and also return 0, so callers check for a
//! pending exception before branching on the result.
//!
//! ## Exception
//!
//! ```naml
//! exception ThreadError {
//!     message: string
//! }
//! ```
//!

use std::alloc::{alloc, dealloc, Layout};

use naml_std_core::{
    naml_exception_set_typed, naml_string_from_str, take_pending_exception, HeapHeader, HeapTag,
    NamlString, EXCEPTION_TYPE_THREAD_ERROR,
};

use crate::deadline::{sleep, Seconds};
use crate::error::ThreadError;
use crate::handle::ThreadHandle;
use crate::lock::{Lock, LockKind};
use crate::outcome::WaitStatus;
use crate::registry::Registry;
use crate::spawn::ExecutionContext;

/// Task function signature: takes a pointer to captured data
type TaskFn = extern "C" fn(*mut u8);

#[repr(C)]
pub struct NamlThread {
    pub header: HeapHeader,
    handle: ThreadHandle,
}

#[repr(C)]
pub struct NamlLock {
    pub header: HeapHeader,
    lock: Lock,
}

/// Captured closure data, owned by the spawned thread and freed after the
/// task returns.
struct ClosureData {
    data: *mut u8,
    size: usize,
}

// SAFETY: the spawning side gives up the buffer when it calls
// naml_thread_new; only the new thread touches it afterwards.
unsafe impl Send for ClosureData {}

impl Drop for ClosureData {
    fn drop(&mut self) {
        if !self.data.is_null() && self.size > 0 {
            unsafe { dealloc(self.data, closure_layout(self.size)) };
        }
    }
}

fn closure_layout(size: usize) -> Layout {
    unsafe { Layout::from_size_align_unchecked(size, 8) }
}

/// Create a new ThreadError exception on the heap
///
/// Exception layout:
/// - Offset 0: message pointer (8 bytes)
/// - Offset 8: stack pointer (8 bytes)
///
/// Total size: 16 bytes
#[unsafe(no_mangle)]
pub extern "C" fn naml_thread_error_new(message: *const NamlString) -> *mut u8 {
    unsafe {
        let layout = Layout::from_size_align_unchecked(16, 8);
        let ptr = alloc(layout);
        if ptr.is_null() {
            panic!("Failed to allocate ThreadError");
        }

        *(ptr as *mut i64) = message as i64;
        *(ptr.add(8) as *mut i64) = 0;

        ptr
    }
}

fn throw_thread_error(error: &ThreadError) {
    let message = naml_string_from_str(&error.to_string());
    let exception = naml_thread_error_new(message);
    naml_exception_set_typed(exception, EXCEPTION_TYPE_THREAD_ERROR);
}

fn wait_result(result: Result<WaitStatus, ThreadError>) -> i64 {
    match result {
        Ok(status) => status.as_naml_bool(),
        Err(err) => {
            throw_thread_error(&err);
            0
        }
    }
}

/// Allocate memory for captured closure data
#[unsafe(no_mangle)]
pub extern "C" fn naml_alloc_closure_data(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    unsafe { alloc(closure_layout(size)) }
}

/// Spawn `func(data)` on a new OS thread.
///
/// Takes ownership of `data`, which must come from `naml_alloc_closure_data`
/// (or be null). An exception left pending by `func` marks the thread as
/// failed; the next join rethrows it as a ThreadError.
#[unsafe(no_mangle)]
pub extern "C" fn naml_thread_new(func: TaskFn, data: *mut u8, data_size: usize) -> *mut NamlThread {
    let closure = ClosureData { data, size: data_size };
    let context = ExecutionContext::new(
        move |closure: ClosureData| {
            func(closure.data);
            match take_pending_exception() {
                None => Ok(()),
                Some((_, Some(message))) => Err(message.into()),
                Some((type_id, None)) => Err(format!("uncaught exception (type {type_id})").into()),
            }
        },
        closure,
    );

    match Registry::global().spawn(context) {
        Ok(handle) => Box::into_raw(Box::new(NamlThread {
            header: HeapHeader::new(HeapTag::Thread),
            handle,
        })),
        Err(err) => {
            throw_thread_error(&err);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_incref(t: *mut NamlThread) {
    if !t.is_null() {
        unsafe { (*t).header.incref(); }
    }
}

/// Dropping the last reference disposes the handle without joining.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_decref(t: *mut NamlThread) {
    if !t.is_null() {
        unsafe {
            if (*t).header.decref() {
                drop(Box::from_raw(t));
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_id(t: *const NamlThread) -> i64 {
    if t.is_null() {
        return 0;
    }
    unsafe { (*t).handle.id().0 as i64 }
}

unsafe fn join_thread(t: *const NamlThread, timeout: Option<Seconds>) -> i64 {
    if t.is_null() {
        return 0;
    }
    wait_result(unsafe { (*t).handle.join(timeout) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_join(t: *const NamlThread) -> i64 {
    unsafe { join_thread(t, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_join_timeout(t: *const NamlThread, secs: i64) -> i64 {
    unsafe { join_thread(t, Some(Seconds::Whole(secs))) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_thread_join_timeout_float(t: *const NamlThread, secs: f64) -> i64 {
    unsafe { join_thread(t, Some(Seconds::Fractional(secs))) }
}

/// Join every thread still tracked by the process-wide registry.
/// Called by the runtime before exit.
#[unsafe(no_mangle)]
pub extern "C" fn naml_threads_join_all() -> i64 {
    Registry::global().join_all() as i64
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_thread_sleep(secs: i64) {
    sleep(Seconds::Whole(secs));
}

#[unsafe(no_mangle)]
pub extern "C" fn naml_thread_sleep_float(secs: f64) {
    sleep(Seconds::Fractional(secs));
}

/// Create a lock; non-zero `reentrant` selects a recursive lock.
#[unsafe(no_mangle)]
pub extern "C" fn naml_lock_new(reentrant: i64) -> *mut NamlLock {
    let kind = if reentrant != 0 { LockKind::Reentrant } else { LockKind::Plain };
    match Lock::new(kind) {
        Ok(lock) => Box::into_raw(Box::new(NamlLock {
            header: HeapHeader::new(HeapTag::Lock),
            lock,
        })),
        Err(err) => {
            throw_thread_error(&err);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_incref(l: *mut NamlLock) {
    if !l.is_null() {
        unsafe { (*l).header.incref(); }
    }
}

/// Dropping the last reference destroys the lock; it must not be held.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_decref(l: *mut NamlLock) {
    if !l.is_null() {
        unsafe {
            if (*l).header.decref() {
                drop(Box::from_raw(l));
            }
        }
    }
}

unsafe fn acquire_lock(l: *const NamlLock, timeout: Option<Seconds>) -> i64 {
    if l.is_null() {
        return 0;
    }
    wait_result(unsafe { (*l).lock.acquire(timeout) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_acquire(l: *const NamlLock) -> i64 {
    unsafe { acquire_lock(l, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_acquire_timeout(l: *const NamlLock, secs: i64) -> i64 {
    unsafe { acquire_lock(l, Some(Seconds::Whole(secs))) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_acquire_timeout_float(l: *const NamlLock, secs: f64) -> i64 {
    unsafe { acquire_lock(l, Some(Seconds::Fractional(secs))) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn naml_lock_release(l: *const NamlLock) -> i64 {
    if l.is_null() {
        return 0;
    }
    match unsafe { (*l).lock.release() } {
        Ok(()) => 1,
        Err(err) => {
            throw_thread_error(&err);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naml_std_core::{naml_exception_check, naml_exception_clear, naml_exception_get_type_id};
    use std::sync::atomic::{AtomicI64, Ordering};

    static CLOSURE_COUNTER: AtomicI64 = AtomicI64::new(0);

    extern "C" fn add_value_to_closure_counter(data: *mut u8) {
        let value = unsafe { *(data as *const i64) };
        CLOSURE_COUNTER.fetch_add(value, Ordering::SeqCst);
    }

    extern "C" fn throw_from_task(_data: *mut u8) {
        let message = naml_string_from_str("bad input");
        naml_exception_set_typed(naml_thread_error_new(message), EXCEPTION_TYPE_THREAD_ERROR);
    }

    extern "C" fn sleep_briefly(_data: *mut u8) {
        naml_thread_sleep_float(0.3);
    }

    #[test]
    fn test_thread_with_closure() {
        CLOSURE_COUNTER.store(0, Ordering::SeqCst);

        let threads: Vec<_> = (1..=5).map(|i| {
            let data = naml_alloc_closure_data(8);
            unsafe { *(data as *mut i64) = i; }
            naml_thread_new(add_value_to_closure_counter, data, 8)
        }).collect();

        for t in threads {
            unsafe {
                assert!(naml_thread_id(t) > 0);
                assert_eq!(naml_thread_join(t), 1);
                naml_thread_decref(t);
            }
        }

        assert_eq!(CLOSURE_COUNTER.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_join_timeout_then_join() {
        unsafe {
            let t = naml_thread_new(sleep_briefly, std::ptr::null_mut(), 0);
            assert_eq!(naml_thread_join_timeout_float(t, 0.05), 0);
            assert_eq!(naml_exception_check(), 0);
            assert_eq!(naml_thread_join_timeout(t, 10), 1);
            naml_thread_decref(t);
        }
    }

    #[test]
    fn test_task_exception_rethrown_on_join() {
        unsafe {
            let t = naml_thread_new(throw_from_task, std::ptr::null_mut(), 0);
            assert_eq!(naml_thread_join(t), 0);
            assert_eq!(naml_exception_check(), 1);
            assert_eq!(naml_exception_get_type_id(), EXCEPTION_TYPE_THREAD_ERROR);
            let (_, message) = take_pending_exception().unwrap();
            assert!(message.unwrap().contains("bad input"));

            // A second join is a misuse error.
            assert_eq!(naml_thread_join(t), 0);
            let (_, message) = take_pending_exception().unwrap();
            assert!(message.unwrap().contains("already been joined"));
            naml_thread_decref(t);
        }
    }

    #[test]
    fn test_dispose_without_join() {
        unsafe {
            let t = naml_thread_new(sleep_briefly, std::ptr::null_mut(), 0);
            naml_thread_incref(t);
            naml_thread_decref(t);
            naml_thread_decref(t);
        }
    }

    #[test]
    fn test_lock_bindings() {
        unsafe {
            let l = naml_lock_new(0);
            assert_eq!(naml_lock_acquire(l), 1);
            assert_ne!(naml_lock_acquire_timeout_float(l, 0.05), 1);
            naml_exception_clear();
            assert_eq!(naml_lock_release(l), 1);
            naml_lock_decref(l);

            let l = naml_lock_new(1);
            assert_eq!(naml_lock_acquire(l), 1);
            assert_eq!(naml_lock_acquire_timeout(l, 1), 1);
            assert_eq!(naml_lock_release(l), 1);
            assert_eq!(naml_lock_release(l), 1);
            assert_eq!(naml_lock_release(l), 0);
            assert_eq!(naml_exception_check(), 1);
            naml_exception_clear();
            naml_lock_decref(l);
        }
    }
}
