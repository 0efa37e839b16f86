//!
//! Lock Implementation for naml
//!
//! A lock wraps a native pthread mutex. Unlike `with_mutex`, it guards no
//! value: naml code brackets its own critical sections with `acquire` and
//! `release`, possibly across function boundaries, which rules out
//! guard-based Rust mutexes.
//!
//! Usage in naml:
//! ```naml
//! var l: lock = threads.new_lock(false);
//! if (l.acquire(0.5)) {
//!     counter = counter + 1;
//!     l.release();
//! }
//! ```
//!
//! A reentrant lock may be acquired repeatedly by the thread that holds it
//! and must be released the same number of times. A plain lock acquired
//! twice by the same thread deadlocks; a timed acquire times out instead.
//!

use std::cell::UnsafeCell;

use crate::deadline::{Deadline, Seconds};
use crate::error::ThreadError;
use crate::outcome::{classify, os_status, WaitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Plain,
    Reentrant,
}

impl LockKind {
    fn pthread_type(self) -> libc::c_int {
        match self {
            LockKind::Plain => libc::PTHREAD_MUTEX_NORMAL,
            LockKind::Reentrant => libc::PTHREAD_MUTEX_RECURSIVE,
        }
    }
}

pub struct Lock {
    // Boxed so the mutex never moves after pthread_mutex_init.
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    kind: LockKind,
}

// SAFETY: pthread mutexes are designed to be shared between threads; all
// access goes through the pthread API.
unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    pub fn new(kind: LockKind) -> Result<Self, ThreadError> {
        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            os_status(libc::pthread_mutexattr_init(&mut attr))?;
            let configured = os_status(libc::pthread_mutexattr_settype(&mut attr, kind.pthread_type()))
                .and_then(|()| os_status(libc::pthread_mutex_init(raw.get(), &attr)));
            libc::pthread_mutexattr_destroy(&mut attr);
            configured?;
        }

        tracing::trace!(?kind, "lock created");
        Ok(Lock { raw, kind })
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Block until the lock is held, or until `timeout` seconds have passed.
    pub fn acquire(&self, timeout: Option<Seconds>) -> Result<WaitStatus, ThreadError> {
        let code = match Deadline::from_timeout(timeout) {
            None => unsafe { libc::pthread_mutex_lock(self.raw.get()) },
            Some(deadline) => {
                let abstime = deadline.to_timespec();
                unsafe { libc::pthread_mutex_timedlock(self.raw.get(), &abstime) }
            }
        };
        classify(os_status(code))
    }

    pub fn release(&self) -> Result<(), ThreadError> {
        let code = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        os_status(code).map_err(ThreadError::Os)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // Destroying a held lock is undefined; callers release before the
        // last reference goes away.
        let code = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
        if code != 0 {
            tracing::warn!(
                kind = ?self.kind,
                error = %std::io::Error::from_raw_os_error(code),
                "failed to destroy lock"
            );
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_basic() {
        let lock = Lock::new(LockKind::Plain).unwrap();
        assert_eq!(lock.kind(), LockKind::Plain);
        assert_eq!(lock.acquire(None).unwrap(), WaitStatus::Ready);
        lock.release().unwrap();
        assert_eq!(lock.acquire(Some(Seconds::Whole(1))).unwrap(), WaitStatus::Ready);
        lock.release().unwrap();
    }

    #[test]
    fn test_plain_lock_is_not_reentrant() {
        let lock = Lock::new(LockKind::Plain).unwrap();
        lock.acquire(None).unwrap();

        let second = lock.acquire(Some(Seconds::Fractional(0.1)));
        assert!(!matches!(second, Ok(WaitStatus::Ready)));

        lock.release().unwrap();
    }

    #[test]
    fn test_reentrant_lock_counts_acquisitions() {
        let lock = Arc::new(Lock::new(LockKind::Reentrant).unwrap());
        const DEPTH: usize = 3;

        for _ in 0..DEPTH {
            assert_eq!(lock.acquire(Some(Seconds::Whole(1))).unwrap(), WaitStatus::Ready);
        }
        for _ in 0..DEPTH - 1 {
            lock.release().unwrap();
        }

        let contender = Arc::clone(&lock);
        let status = thread::spawn(move || {
            let status = contender.acquire(Some(Seconds::Fractional(0.1))).unwrap();
            if status.is_ready() {
                contender.release().unwrap();
            }
            status
        })
        .join()
        .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);

        lock.release().unwrap();

        let contender = Arc::clone(&lock);
        let status = thread::spawn(move || {
            let status = contender.acquire(Some(Seconds::Whole(5))).unwrap();
            contender.release().unwrap();
            status
        })
        .join()
        .unwrap();
        assert_eq!(status, WaitStatus::Ready);
    }

    #[test]
    fn test_reentrant_release_without_hold_is_fatal() {
        let lock = Lock::new(LockKind::Reentrant).unwrap();
        let err = lock.release().unwrap_err();
        match err {
            ThreadError::Os(io) => assert_eq!(io.raw_os_error(), Some(libc::EPERM)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_lock_concurrent() {
        let lock = Arc::new(Lock::new(LockKind::Plain).unwrap());
        let counter = Arc::new(std::sync::atomic::AtomicI64::new(0));

        let handles: Vec<_> = (0..8).map(|_| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.acquire(None).unwrap();
                    // Non-atomic read-modify-write made safe by the lock.
                    let value = counter.load(std::sync::atomic::Ordering::Relaxed);
                    counter.store(value + 1, std::sync::atomic::Ordering::Relaxed);
                    lock.release().unwrap();
                }
            })
        }).collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 1600);
    }
}
