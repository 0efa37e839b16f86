//!
//! Thread Handles
//!
//! Every spawned thread is backed by one heap-allocated `ThreadNode` with two
//! owners: the `ThreadHandle` returned to the caller and the registry that
//! tracks live threads. The node starts with two claims and is only ever
//! decremented; whichever owner drops the last claim frees it.
//!
//! - The handle's claim is dropped when the handle is disposed.
//! - The registry's claim travels with the list link: the party that unlinks
//!   the node (a successful `join`, or `Registry::join_all` at shutdown)
//!   drops it. A node therefore never reaches zero while still linked.
//!

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::deadline::{Deadline, Seconds};
use crate::error::ThreadError;
use crate::outcome::{classify, WaitStatus};
use crate::registry::{Ledger, Registry};

/// Global thread ID counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a spawned thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub(crate) fn next() -> Self {
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "thread panicked".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Completed,
    Failed(String),
}

/// Written once by the trampoline when the task finishes; joiners wait on it.
pub(crate) struct Completion {
    outcome: Mutex<Option<TaskOutcome>>,
    ready: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Completion {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn publish(&self, outcome: TaskOutcome) {
        let mut slot = lock_unpoisoned(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }

    pub(crate) fn is_published(&self) -> bool {
        lock_unpoisoned(&self.outcome).is_some()
    }

    /// Blocks until the outcome is published. An already finished task is
    /// reported ready even if the deadline has passed.
    pub(crate) fn wait(&self, deadline: Option<Deadline>) -> io::Result<()> {
        let mut outcome = lock_unpoisoned(&self.outcome);
        while outcome.is_none() {
            match deadline {
                None => {
                    outcome = self.ready.wait(outcome).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let remaining = deadline.remaining();
                    if remaining.is_zero() {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    outcome = self
                        .ready
                        .wait_timeout(outcome, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn failure(&self) -> Option<String> {
        match &*lock_unpoisoned(&self.outcome) {
            Some(TaskOutcome::Failed(message)) => Some(message.clone()),
            _ => None,
        }
    }
}

/// Join-related state, guarded by the node's join mutex.
pub(crate) struct JoinSlot {
    pub(crate) native: Option<JoinHandle<()>>,
    pub(crate) joined: bool,
}

/// Registry list links. Only read or written with the registry lock held.
pub(crate) struct Links {
    pub(crate) prev: *mut ThreadNode,
    pub(crate) next: *mut ThreadNode,
    pub(crate) linked: bool,
}

pub(crate) struct ThreadNode {
    id: ThreadId,
    refs: AtomicUsize,
    pub(crate) join: Mutex<JoinSlot>,
    pub(crate) completion: Arc<Completion>,
    pub(crate) links: UnsafeCell<Links>,
    ledger: Arc<Ledger>,
}

// SAFETY: `links` is only touched under the registry lock; every other field
// is Sync on its own.
unsafe impl Send for ThreadNode {}
unsafe impl Sync for ThreadNode {}

impl ThreadNode {
    /// Allocates a node holding two claims: one for the handle, one for the
    /// registry.
    pub(crate) fn alloc(id: ThreadId, ledger: Arc<Ledger>) -> NonNull<ThreadNode> {
        ledger.node_allocated();
        let node = Box::new(ThreadNode {
            id,
            refs: AtomicUsize::new(2),
            join: Mutex::new(JoinSlot {
                native: None,
                joined: false,
            }),
            completion: Arc::new(Completion::new()),
            links: UnsafeCell::new(Links {
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                linked: false,
            }),
            ledger,
        });
        NonNull::from(Box::leak(node))
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Drops one claim and frees the node if it was the last one.
    ///
    /// # Safety
    /// The caller must own an unreleased claim on `node` and must not touch
    /// the node afterwards.
    pub(crate) unsafe fn release(node: NonNull<ThreadNode>) -> bool {
        let prev = unsafe { node.as_ref() }.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "thread node released more times than claimed");
        if prev != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        drop(unsafe { Box::from_raw(node.as_ptr()) });
        true
    }

    /// Shutdown path: waits for the task without a deadline and joins the
    /// native thread if nobody has yet. Does not mark the handle as joined.
    ///
    /// A node running on the calling thread is skipped, since its task cannot
    /// finish while we wait for it. Its native handle stays in the slot for a
    /// later `join`, or is detached when the node is freed.
    pub(crate) fn reap(&self) {
        if self.runs_on_current_thread() {
            tracing::debug!(thread = %self.id, "registry drained from its own thread, not waiting");
            return;
        }
        if let Err(err) = self.completion.wait(None) {
            tracing::warn!(thread = %self.id, error = %err, "failed waiting for thread to finish");
            return;
        }
        let native = lock_unpoisoned(&self.join).native.take();
        if let Some(native) = native {
            if let Err(payload) = native.join() {
                tracing::error!(
                    thread = %self.id,
                    message = %panic_message(payload.as_ref()),
                    "thread trampoline panicked"
                );
            }
        }
        tracing::trace!(thread = %self.id, "thread reaped by registry");
    }

    fn runs_on_current_thread(&self) -> bool {
        lock_unpoisoned(&self.join)
            .native
            .as_ref()
            .is_some_and(|native| native.thread().id() == thread::current().id())
    }
}

impl Drop for ThreadNode {
    fn drop(&mut self) {
        debug_assert!(!self.links.get_mut().linked, "freed a thread node still in the registry");
        self.ledger.node_freed();
        tracing::trace!(thread = %self.id, "thread node freed");
    }
}

/// The caller's reference to a spawned thread.
///
/// Dropping the handle does not wait for the thread; it only gives up the
/// caller's claim. Threads that are never joined are joined by the registry
/// at shutdown.
pub struct ThreadHandle {
    node: NonNull<ThreadNode>,
    registry: Arc<Registry>,
}

// SAFETY: the handle owns a claim that keeps the node alive, and all shared
// node state is synchronized.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    pub(crate) fn from_parts(node: NonNull<ThreadNode>, registry: Arc<Registry>) -> Self {
        ThreadHandle { node, registry }
    }

    fn node(&self) -> &ThreadNode {
        // SAFETY: the handle's claim is released only in Drop.
        unsafe { self.node.as_ref() }
    }

    pub fn id(&self) -> ThreadId {
        self.node().id()
    }

    /// True once the task has returned, failed or panicked.
    pub fn is_finished(&self) -> bool {
        self.node().completion.is_published()
    }

    /// True once a join on this handle has succeeded.
    pub fn is_joined(&self) -> bool {
        lock_unpoisoned(&self.node().join).joined
    }

    /// Wait for the thread to finish, for at most `timeout` seconds.
    ///
    /// A timed-out join leaves the handle joinable. Once a join succeeds the
    /// thread is retired from the registry and further joins fail with
    /// `AlreadyJoined`. A task that failed is reported as `TaskFailed` after
    /// the thread has been retired.
    pub fn join(&self, timeout: Option<Seconds>) -> Result<WaitStatus, ThreadError> {
        let node = self.node();
        let deadline = Deadline::from_timeout(timeout);

        // The slot is never held across a wait, so a timed join keeps its
        // deadline while `join_all` is reaping the same thread.
        if lock_unpoisoned(&node.join).joined {
            return Err(ThreadError::AlreadyJoined { thread: node.id() });
        }

        if classify(node.completion.wait(deadline))? == WaitStatus::TimedOut {
            tracing::trace!(thread = %node.id(), "join timed out");
            return Ok(WaitStatus::TimedOut);
        }

        let mut slot = lock_unpoisoned(&node.join);
        if slot.joined {
            return Err(ThreadError::AlreadyJoined { thread: node.id() });
        }
        slot.joined = true;
        let native = slot.native.take();
        drop(slot);

        let mut trampoline_panic = None;
        if let Some(native) = native {
            if let Err(payload) = native.join() {
                trampoline_panic = Some(panic_message(payload.as_ref()));
            }
        }

        if self.registry.retire(self.node) {
            // SAFETY: retire handed us the registry's claim; ours keeps the
            // node alive past this call.
            unsafe { ThreadNode::release(self.node) };
        }
        tracing::trace!(thread = %node.id(), "thread joined");

        match trampoline_panic.or_else(|| node.completion.failure()) {
            Some(message) => Err(ThreadError::TaskFailed {
                thread: node.id(),
                message,
            }),
            None => Ok(WaitStatus::Ready),
        }
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("refs", &self.node().refcount())
            .finish()
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        tracing::trace!(thread = %self.id(), "thread handle disposed");
        // SAFETY: this is the handle's own claim, released exactly once.
        unsafe { ThreadNode::release(self.node) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_node_freed_only_after_both_claims() {
        let ledger = Arc::new(Ledger::default());
        let node = ThreadNode::alloc(ThreadId::next(), Arc::clone(&ledger));

        assert_eq!(unsafe { node.as_ref() }.refcount(), 2);
        assert!(!unsafe { ThreadNode::release(node) });
        assert_eq!(ledger.snapshot().freed, 0);
        assert!(unsafe { ThreadNode::release(node) });
        assert_eq!(ledger.snapshot().freed, 1);
        assert_eq!(ledger.snapshot().live, 0);
    }

    #[test]
    fn test_racing_releases_free_once() {
        let ledger = Arc::new(Ledger::default());
        for _ in 0..200 {
            let node = ThreadNode::alloc(ThreadId::next(), Arc::clone(&ledger));
            let addr = node.as_ptr() as usize;
            let other = std::thread::spawn(move || {
                let node = NonNull::new(addr as *mut ThreadNode).unwrap();
                unsafe { ThreadNode::release(node) }
            });
            let mine = unsafe { ThreadNode::release(node) };
            let theirs = other.join().unwrap();
            assert!(mine ^ theirs);
        }
        assert_eq!(ledger.snapshot().freed, 200);
    }

    #[test]
    fn test_completion_wait_times_out_then_succeeds() {
        let completion = Arc::new(Completion::new());
        let soon = Deadline::after(Deadline::now(), Seconds::Fractional(0.05));
        let err = completion.wait(Some(soon)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let publisher = Arc::clone(&completion);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish(TaskOutcome::Failed("boom".to_string()));
        });
        completion.wait(None).unwrap();
        t.join().unwrap();

        // Already published: a past deadline still reports ready.
        let past = Deadline::after(Deadline::now(), Seconds::Whole(-1));
        completion.wait(Some(past)).unwrap();
        assert_eq!(completion.failure().as_deref(), Some("boom"));
    }

    #[test]
    fn test_completion_keeps_first_outcome() {
        let completion = Completion::new();
        completion.publish(TaskOutcome::Completed);
        completion.publish(TaskOutcome::Failed("late".to_string()));
        assert!(completion.is_published());
        assert!(completion.failure().is_none());
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "thread panicked");
    }
}
