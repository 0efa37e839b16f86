//!
//! Thread Registry
//!
//! The registry is the second owner of every spawned thread. It keeps an
//! intrusive doubly-linked list of the nodes it still holds a claim on, so
//! threads whose handles were dropped without a join are still joined at
//! shutdown instead of leaking.
//!
//! The list is a tracking set: new threads are pushed at the head and no
//! traversal order is promised. It is only mutated under `list`'s lock.
//!
//! ## Shutdown
//!
//! `join_all` drains the list, waiting for every outstanding thread to
//! finish, so a task that never returns blocks shutdown. The process-wide
//! registry is drained by `naml_threads_join_all`, which the runtime calls
//! before exit; private registries drain themselves when dropped.
//!
//! The one thread `join_all` does not wait for is the calling thread. This
//! happens when a task drains the registry itself, or holds the last
//! reference to a private registry. That thread's node is unlinked without a
//! join, and its native thread is detached once the handle is gone too.
//!
//! ## Disposed handles
//!
//! Dropping a `ThreadHandle` without joining only gives up the caller's
//! claim. The node stays linked, and the finished thread's native handle and
//! stack stay unreclaimed, until `join_all` runs. Programs that spawn many
//! fire-and-forget threads should join them or drain the registry
//! periodically.
//!

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::ThreadConfig;
use crate::handle::{lock_unpoisoned, ThreadId, ThreadNode};

/// Counters shared by a registry and the nodes and contexts it created.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    spawned: AtomicU64,
    live: AtomicUsize,
    freed: AtomicU64,
    anchored: AtomicUsize,
}

impl Ledger {
    pub(crate) fn node_allocated(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn node_freed(&self) {
        self.freed.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn anchor(&self) {
        self.anchored.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unanchor(&self) {
        self.anchored.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            spawned: self.spawned.load(Ordering::Acquire),
            live: self.live.load(Ordering::Acquire),
            freed: self.freed.load(Ordering::Acquire),
            anchored: self.anchored.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of a registry's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Thread nodes ever allocated.
    pub spawned: u64,
    /// Nodes allocated and not yet freed.
    pub live: usize,
    /// Nodes freed. Never exceeds `spawned`.
    pub freed: u64,
    /// Execution contexts whose task has not finished yet.
    pub anchored: usize,
}

struct ThreadList {
    head: *mut ThreadNode,
    len: usize,
}

// SAFETY: the raw pointers are only dereferenced with the registry lock held.
unsafe impl Send for ThreadList {}

impl ThreadList {
    const fn new() -> Self {
        ThreadList {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    /// `node` must be alive and not currently linked.
    unsafe fn push_front(&mut self, node: NonNull<ThreadNode>) {
        unsafe {
            let links = &mut *node.as_ref().links.get();
            debug_assert!(!links.linked);
            links.prev = ptr::null_mut();
            links.next = self.head;
            links.linked = true;
            if let Some(head) = NonNull::new(self.head) {
                (*head.as_ref().links.get()).prev = node.as_ptr();
            }
        }
        self.head = node.as_ptr();
        self.len += 1;
    }

    /// Removes `node` if it is linked. Returns whether it was.
    ///
    /// # Safety
    /// `node` must be alive.
    unsafe fn unlink(&mut self, node: NonNull<ThreadNode>) -> bool {
        unsafe {
            let links = &mut *node.as_ref().links.get();
            if !links.linked {
                return false;
            }
            match NonNull::new(links.prev) {
                None => self.head = links.next,
                Some(prev) => (*prev.as_ref().links.get()).next = links.next,
            }
            if let Some(next) = NonNull::new(links.next) {
                (*next.as_ref().links.get()).prev = links.prev;
            }
            links.prev = ptr::null_mut();
            links.next = ptr::null_mut();
            links.linked = false;
        }
        self.len -= 1;
        true
    }

    fn pop_front(&mut self) -> Option<NonNull<ThreadNode>> {
        let head = NonNull::new(self.head)?;
        // SAFETY: linked nodes hold the registry's claim and are alive.
        unsafe { self.unlink(head) };
        Some(head)
    }

    fn ids(&self) -> Vec<ThreadId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(node) = NonNull::new(cursor) {
            // SAFETY: linked nodes hold the registry's claim and are alive.
            unsafe {
                ids.push(node.as_ref().id());
                cursor = (*node.as_ref().links.get()).next;
            }
        }
        ids
    }
}

pub struct Registry {
    list: Mutex<ThreadList>,
    pub(crate) ledger: Arc<Ledger>,
    config: ThreadConfig,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    pub fn new(config: ThreadConfig) -> Arc<Self> {
        Arc::new(Registry {
            list: Mutex::new(ThreadList::new()),
            ledger: Arc::new(Ledger::default()),
            config,
        })
    }

    /// The process-wide registry used by `spawn` and the naml bindings.
    ///
    /// Empty at process start; configured from the environment on first use.
    pub fn global() -> &'static Arc<Registry> {
        GLOBAL.get_or_init(|| {
            let config = ThreadConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to default thread configuration");
                ThreadConfig::default()
            });
            Registry::new(config)
        })
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// Number of threads the registry still holds a claim on.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.list).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_threads(&self) -> Vec<ThreadId> {
        lock_unpoisoned(&self.list).ids()
    }

    pub fn stats(&self) -> RegistryStats {
        self.ledger.snapshot()
    }

    pub(crate) fn insert(&self, node: NonNull<ThreadNode>) {
        let mut list = lock_unpoisoned(&self.list);
        // SAFETY: freshly allocated nodes are alive and unlinked.
        unsafe { list.push_front(node) };
    }

    /// Unlinks `node`, transferring the registry's claim to the caller.
    /// Returns false if someone else already took it.
    pub(crate) fn retire(&self, node: NonNull<ThreadNode>) -> bool {
        let mut list = lock_unpoisoned(&self.list);
        // SAFETY: callers hold their own claim on `node`.
        unsafe { list.unlink(node) }
    }

    /// Join every thread the registry still tracks, including threads
    /// spawned while this runs. Returns how many were reaped.
    pub fn join_all(&self) -> usize {
        let mut reaped = 0;
        loop {
            let Some(node) = lock_unpoisoned(&self.list).pop_front() else {
                break;
            };
            // The registry lock is not held here: tasks may spawn or drop
            // handles while we wait for them.
            unsafe {
                node.as_ref().reap();
                ThreadNode::release(node);
            }
            reaped += 1;
        }
        if reaped > 0 {
            tracing::debug!(reaped, "registry joined outstanding threads");
        }
        reaped
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.join_all();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ledger: &Arc<Ledger>) -> NonNull<ThreadNode> {
        ThreadNode::alloc(ThreadId::next(), Arc::clone(ledger))
    }

    fn free(node: NonNull<ThreadNode>) {
        unsafe {
            ThreadNode::release(node);
            ThreadNode::release(node);
        }
    }

    #[test]
    fn test_list_insert_at_head_and_unlink_anywhere() {
        let ledger = Arc::new(Ledger::default());
        let mut list = ThreadList::new();
        let (a, b, c) = (node(&ledger), node(&ledger), node(&ledger));
        let id = |n: NonNull<ThreadNode>| unsafe { n.as_ref().id() };

        unsafe {
            list.push_front(a);
            list.push_front(b);
            list.push_front(c);
        }
        assert_eq!(list.ids(), vec![id(c), id(b), id(a)]);

        assert!(unsafe { list.unlink(b) });
        assert!(!unsafe { list.unlink(b) });
        assert_eq!(list.ids(), vec![id(c), id(a)]);

        assert!(unsafe { list.unlink(a) });
        assert_eq!(list.ids(), vec![id(c)]);

        assert_eq!(list.pop_front().map(id), Some(id(c)));
        assert!(list.pop_front().is_none());
        assert_eq!(list.len, 0);

        for n in [a, b, c] {
            free(n);
        }
        assert_eq!(ledger.snapshot().freed, 3);
    }

    #[test]
    fn test_retire_hands_out_the_claim_once() {
        let registry = Registry::new(ThreadConfig::default());
        let n = node(&registry.ledger);
        registry.insert(n);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_threads(), vec![unsafe { n.as_ref().id() }]);

        assert!(registry.retire(n));
        assert!(!registry.retire(n));
        assert!(registry.is_empty());

        free(n);
        assert_eq!(registry.stats().live, 0);
    }

    #[test]
    fn test_ledger_snapshot() {
        let ledger = Ledger::default();
        ledger.node_allocated();
        ledger.node_allocated();
        ledger.anchor();
        ledger.node_freed();
        assert_eq!(
            ledger.snapshot(),
            RegistryStats {
                spawned: 2,
                live: 1,
                freed: 1,
                anchored: 1,
            }
        );
        ledger.unanchor();
        assert_eq!(ledger.snapshot().anchored, 0);
    }
}
