//!
//! Thread Spawning
//!
//! `spawn` moves a task and its arguments into an `ExecutionContext` that
//! only the new thread can reach, registers the thread, and starts it on the
//! trampoline. The trampoline contains every failure of the task: an `Err`
//! return or a panic ends that thread only and is reported by `join`.
//!

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::error::ThreadError;
use crate::handle::{lock_unpoisoned, panic_message, Completion, TaskOutcome, ThreadHandle, ThreadId, ThreadNode};
use crate::registry::{Ledger, Registry};

pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A task closure together with the arguments it will be called with.
pub struct ExecutionContext {
    task: Box<dyn FnOnce() -> TaskResult + Send>,
}

impl ExecutionContext {
    pub fn new<F, A>(task: F, args: A) -> Self
    where
        F: FnOnce(A) -> TaskResult + Send + 'static,
        A: Send + 'static,
    {
        ExecutionContext {
            task: Box::new(move || task(args)),
        }
    }

    pub fn from_fn<F>(task: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        ExecutionContext {
            task: Box::new(task),
        }
    }

    fn run(self) -> TaskOutcome {
        let task = self.task;
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
            Err(payload) => TaskOutcome::Failed(panic_message(payload.as_ref())),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// The registry's claim on a running execution context, released by the
/// trampoline once the task has finished.
struct ContextAnchor {
    ledger: Arc<Ledger>,
}

impl ContextAnchor {
    fn claim(ledger: &Arc<Ledger>) -> Self {
        ledger.anchor();
        ContextAnchor {
            ledger: Arc::clone(ledger),
        }
    }
}

impl Drop for ContextAnchor {
    fn drop(&mut self) {
        self.ledger.unanchor();
    }
}

fn trampoline(id: ThreadId, context: ExecutionContext, anchor: ContextAnchor, completion: Arc<Completion>) {
    let outcome = context.run();
    drop(anchor);
    match &outcome {
        TaskOutcome::Completed => tracing::trace!(thread = %id, "thread task completed"),
        TaskOutcome::Failed(message) => tracing::warn!(thread = %id, %message, "thread task failed"),
    }
    completion.publish(outcome);
}

impl Registry {
    /// Start `context` on a new native thread tracked by this registry.
    pub fn spawn(self: &Arc<Self>, context: ExecutionContext) -> Result<ThreadHandle, ThreadError> {
        let id = ThreadId::next();
        let anchor = ContextAnchor::claim(&self.ledger);
        let node = ThreadNode::alloc(id, Arc::clone(&self.ledger));
        // SAFETY: we hold both claims until the handle is built.
        let node_ref = unsafe { node.as_ref() };
        let completion = Arc::clone(&node_ref.completion);

        // Holding the join slot keeps `join_all` from reaping the node before
        // its native handle is stored.
        let mut slot = lock_unpoisoned(&node_ref.join);
        self.insert(node);

        let mut builder = thread::Builder::new().name(self.config().thread_name(id));
        if let Some(size) = self.config().stack_size {
            builder = builder.stack_size(size);
        }

        match builder.spawn(move || trampoline(id, context, anchor, completion)) {
            Ok(native) => {
                slot.native = Some(native);
                drop(slot);
                tracing::debug!(thread = %id, "spawned thread");
                Ok(ThreadHandle::from_parts(node, Arc::clone(self)))
            }
            Err(err) => {
                // The closure, and with it the context and anchor, was
                // dropped by the failed spawn. Publish an outcome so a
                // concurrent `join_all` that already popped the node can
                // finish, then give up both claims.
                node_ref.completion.publish(TaskOutcome::Failed(err.to_string()));
                drop(slot);
                tracing::error!(thread = %id, error = %err, "failed to spawn thread");
                unsafe {
                    if self.retire(node) {
                        ThreadNode::release(node);
                    }
                    ThreadNode::release(node);
                }
                Err(ThreadError::Spawn(err))
            }
        }
    }
}

/// Run `task(args)` on a new thread tracked by the process-wide registry.
pub fn spawn<F, A>(task: F, args: A) -> Result<ThreadHandle, ThreadError>
where
    F: FnOnce(A) -> TaskResult + Send + 'static,
    A: Send + 'static,
{
    Registry::global().spawn(ExecutionContext::new(task, args))
}
