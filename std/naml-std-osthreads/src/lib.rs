//!
//! naml-std-osthreads - Native OS Threads and Locks
//!
//! One naml thread is one OS thread. Threads run truly in parallel with the
//! spawner and with each other; the only ordering between them is what locks
//! provide.
//!
//! ## Threads
//!
//! - `threads.new(fn, args...) -> thread` - Run a closure on a new OS thread
//! - `thread.join() -> bool` - Wait for the thread to finish
//! - `thread.join(timeout) -> bool` - Wait at most `timeout` seconds; false on timeout
//! - `threads.sleep(seconds)` - Suspend the calling thread
//!
//! A thread handle that becomes unreachable is disposed without waiting.
//! Every thread is also tracked by a process-wide registry that joins the
//! outstanding ones at shutdown, so a dropped handle never leaks its thread.
//!
//! ## Locks
//!
//! - `threads.new_lock(reentrant: bool) -> lock`
//! - `lock.acquire() -> bool` / `lock.acquire(timeout) -> bool`
//! - `lock.release()`
//!
//! Timeouts are given in seconds, as an `int` or a `float`. An expired
//! timeout is a normal `false` result; platform failures throw `ThreadError`.
//!
//! ## Platform Support
//!
//! Native unix targets only.
//!

pub mod config;
pub mod deadline;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod lock;
pub mod outcome;
pub mod registry;
pub mod spawn;

pub use config::ThreadConfig;
pub use deadline::{sleep, Deadline, Seconds};
pub use error::ThreadError;
pub use ffi::*;
pub use handle::{ThreadHandle, ThreadId};
pub use lock::{Lock, LockKind};
pub use outcome::{classify, WaitStatus};
pub use registry::{Registry, RegistryStats};
pub use spawn::{spawn, ExecutionContext, TaskResult};
