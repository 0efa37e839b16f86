///
/// Thread and lock error types.
///
/// Timeouts are not errors: timed waits report them as
/// `WaitStatus::TimedOut`. Everything here is surfaced to naml code as a
/// `ThreadError` exception.
///

use std::io;
use thiserror::Error;

use crate::handle::ThreadId;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("{0}")]
    Os(#[from] io::Error),

    #[error("Failed to spawn thread: {0}")]
    Spawn(io::Error),

    #[error("Thread {thread} has already been joined")]
    AlreadyJoined { thread: ThreadId },

    #[error("Thread {thread} failed: {message}")]
    TaskFailed { thread: ThreadId, message: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },
}
