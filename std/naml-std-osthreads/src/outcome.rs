//!
//! Timed Operation Outcomes
//!
//! Lock acquisition and thread join share one result policy: completion is
//! `Ready`, an expired deadline is `TimedOut` (returned as data so naml code
//! can branch on it), and any other platform failure becomes a
//! `ThreadError::Os` carrying the platform's message.
//!

use std::io;

use crate::error::ThreadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    TimedOut,
}

impl WaitStatus {
    pub fn is_ready(self) -> bool {
        self == WaitStatus::Ready
    }

    /// The value naml code receives: 1 for ready, 0 for timed out.
    pub fn as_naml_bool(self) -> i64 {
        match self {
            WaitStatus::Ready => 1,
            WaitStatus::TimedOut => 0,
        }
    }
}

/// Turns a pthread return code into an `io::Result`.
pub(crate) fn os_status(code: libc::c_int) -> io::Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(code))
    }
}

pub fn classify(result: io::Result<()>) -> Result<WaitStatus, ThreadError> {
    match result {
        Ok(()) => Ok(WaitStatus::Ready),
        Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(WaitStatus::TimedOut),
        Err(err) => Err(ThreadError::Os(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(classify(os_status(0)).unwrap(), WaitStatus::Ready);
    }

    #[test]
    fn test_classify_timeout_is_not_an_error() {
        let status = classify(os_status(libc::ETIMEDOUT)).unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
        assert_eq!(status.as_naml_bool(), 0);

        let status = classify(Err(io::ErrorKind::TimedOut.into())).unwrap();
        assert!(!status.is_ready());
    }

    #[test]
    fn test_classify_other_codes_are_fatal() {
        let err = classify(os_status(libc::EDEADLK)).unwrap_err();
        match err {
            ThreadError::Os(io) => assert_eq!(io.raw_os_error(), Some(libc::EDEADLK)),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = classify(os_status(libc::EINVAL)).unwrap_err();
        let expected = io::Error::from_raw_os_error(libc::EINVAL).to_string();
        assert_eq!(err.to_string(), expected);
    }
}
