//!
//! Thread Configuration
//!
//! Settings applied to every native thread a registry spawns. The
//! process-wide registry reads them from the environment:
//!
//! - `NAML_THREAD_NAME_PREFIX` - prefix of native thread names (`naml-thread`)
//! - `NAML_THREAD_STACK_SIZE` - stack size in bytes (platform default)
//!

use crate::error::ThreadError;
use crate::handle::ThreadId;

pub const DEFAULT_NAME_PREFIX: &str = "naml-thread";

const NAME_PREFIX_VAR: &str = "NAML_THREAD_NAME_PREFIX";
const STACK_SIZE_VAR: &str = "NAML_THREAD_STACK_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadConfig {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        ThreadConfig {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }
}

impl ThreadConfig {
    pub fn from_env() -> Result<Self, ThreadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ThreadError> {
        let mut config = ThreadConfig::default();

        if let Some(prefix) = lookup(NAME_PREFIX_VAR) {
            if prefix.contains('\0') {
                return Err(ThreadError::InvalidConfig {
                    key: NAME_PREFIX_VAR,
                    reason: "contains a NUL byte".to_string(),
                });
            }
            if !prefix.is_empty() {
                config.name_prefix = prefix;
            }
        }

        if let Some(raw) = lookup(STACK_SIZE_VAR) {
            let size: usize = raw.trim().parse().map_err(|err: std::num::ParseIntError| {
                ThreadError::InvalidConfig {
                    key: STACK_SIZE_VAR,
                    reason: err.to_string(),
                }
            })?;
            if size == 0 {
                return Err(ThreadError::InvalidConfig {
                    key: STACK_SIZE_VAR,
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.stack_size = Some(size);
        }

        Ok(config)
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub(crate) fn thread_name(&self, id: ThreadId) -> String {
        // std panics on interior NULs in thread names.
        format!("{}-{}", self.name_prefix.replace('\0', ""), id)
    }
}
