//! Error types for shared memory channel operations

use crate::config::ConfigError;
use thiserror::Error;

/// Errors that can occur while creating, attaching or tearing down a channel
#[derive(Error, Debug)]
pub enum ShmError {
    /// Exclusive attach requested but the sentinel markers are missing
    #[error("Channel not found: {name} (sentinel markers missing)")]
    ChannelNotFound {
        /// Channel name
        name: String,
    },

    /// An OS-level create/attach/map/detach call failed
    #[error("Shared memory operation `{op}` failed for {name}: {source}")]
    SharedMemoryFailure {
        /// Failing operation (`shm_open`, `mmap`, `shmget`, ...)
        op: &'static str,
        /// Area name the operation was applied to
        name: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// A mutex, condition variable or semaphore call failed
    #[error("Synchronization primitive `{op}` failed: {source}")]
    SynchronizationFailure {
        /// Failing operation (`pthread_mutex_init`, `semop`, ...)
        op: &'static str,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Explicit removal of a shared object failed
    #[error("Failed to remove shared memory object {name}: {source}")]
    RemovalFailure {
        /// Object name
        name: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Channel name cannot be turned into an OS object name
    #[error("Invalid channel name `{name}`: {reason}")]
    InvalidName {
        /// Offending name
        name: String,
        /// Why the name was rejected
        reason: &'static str,
    },

    /// Attached region carries no published header
    #[error("Shared region {name} is not initialized - start the creator first")]
    NotInitialized {
        /// Channel name
        name: String,
    },

    /// Attached region was laid out for a different element type or capacity
    #[error("Shared region {name} layout mismatch: expected {expected} bytes, found {found}")]
    LayoutMismatch {
        /// Channel name
        name: String,
        /// Layout size of this process
        expected: u64,
        /// Layout size recorded by the creator
        found: u64,
    },

    /// IO error on sentinel marker files
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },
}

impl ShmError {
    pub(crate) fn shm(op: &'static str, name: &str, source: impl Into<std::io::Error>) -> Self {
        Self::SharedMemoryFailure {
            op,
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn last_shm(op: &'static str, name: &str) -> Self {
        Self::shm(op, name, std::io::Error::last_os_error())
    }

    /// Build a synchronization error from a pthread-style return code
    pub(crate) fn sync_code(op: &'static str, code: libc::c_int) -> Self {
        Self::SynchronizationFailure {
            op,
            source: std::io::Error::from_raw_os_error(code),
        }
    }

    pub(crate) fn last_sync(op: &'static str) -> Self {
        Self::SynchronizationFailure {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result type for shared memory channel operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_failure_carries_op_and_os_text() {
        let err = ShmError::shm(
            "shm_open",
            "/queue",
            std::io::Error::from_raw_os_error(libc::EACCES),
        );
        let text = err.to_string();
        assert!(text.contains("shm_open"));
        assert!(text.contains("/queue"));
        assert!(text.to_lowercase().contains("permission denied"));
    }

    #[test]
    fn test_sync_code_maps_errno() {
        let err = ShmError::sync_code("pthread_mutex_lock", libc::EDEADLK);
        match err {
            ShmError::SynchronizationFailure { op, source } => {
                assert_eq!(op, "pthread_mutex_lock");
                assert_eq!(source.raw_os_error(), Some(libc::EDEADLK));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
