//! # Shared Memory Channel
//!
//! Cross-process communication over operating-system shared memory. Two
//! independent processes map the same region and exchange fixed-size
//! elements through a bounded MPMC queue embedded in it, optionally blocking
//! on process-shared mutex/condition variable slots instead of polling.
//!
//! ## Backends
//!
//! | Backend          | Region                      | Area lock               | Lock survives holder crash |
//! |------------------|-----------------------------|-------------------------|----------------------------|
//! | [`Backend::Posix`] | `shm_open` + `mmap`         | process-shared pthread mutex | no (stays locked)     |
//! | [`Backend::Xsi`]   | `ftok` + `shmget` + `shmat` | semaphore with `SEM_UNDO`    | yes (kernel releases) |
//!
//! Callers that need crash recovery check [`AreaLock::is_crash_safe`].
//!
//! ## Region layout
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────────┬──────────────────────┐
//! │ RegionHeader │ N × PshMutex  │ N × PshCondVar │ BoundedQueue<T, CAP> │
//! └──────────────┴───────────────┴────────────────┴──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shm_channel::{Channel, ChannelMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Producer process
//! let producer = Channel::<u32, 1024, 1>::posix("/tmp/shared_queue_file", ChannelMode::CREATE)?;
//! for value in (1..=5).rev() {
//!     producer.queue().try_push(value).ok();
//! }
//!
//! // Consumer process
//! let consumer =
//!     Channel::<u32, 1024, 1>::posix("/tmp/shared_queue_file", ChannelMode::ATTACH_EXCLUSIVE)?;
//! while let Some(value) = consumer.queue().try_pop() {
//!     println!("{value}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! Dropping a [`Channel`] only unmaps the region. The OS object and the
//! sentinel marker files outlive every process until removed explicitly with
//! [`Channel::remove`] or [`remove_channel`].
//!
//! ## Known limitation
//!
//! Two processes opening the same name with [`ChannelMode::CREATE`] at the
//! same time may both initialize the region. Handles detect this afterwards
//! through [`Channel::is_current`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod area;
pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod platform;
pub mod queue;
pub mod region;
pub mod sentinel;
pub mod sync;

pub use area::{Area, AreaLock, AreaLockGuard, Backend, CondVar, SharedArea};
pub use channel::{Channel, ChannelMode};
pub use config::{ChannelConfig, ConfigError, ConfigLoader, LogLevel};
pub use error::{ShmError, ShmResult};
pub use lifecycle::remove_channel;
pub use platform::{PosixAreaLock, PosixSharedMemory, XsiAreaLock, XsiSharedMemory};
pub use queue::{BoundedQueue, ShmElement};
pub use region::{RegionHeader, ShmQueue};
pub use sentinel::Sentinels;
pub use sync::{PshCondVar, PshMutex, PshMutexGuard};

/// Install the global `tracing` subscriber at `level`, with `RUST_LOG`
/// directives applied on top; `json` switches to JSON lines.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case the existing one stays in place.
pub fn init_tracing(level: LogLevel, json: bool) -> bool {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::from_default_env().add_directive(level.as_tracing_level().into());
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_keeps_first_subscriber() {
        init_tracing(LogLevel::Debug, false);
        assert!(!init_tracing(LogLevel::Info, true));
        tracing::debug!("subscriber already installed");
    }
}
