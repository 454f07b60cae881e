//! Capability interfaces shared by both backends
//!
//! [`SharedArea`] is the contract a backend fulfils for one named region,
//! [`AreaLock`] the contract of the area-level mutex handed out by
//! [`SharedArea::lock`], and [`CondVar`] the contract of the per-slot
//! condition variables living inside the region.
//!
//! The backends differ in what happens to a held area lock when its holder
//! dies; [`AreaLock::is_crash_safe`] reports which behaviour applies.

use crate::error::ShmResult;
use crate::platform::{PosixSharedMemory, XsiSharedMemory};
use crate::sync::PshMutexGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::Arc;

/// One OS-backed shared memory region and this process's mapping of it
pub trait SharedArea {
    /// Channel name the area was built from
    fn name(&self) -> &str;

    /// Exact mapping size in bytes
    fn size(&self) -> usize;

    /// Create-or-open the region and map it, returning the base address.
    ///
    /// Only one mapping per instance; attaching twice without a detach in
    /// between fails.
    fn attach(&mut self) -> ShmResult<NonNull<u8>>;

    /// Base address of the live mapping, if any
    fn address(&self) -> Option<NonNull<u8>>;

    /// Release this process's mapping. Idempotent; a no-op when unmapped.
    fn detach(&mut self) -> ShmResult<()>;

    /// Area-level lock. Whether the handle is process-local or backed by a
    /// kernel object differs between backends.
    fn lock(&self) -> Arc<dyn AreaLock>;

    /// Destroy the OS object behind the area. Live mappings in other
    /// processes keep working until they detach.
    fn remove(&self) -> ShmResult<()>;
}

/// Coarse-grained mutual exclusion tied to one area
pub trait AreaLock: Send + Sync {
    /// Block until the lock is acquired
    fn lock(&self) -> ShmResult<()>;

    /// Acquire the lock if it is free; `false` when someone else holds it
    fn try_lock(&self) -> ShmResult<bool>;

    /// Release a lock the calling thread acquired through this handle
    fn unlock(&self) -> ShmResult<()>;

    /// `true` when the OS releases the lock if its holder terminates
    /// without unlocking.
    fn is_crash_safe(&self) -> bool;
}

impl dyn AreaLock {
    /// Acquire the lock and release it when the guard goes out of scope
    pub fn guard(&self) -> ShmResult<AreaLockGuard<'_>> {
        self.lock()?;
        Ok(AreaLockGuard { lock: self })
    }
}

/// Scoped ownership of an [`AreaLock`]
pub struct AreaLockGuard<'a> {
    lock: &'a dyn AreaLock,
}

impl Drop for AreaLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!("Failed to release area lock: {}", e);
        }
    }
}

/// Condition variable whose waiters may live in different processes
pub trait CondVar {
    /// Atomically release the guarded mutex and block until notified
    fn wait(&self, guard: &mut PshMutexGuard<'_>) -> ShmResult<()>;

    /// Wake one waiter
    fn notify_one(&self) -> ShmResult<()>;

    /// Wake every waiter
    fn notify_all(&self) -> ShmResult<()>;
}

/// OS shared memory family a channel is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `shm_open` + `mmap`, pthread area lock (not crash-safe)
    #[default]
    Posix,
    /// `shmget` + `shmat`, System V semaphore area lock (crash-safe)
    Xsi,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Posix => f.write_str("posix"),
            Backend::Xsi => f.write_str("xsi"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "mmap" => Ok(Backend::Posix),
            "xsi" | "sysv" => Ok(Backend::Xsi),
            other => Err(format!("unknown backend `{other}` (expected posix or xsi)")),
        }
    }
}

/// Closed set of backend areas behind the [`SharedArea`] interface
pub enum Area {
    /// Memory-mapped named object
    Posix(PosixSharedMemory),
    /// Kernel IPC segment
    Xsi(XsiSharedMemory),
}

impl Area {
    /// Build an unmapped area of `size` bytes for `name` on `backend`
    pub fn new(backend: Backend, name: &str, size: usize) -> ShmResult<Self> {
        match backend {
            Backend::Posix => Ok(Area::Posix(PosixSharedMemory::new(name, size)?)),
            Backend::Xsi => Ok(Area::Xsi(XsiSharedMemory::new(name, size)?)),
        }
    }

    /// Backend this area belongs to
    pub fn backend(&self) -> Backend {
        match self {
            Area::Posix(_) => Backend::Posix,
            Area::Xsi(_) => Backend::Xsi,
        }
    }

    fn inner(&self) -> &dyn SharedArea {
        match self {
            Area::Posix(area) => area,
            Area::Xsi(area) => area,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SharedArea {
        match self {
            Area::Posix(area) => area,
            Area::Xsi(area) => area,
        }
    }
}

impl SharedArea for Area {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn size(&self) -> usize {
        self.inner().size()
    }

    fn attach(&mut self) -> ShmResult<NonNull<u8>> {
        self.inner_mut().attach()
    }

    fn address(&self) -> Option<NonNull<u8>> {
        self.inner().address()
    }

    fn detach(&mut self) -> ShmResult<()> {
        self.inner_mut().detach()
    }

    fn lock(&self) -> Arc<dyn AreaLock> {
        self.inner().lock()
    }

    fn remove(&self) -> ShmResult<()> {
        self.inner().remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("posix".parse::<Backend>(), Ok(Backend::Posix));
        assert_eq!("XSI".parse::<Backend>(), Ok(Backend::Xsi));
        assert_eq!("sysv".parse::<Backend>(), Ok(Backend::Xsi));
        assert!("shmem".parse::<Backend>().is_err());
    }

    #[test]
    fn test_backend_display_roundtrips() {
        for backend in [Backend::Posix, Backend::Xsi] {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
    }

    #[test]
    fn test_default_backend_is_posix() {
        assert_eq!(Backend::default(), Backend::Posix);
    }
}
