//! POSIX shared memory backend (`shm_open` + `mmap`)

use crate::area::{AreaLock, SharedArea};
use crate::error::{ShmError, ShmResult};
use crate::sync::PshMutex;
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest object name accepted by `shm_open` on Linux
const SHM_NAME_MAX: usize = 255;

/// Permission bits of newly created objects (world read-write, minus umask)
const SHM_MODE: u32 = 0o666;

/// Turn a channel name into a `shm_open` object name.
///
/// The result always starts with `/` and contains no further `/`: any
/// path separators inside the channel name are mapped to `.`, so that
/// filesystem-style names such as `/tmp/queue` stay usable.
pub fn object_name(name: &str) -> ShmResult<String> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if trimmed.contains('\0') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            reason: "name contains a NUL byte",
        });
    }

    let normalized = format!("/{}", trimmed.replace('/', "."));
    if normalized.len() > SHM_NAME_MAX {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            reason: "name longer than 255 bytes",
        });
    }
    Ok(normalized)
}

/// Unlink the named object behind `name` from the POSIX shm namespace
pub fn unlink(name: &str) -> ShmResult<()> {
    let object = object_name(name)?;
    shm_unlink(object.as_str()).map_err(|e| ShmError::RemovalFailure {
        name: object.clone(),
        source: e.into(),
    })?;
    info!("Unlinked POSIX shared memory object {}", object);
    Ok(())
}

/// Area lock backed by a process-shared pthread mutex.
///
/// The mutex lives on this process's heap and is created fresh per area.
/// It is not crash-safe: if a holder dies while locked, the mutex stays
/// locked for good.
pub struct PosixAreaLock {
    mutex: Box<PshMutex>,
}

impl PosixAreaLock {
    /// Create an unlocked mutex
    pub fn new() -> ShmResult<Self> {
        Ok(Self {
            mutex: PshMutex::boxed()?,
        })
    }
}

impl AreaLock for PosixAreaLock {
    fn lock(&self) -> ShmResult<()> {
        self.mutex.lock_raw()
    }

    fn try_lock(&self) -> ShmResult<bool> {
        self.mutex.try_lock_raw()
    }

    fn unlock(&self) -> ShmResult<()> {
        self.mutex.unlock_raw()
    }

    fn is_crash_safe(&self) -> bool {
        false
    }
}

impl Drop for PosixAreaLock {
    fn drop(&mut self) {
        // SAFETY: last reference to the mutex, nobody can lock it any more.
        if let Err(e) = unsafe { self.mutex.destroy() } {
            debug!("Area mutex destroyed while busy: {}", e);
        }
    }
}

/// Memory-mapped named shared memory object
pub struct PosixSharedMemory {
    name: String,
    object: String,
    size: usize,
    file: Option<File>,
    mmap: Option<MmapMut>,
    lock: Arc<PosixAreaLock>,
}

impl PosixSharedMemory {
    /// Prepare an unmapped area; nothing is created until [`SharedArea::attach`]
    pub fn new(name: &str, size: usize) -> ShmResult<Self> {
        Ok(Self {
            name: name.to_string(),
            object: object_name(name)?,
            size,
            file: None,
            mmap: None,
            lock: Arc::new(PosixAreaLock::new()?),
        })
    }

    /// Normalized `shm_open` name of this area
    pub fn object(&self) -> &str {
        &self.object
    }
}

impl SharedArea for PosixSharedMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.size
    }

    fn attach(&mut self) -> ShmResult<NonNull<u8>> {
        if self.file.is_some() || self.mmap.is_some() {
            return Err(ShmError::shm(
                "attach",
                &self.object,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "area is already attached"),
            ));
        }

        let fd = shm_open(
            self.object.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(SHM_MODE),
        )
        .map_err(|e| ShmError::shm("shm_open", &self.object, e))?;
        let file = File::from(fd);

        // Only grow: shrinking would fault other processes' larger mappings
        let current = file
            .metadata()
            .map_err(|e| ShmError::shm("fstat", &self.object, e))?
            .len();
        if current < self.size as u64 {
            file.set_len(self.size as u64)
                .map_err(|e| ShmError::shm("ftruncate", &self.object, e))?;
        }

        // SAFETY: the object is shared on purpose; all concurrent access to
        // the mapped bytes goes through atomics and pthread primitives.
        let mut mmap = unsafe { MmapOptions::new().len(self.size).map_mut(&file) }
            .map_err(|e| ShmError::shm("mmap", &self.object, e))?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            ShmError::shm(
                "mmap",
                &self.object,
                std::io::Error::other("mapping returned a null address"),
            )
        })?;

        self.file = Some(file);
        self.mmap = Some(mmap);
        debug!(
            "Attached POSIX area {} ({} bytes) at {:p}",
            self.object,
            self.size,
            base.as_ptr()
        );
        Ok(base)
    }

    fn address(&self) -> Option<NonNull<u8>> {
        self.mmap
            .as_ref()
            .and_then(|mmap| NonNull::new(mmap.as_ptr().cast_mut()))
    }

    fn detach(&mut self) -> ShmResult<()> {
        if let Some(mmap) = self.mmap.take() {
            drop(mmap);
            debug!("Unmapped POSIX area {}", self.object);
        }
        if let Some(file) = self.file.take() {
            drop(file);
        }
        Ok(())
    }

    fn lock(&self) -> Arc<dyn AreaLock> {
        self.lock.clone()
    }

    fn remove(&self) -> ShmResult<()> {
        unlink(&self.name)
    }
}

impl Drop for PosixSharedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("Failed to detach POSIX area {}: {}", self.object, e);
        }
    }
}
