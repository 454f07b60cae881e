//! System V IPC backend (`shmget` + `shmat`, semaphore area lock)
//!
//! Keys are derived with `ftok` from the channel's sentinel marker files,
//! so those files must exist before an area or lock is built.

use crate::area::{AreaLock, SharedArea};
use crate::error::{ShmError, ShmResult};
use crate::sentinel::MUTEX_SUFFIX;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// `ftok` discriminant of the shared memory segment
pub const SHM_PROJ_ID: u8 = b'S';

/// `ftok` discriminant of the area semaphore
pub const SEM_PROJ_ID: u8 = b'M';

/// Permission bits of newly created objects
const IPC_MODE: libc::c_int = 0o666;

/// Derive a System V key from an existing path and a discriminant byte
pub fn derive_key(path: &str, proj_id: u8) -> ShmResult<libc::key_t> {
    let c_path = CString::new(path).map_err(|_| ShmError::InvalidName {
        name: path.to_string(),
        reason: "name contains a NUL byte",
    })?;

    // SAFETY: c_path is a valid NUL-terminated string.
    let key = unsafe { libc::ftok(c_path.as_ptr(), proj_id as libc::c_int) };
    if key == -1 {
        return Err(ShmError::last_shm("ftok", path));
    }
    Ok(key)
}

/// Mark the segment and semaphore of channel `name` for destruction.
///
/// Objects that do not exist are skipped; the call fails only if an
/// existing object cannot be removed or its key cannot be derived.
pub fn remove_objects(name: &str) -> ShmResult<()> {
    let removal = |source: io::Error| ShmError::RemovalFailure {
        name: name.to_string(),
        source,
    };

    let shm_key = derive_key(name, SHM_PROJ_ID)?;
    let shmid = unsafe { libc::shmget(shm_key, 0, 0) };
    if shmid != -1 {
        if unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            return Err(removal(io::Error::last_os_error()));
        }
        info!("Removed System V segment {} (id {})", name, shmid);
    }

    let lock_path = format!("{name}{MUTEX_SUFFIX}");
    let sem_key = derive_key(&lock_path, SEM_PROJ_ID)?;
    let semid = unsafe { libc::semget(sem_key, 1, 0) };
    if semid != -1 {
        if unsafe { libc::semctl(semid, 0, libc::IPC_RMID) } == -1 {
            return Err(removal(io::Error::last_os_error()));
        }
        info!("Removed System V semaphore {} (id {})", lock_path, semid);
    }
    Ok(())
}

/// Area lock backed by a binary System V semaphore.
///
/// Lock and unlock carry `SEM_UNDO`, so the kernel hands the lock back if
/// the holding process terminates without releasing it. The semaphore
/// outlives every process; only [`remove_objects`] destroys it.
///
/// The handle is shared by every user of the area in this process and
/// records the thread that acquired the lock: only that thread may unlock
/// it, so one thread cannot release a lock another thread is working under.
pub struct XsiAreaLock {
    path: String,
    semid: libc::c_int,
    owner: Mutex<Option<ThreadId>>,
}

impl XsiAreaLock {
    /// Open the semaphore keyed from `path`, creating and unlocking it if it
    /// does not exist yet.
    ///
    /// Only the process that actually creates the semaphore sets its value;
    /// later openers never reset a lock somebody else may hold.
    pub fn open(path: &str) -> ShmResult<Self> {
        let key = derive_key(path, SEM_PROJ_ID)?;

        let semid = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | IPC_MODE) };
        let semid = if semid != -1 {
            if unsafe { libc::semctl(semid, 0, libc::SETVAL, 1 as libc::c_int) } == -1 {
                return Err(ShmError::last_sync("semctl(SETVAL)"));
            }
            debug!("Created System V semaphore for {} (id {})", path, semid);
            semid
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(ShmError::SynchronizationFailure {
                    op: "semget",
                    source: err,
                });
            }
            let semid = unsafe { libc::semget(key, 1, IPC_MODE) };
            if semid == -1 {
                return Err(ShmError::last_sync("semget"));
            }
            semid
        };

        Ok(Self {
            path: path.to_string(),
            semid,
            owner: Mutex::new(None),
        })
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        // The guarded value is a plain id; a panicking holder cannot leave it
        // half-written.
        self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn semop(&self, delta: libc::c_short, flags: libc::c_int) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: (flags | libc::SEM_UNDO) as libc::c_short,
        };
        loop {
            // SAFETY: op is a single valid sembuf.
            if unsafe { libc::semop(self.semid, &mut op, 1) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl AreaLock for XsiAreaLock {
    fn lock(&self) -> ShmResult<()> {
        self.semop(-1, 0)
            .map_err(|source| ShmError::SynchronizationFailure {
                op: "semop(lock)",
                source,
            })?;
        *self.owner() = Some(thread::current().id());
        Ok(())
    }

    fn try_lock(&self) -> ShmResult<bool> {
        match self.semop(-1, libc::IPC_NOWAIT) {
            Ok(()) => {
                *self.owner() = Some(thread::current().id());
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            Err(source) => Err(ShmError::SynchronizationFailure {
                op: "semop(try_lock)",
                source,
            }),
        }
    }

    fn unlock(&self) -> ShmResult<()> {
        let mut owner = self.owner();
        if *owner != Some(thread::current().id()) {
            return Err(ShmError::SynchronizationFailure {
                op: "semop(unlock)",
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "lock is not held by the calling thread",
                ),
            });
        }
        *owner = None;
        self.semop(1, 0)
            .map_err(|source| ShmError::SynchronizationFailure {
                op: "semop(unlock)",
                source,
            })
    }

    fn is_crash_safe(&self) -> bool {
        true
    }
}

impl Drop for XsiAreaLock {
    fn drop(&mut self) {
        let owner = self.owner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if owner.take().is_some() {
            if let Err(e) = self.semop(1, libc::IPC_NOWAIT) {
                warn!("Failed to release semaphore for {}: {}", self.path, e);
            }
        }
    }
}

/// Kernel IPC shared memory segment
pub struct XsiSharedMemory {
    name: String,
    size: usize,
    shmid: Option<libc::c_int>,
    addr: Option<NonNull<u8>>,
    lock: Arc<XsiAreaLock>,
}

// SAFETY: the attached address refers to process-wide shared memory, not to
// thread-local data; mutation of the handle itself requires `&mut self`.
unsafe impl Send for XsiSharedMemory {}
unsafe impl Sync for XsiSharedMemory {}

impl XsiSharedMemory {
    /// Prepare an unattached area and open its semaphore.
    ///
    /// Both sentinel files (`<name>` and `<name>_mutex`) must exist.
    pub fn new(name: &str, size: usize) -> ShmResult<Self> {
        let lock = XsiAreaLock::open(&format!("{name}{MUTEX_SUFFIX}"))?;
        Ok(Self {
            name: name.to_string(),
            size,
            shmid: None,
            addr: None,
            lock: Arc::new(lock),
        })
    }

    /// Kernel identifier of the segment once attached
    pub fn shmid(&self) -> Option<libc::c_int> {
        self.shmid
    }
}

impl SharedArea for XsiSharedMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.size
    }

    fn attach(&mut self) -> ShmResult<NonNull<u8>> {
        if self.addr.is_some() {
            return Err(ShmError::shm(
                "attach",
                &self.name,
                io::Error::new(io::ErrorKind::AlreadyExists, "area is already attached"),
            ));
        }

        let key = derive_key(&self.name, SHM_PROJ_ID)?;
        let shmid = unsafe { libc::shmget(key, self.size, libc::IPC_CREAT | IPC_MODE) };
        if shmid == -1 {
            return Err(ShmError::last_shm("shmget", &self.name));
        }

        let raw = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if raw as isize == -1 {
            return Err(ShmError::last_shm("shmat", &self.name));
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or_else(|| {
            ShmError::shm("shmat", &self.name, io::Error::other("null attach address"))
        })?;

        self.shmid = Some(shmid);
        self.addr = Some(base);
        debug!(
            "Attached System V area {} (id {}, {} bytes) at {:p}",
            self.name,
            shmid,
            self.size,
            base.as_ptr()
        );
        Ok(base)
    }

    fn address(&self) -> Option<NonNull<u8>> {
        self.addr
    }

    fn detach(&mut self) -> ShmResult<()> {
        if let Some(addr) = self.addr {
            if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
                return Err(ShmError::last_shm("shmdt", &self.name));
            }
            self.addr = None;
            debug!("Detached System V area {}", self.name);
        }
        Ok(())
    }

    fn lock(&self) -> Arc<dyn AreaLock> {
        self.lock.clone()
    }

    fn remove(&self) -> ShmResult<()> {
        remove_objects(&self.name)
    }
}

impl Drop for XsiSharedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("Failed to detach System V area {}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::Sentinels;
    use tempfile::TempDir;

    fn sentinel_channel() -> (TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("xsi_area").to_string_lossy().into_owned();
        Sentinels::for_channel(&name).create().unwrap();
        (dir, name)
    }

    #[test]
    fn test_key_requires_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent").to_string_lossy().into_owned();
        assert!(matches!(
            derive_key(&missing, SHM_PROJ_ID),
            Err(ShmError::SharedMemoryFailure { op: "ftok", .. })
        ));
    }

    #[test]
    fn test_discriminants_yield_distinct_keys() {
        let (_dir, name) = sentinel_channel();
        assert_ne!(
            derive_key(&name, SHM_PROJ_ID).unwrap(),
            derive_key(&name, SEM_PROJ_ID).unwrap()
        );
    }

    #[test]
    fn test_attach_shares_bytes_between_mappings() {
        let (_dir, name) = sentinel_channel();
        let mut first = XsiSharedMemory::new(&name, 4096).unwrap();
        let mut second = XsiSharedMemory::new(&name, 4096).unwrap();

        let a = first.attach().unwrap();
        let b = second.attach().unwrap();
        unsafe { a.as_ptr().add(17).write(0xC3) };
        assert_eq!(unsafe { b.as_ptr().add(17).read() }, 0xC3);
        assert_eq!(first.shmid(), second.shmid());

        first.detach().unwrap();
        first.detach().unwrap();
        second.detach().unwrap();
        first.remove().unwrap();
    }

    #[test]
    fn test_semaphore_lock_semantics() {
        let (_dir, name) = sentinel_channel();
        let area = XsiSharedMemory::new(&name, 4096).unwrap();
        let lock = area.lock();
        assert!(lock.is_crash_safe());

        lock.lock().unwrap();
        assert!(!lock.try_lock().unwrap());
        lock.unlock().unwrap();

        // Unlocking without holding must not inflate the semaphore
        assert!(lock.unlock().is_err());
        assert!(lock.try_lock().unwrap());
        assert!(!lock.try_lock().unwrap());
        lock.unlock().unwrap();

        area.remove().unwrap();
    }

    #[test]
    fn test_reopen_does_not_reset_held_lock() {
        let (_dir, name) = sentinel_channel();
        let area = XsiSharedMemory::new(&name, 4096).unwrap();
        let lock = area.lock();
        lock.lock().unwrap();

        let reopened = XsiSharedMemory::new(&name, 4096).unwrap();
        assert!(!reopened.lock().try_lock().unwrap());

        lock.unlock().unwrap();
        area.remove().unwrap();
    }

    #[test]
    fn test_only_the_acquiring_thread_unlocks() {
        let (_dir, name) = sentinel_channel();
        let area = XsiSharedMemory::new(&name, 4096).unwrap();
        let lock = area.lock();
        lock.lock().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(matches!(
                    lock.unlock(),
                    Err(ShmError::SynchronizationFailure { op: "semop(unlock)", .. })
                ));
                assert!(!lock.try_lock().unwrap());
            });
        });

        // Still held by this thread, and still releasable by it
        assert!(!lock.try_lock().unwrap());
        lock.unlock().unwrap();
        assert!(lock.try_lock().unwrap());
        lock.unlock().unwrap();

        area.remove().unwrap();
    }
}
