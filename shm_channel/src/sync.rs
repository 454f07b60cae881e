//! Process-shared pthread mutex and condition variable
//!
//! Both primitives are configured with `PTHREAD_PROCESS_SHARED` and are only
//! meaningful when they live in memory every participant maps (the composite
//! region) or, for the POSIX area lock, in a heap object the owning process
//! keeps alive. Neither primitive is robust: a process that dies while
//! holding a [`PshMutex`] leaves it locked.

use crate::area::CondVar;
use crate::error::{ShmError, ShmResult};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// Mutex valid across process boundaries
#[repr(transparent)]
pub struct PshMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed to be shared between threads; the
// process-shared attribute additionally allows sharing between processes.
unsafe impl Send for PshMutex {}
unsafe impl Sync for PshMutex {}

impl PshMutex {
    /// Initialize a mutex in place with the process-shared attribute.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes, suitably aligned, and must not be in
    /// use by any thread or process while it is (re)initialized.
    pub unsafe fn init_in_place(this: *mut Self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        // SAFETY: attr is a valid out-pointer for the init call.
        let ret = unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_mutexattr_init", ret));
        }

        // SAFETY: attr was initialized above and is destroyed on every path.
        let result = unsafe {
            let ret =
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                Err(ShmError::sync_code("pthread_mutexattr_setpshared", ret))
            } else {
                let ret = libc::pthread_mutex_init(this.cast(), attr.as_ptr());
                if ret != 0 {
                    Err(ShmError::sync_code("pthread_mutex_init", ret))
                } else {
                    Ok(())
                }
            }
        };

        unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
        result
    }

    /// Allocate and initialize a process-shared mutex on the heap.
    pub fn boxed() -> ShmResult<Box<Self>> {
        let mut slot = Box::<Self>::new_uninit();
        // SAFETY: fresh allocation, nobody else can observe it.
        unsafe {
            Self::init_in_place(slot.as_mut_ptr())?;
            Ok(slot.assume_init())
        }
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) -> ShmResult<PshMutexGuard<'_>> {
        self.lock_raw()?;
        Ok(PshMutexGuard { mutex: self })
    }

    /// Acquire the mutex if it is free, `None` when another holder has it
    pub fn try_lock(&self) -> ShmResult<Option<PshMutexGuard<'_>>> {
        if self.try_lock_raw()? {
            Ok(Some(PshMutexGuard { mutex: self }))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn lock_raw(&self) -> ShmResult<()> {
        // SAFETY: raw points to an initialized pthread mutex.
        let ret = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_mutex_lock", ret));
        }
        Ok(())
    }

    pub(crate) fn try_lock_raw(&self) -> ShmResult<bool> {
        let ret = unsafe { libc::pthread_mutex_trylock(self.raw.get()) };
        match ret {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            code => Err(ShmError::sync_code("pthread_mutex_trylock", code)),
        }
    }

    pub(crate) fn unlock_raw(&self) -> ShmResult<()> {
        let ret = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_mutex_unlock", ret));
        }
        Ok(())
    }

    /// Destroy the underlying pthread mutex.
    ///
    /// # Safety
    ///
    /// The mutex must be unlocked and no longer used by anyone afterwards.
    pub(crate) unsafe fn destroy(&self) -> ShmResult<()> {
        let ret = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_mutex_destroy", ret));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }
}

/// Scoped ownership of a [`PshMutex`]; unlocks on drop
pub struct PshMutexGuard<'a> {
    mutex: &'a PshMutex,
}

impl PshMutexGuard<'_> {
    /// Mutex this guard holds
    pub fn mutex(&self) -> &PshMutex {
        self.mutex
    }
}

impl Drop for PshMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock_raw() {
            tracing::warn!("Failed to release process-shared mutex: {}", e);
        }
    }
}

/// Condition variable valid across process boundaries
#[repr(transparent)]
pub struct PshCondVar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for PshCondVar {}
unsafe impl Sync for PshCondVar {}

impl PshCondVar {
    /// Initialize a condition variable in place with the process-shared attribute.
    ///
    /// # Safety
    ///
    /// Same contract as [`PshMutex::init_in_place`].
    pub unsafe fn init_in_place(this: *mut Self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();

        let ret = unsafe { libc::pthread_condattr_init(attr.as_mut_ptr()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_condattr_init", ret));
        }

        let result = unsafe {
            let ret =
                libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if ret != 0 {
                Err(ShmError::sync_code("pthread_condattr_setpshared", ret))
            } else {
                let ret = libc::pthread_cond_init(this.cast(), attr.as_ptr());
                if ret != 0 {
                    Err(ShmError::sync_code("pthread_cond_init", ret))
                } else {
                    Ok(())
                }
            }
        };

        unsafe { libc::pthread_condattr_destroy(attr.as_mut_ptr()) };
        result
    }

    /// Block until `condition` returns false, re-checking after each wakeup
    pub fn wait_while<F>(&self, guard: &mut PshMutexGuard<'_>, mut condition: F) -> ShmResult<()>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(guard)?;
        }
        Ok(())
    }
}

impl CondVar for PshCondVar {
    fn wait(&self, guard: &mut PshMutexGuard<'_>) -> ShmResult<()> {
        // SAFETY: the guard proves the calling thread holds the mutex.
        let ret = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_cond_wait", ret));
        }
        Ok(())
    }

    fn notify_one(&self) -> ShmResult<()> {
        let ret = unsafe { libc::pthread_cond_signal(self.raw.get()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_cond_signal", ret));
        }
        Ok(())
    }

    fn notify_all(&self) -> ShmResult<()> {
        let ret = unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
        if ret != 0 {
            return Err(ShmError::sync_code("pthread_cond_broadcast", ret));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    struct Pair {
        mutex: Box<PshMutex>,
        cond: Box<PshCondVar>,
        flag: AtomicBool,
    }

    fn boxed_condvar() -> Box<PshCondVar> {
        let mut slot = Box::<PshCondVar>::new_uninit();
        unsafe {
            PshCondVar::init_in_place(slot.as_mut_ptr()).unwrap();
            slot.assume_init()
        }
    }

    #[test]
    fn test_try_lock_reports_busy() {
        let mutex = PshMutex::boxed().unwrap();
        let guard = mutex.lock().unwrap();

        let contender = thread::scope(|s| {
            s.spawn(|| mutex.try_lock().unwrap().is_none())
                .join()
                .unwrap()
        });
        assert!(contender);

        drop(guard);
        assert!(mutex.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_wait_notify_between_threads() {
        let pair = Arc::new(Pair {
            mutex: PshMutex::boxed().unwrap(),
            cond: boxed_condvar(),
            flag: AtomicBool::new(false),
        });

        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let mut guard = pair.mutex.lock().unwrap();
                pair.cond
                    .wait_while(&mut guard, || !pair.flag.load(Ordering::Acquire))
                    .unwrap();
            })
        };

        {
            let _guard = pair.mutex.lock().unwrap();
            pair.flag.store(true, Ordering::Release);
            pair.cond.notify_all().unwrap();
        }

        waiter.join().unwrap();
    }
}
