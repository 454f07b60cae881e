//! What happens to held locks when their holder dies.
//!
//! The child processes below only issue raw lock calls before `_exit`, so
//! they stay clear of allocator and stdio state inherited from the
//! multi-threaded test harness.

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use shm_channel::{Channel, ChannelMode, ShmResult};

type Queue = Channel<u32, 64, 1>;

/// Run `child` in a forked process that terminates without unlocking
/// anything, and return its exit code.
fn in_dying_child<F: FnOnce() -> bool>(child: F) -> i32 {
    // SAFETY: the child only runs `child` and `_exit`.
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let code = if child() { 0 } else { 1 };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid failed") {
            WaitStatus::Exited(_, code) => code,
            status => panic!("child ended unexpectedly: {status:?}"),
        },
    }
}

#[test]
fn test_xsi_lock_released_when_holder_dies() -> ShmResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("xsi_crash").to_string_lossy().into_owned();
    let channel = Queue::xsi(&name, ChannelMode::CREATE)?;
    let lock = channel.lock();
    assert!(lock.is_crash_safe());

    let code = in_dying_child(|| lock.lock().is_ok());
    assert_eq!(code, 0, "child failed to take the lock");

    // The kernel undid the child's semaphore adjustment on exit
    assert!(lock.try_lock()?);
    lock.unlock()?;

    drop(lock);
    channel.remove()
}

// The POSIX area lock lives on each process's heap, so the observable case
// is the same pthread mutex placed in the region: a slot mutex.
#[test]
fn test_posix_slot_mutex_stays_locked_when_holder_dies() -> ShmResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("posix_crash").to_string_lossy().into_owned();
    let channel = Queue::posix(&name, ChannelMode::CREATE)?;
    let region = channel.queue();
    assert!(!channel.lock().is_crash_safe());

    let code = in_dying_child(|| {
        let mutex = match region.mutex(0) {
            Some(mutex) => mutex,
            None => return false,
        };
        match mutex.lock() {
            Ok(guard) => {
                std::mem::forget(guard);
                true
            }
            Err(_) => false,
        }
    });
    assert_eq!(code, 0, "child failed to take the slot mutex");

    // Nobody will ever release it
    assert!(region.mutex(0).unwrap().try_lock()?.is_none());

    // The queue itself is unaffected
    region.try_push(9).unwrap();
    assert_eq!(region.try_pop(), Some(9));

    channel.remove()
}
