//! Futex-backed cross-process counting semaphore.
//!
//! `std::sync::Mutex` is process-local, so the lock protecting allocator
//! metadata lives inside the region itself: an `AtomicU32` driven by futex
//! wait/wake *without* the PRIVATE flag, which makes the kernel match
//! waiters across every process that mapped the word.

use crate::error::{Error, Result};
use rustix::io::Errno;
use rustix::thread::futex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Counting semaphore embedded in shared memory.
#[repr(C)]
pub(crate) struct Semaphore {
    value: AtomicU32,
}

impl Semaphore {
    /// In-place initialization; done once by the master before any other
    /// process can attach.
    pub fn init(&self, value: u32) {
        self.value.store(value, Ordering::Release);
    }

    /// Decrement the count, sleeping on the futex while it is zero.
    ///
    /// Acquire is the only suspension point in the allocator and waits
    /// indefinitely.
    pub fn acquire(&self) -> Result<()> {
        loop {
            let mut value = self.value.load(Ordering::Relaxed);
            while value > 0 {
                match self.value.compare_exchange_weak(
                    value,
                    value - 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Ok(()),
                    Err(current) => value = current,
                }
            }
            // Sleep until a release bumps the count. A stale count (AGAIN)
            // or a signal (INTR) just re-runs the fast path.
            match futex::wait(&self.value, futex::Flags::empty(), 0, None) {
                Ok(()) => {}
                Err(errno) if errno == Errno::AGAIN || errno == Errno::INTR => {}
                Err(errno) => return Err(Error::os("futex_wait", errno)),
            }
        }
    }

    /// Increment the count and wake one sleeping process.
    pub fn release(&self) -> Result<()> {
        self.value.fetch_add(1, Ordering::Release);
        match futex::wake(&self.value, futex::Flags::empty(), 1) {
            Ok(_) => Ok(()),
            Err(errno) => Err(Error::os("futex_wake", errno)),
        }
    }

    #[cfg(test)]
    fn count(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Scoped ownership of the semaphore: released on every exit path.
pub(crate) struct SemGuard<'a> {
    sem: &'a Semaphore,
}

impl<'a> SemGuard<'a> {
    pub fn acquire(sem: &'a Semaphore) -> Result<Self> {
        sem.acquire()?;
        Ok(Self { sem })
    }
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        // A lost release deadlocks every attached process, and there is no
        // caller left to hand the error to. Log and abort.
        if let Err(error) = self.sem.release() {
            tracing::error!(%error, "failed to release the shared-heap lock");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn semaphore(value: u32) -> Semaphore {
        let sem = Semaphore {
            value: AtomicU32::new(0),
        };
        sem.init(value);
        sem
    }

    #[test]
    fn test_acquire_release_counts() {
        let sem = semaphore(1);
        assert_eq!(sem.count(), 1);

        sem.acquire().unwrap();
        assert_eq!(sem.count(), 0);

        sem.release().unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let sem = semaphore(1);
        {
            let _guard = SemGuard::acquire(&sem).unwrap();
            assert_eq!(sem.count(), 0);
        }
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_mutual_exclusion_between_threads() {
        // The futex path also works between threads of one process; a
        // non-atomic counter under the guard must never lose an update.
        let sem = semaphore(1);
        let hits = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = SemGuard::acquire(&sem).unwrap();
                        let seen = hits.load(Ordering::Relaxed);
                        hits.store(seen + 1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(hits.load(Ordering::Relaxed), 4000);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let sem = semaphore(1);
        sem.acquire().unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| sem.acquire());
            thread::sleep(std::time::Duration::from_millis(20));
            sem.release().unwrap();
            waiter.join().unwrap().unwrap();
        });

        assert_eq!(sem.count(), 0);
    }
}
