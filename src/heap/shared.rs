//! The public heap handle and the attach/detach protocol.

use super::driver::{DriverRef, HeapStats};
use super::layout::{MAX_REGION_SIZE, MIN_REGION_SIZE};
use super::region;
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::shm::OFlags;
use std::ptr;

/// Allocation capability pair consumed by container adapters.
///
/// Containers parameterized by this trait layer on the shared heap
/// without knowing anything else about it; the whole contract is the
/// allocate/deallocate pair.
pub trait SharedAlloc {
    /// Allocate `n` bytes; null for `n == 0`.
    fn allocate(&self, n: usize) -> Result<*mut u8>;

    /// Release a pointer from [`allocate`](Self::allocate). `n` is
    /// advisory and ignored.
    fn deallocate(&self, ptr: *mut u8, n: usize) -> Result<()>;
}

/// A heap living inside a named POSIX shared memory region.
///
/// Exactly one process, the *master* (the one that opens with
/// [`OFlags::TRUNC`]), creates and initializes the region; every other
/// process attaches to the initialized region and ends up mapped at the
/// same canonical base, so pointers returned by [`allocate`] can be
/// stored inside the heap and dereferenced from any attached process.
///
/// # Example
///
/// ```rust,ignore
/// use shmheap::{Mode, SharedHeap};
///
/// // Master process.
/// let heap = SharedHeap::create("scratch.shm", Mode::RUSR | Mode::WUSR)?;
/// let p = heap.allocate(64)?;
///
/// // Any cooperating process.
/// let heap = SharedHeap::attach("scratch.shm")?;
/// // ... dereference canonical pointers published by the master ...
/// ```
///
/// [`allocate`]: Self::allocate
pub struct SharedHeap {
    /// Backing file descriptor; kept open for growth and `mode()`.
    fd: OwnedFd,
    /// Base of the `MAX_REGION_SIZE` reservation; null once closed.
    base: *mut u8,
    /// The control block at the base of the region.
    driver: DriverRef,
    /// Canonical region name.
    name: String,
    /// Flags this handle was opened with.
    oflags: OFlags,
}

impl SharedHeap {
    /// Create and initialize a region as the master process.
    ///
    /// Equivalent to [`open`](Self::open) with
    /// `RDWR | CREATE | TRUNC`.
    pub fn create(name: &str, mode: Mode) -> Result<Self> {
        Self::open(
            Some(name),
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            mode,
        )
    }

    /// Attach read-write to a region another process initialized.
    pub fn attach(name: &str) -> Result<Self> {
        Self::open(
            Some(name),
            OFlags::RDWR | OFlags::CREATE,
            Mode::from_raw_mode(0o600),
        )
    }

    /// Attach to (or create) the named region.
    ///
    /// `name` defaults to `"<pid>.shm"`. [`OFlags::TRUNC`] marks the
    /// caller as the master, which constructs the driver over the freshly
    /// truncated region; everyone else adopts the driver the master built
    /// and, when the kernel picked a different address, remaps at the
    /// canonical base with `MAP_FIXED_NOREPLACE`.
    ///
    /// # Errors
    ///
    /// - [`Error::RegionTooLarge`] if the backing file already exceeds
    ///   [`MAX_REGION_SIZE`].
    /// - [`Error::CanonicalRemap`] / [`Error::BaseMismatch`] if the
    ///   canonical base cannot be adopted; the attach never proceeds with
    ///   a divergent base.
    /// - [`Error::Os`] for any failing system call.
    pub fn open(name: Option<&str>, oflags: OFlags, mode: Mode) -> Result<Self> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => format!("{}.shm", std::process::id()),
        };
        let fd = region::open(&name, oflags, mode)?;

        // Normalize the backing length before mapping.
        let len = region::len(&fd)?;
        if len > MAX_REGION_SIZE as u64 {
            return Err(Error::RegionTooLarge {
                size: len,
                max: MAX_REGION_SIZE,
            });
        }
        let committed = if (len as usize) < MIN_REGION_SIZE {
            region::set_len(&fd, MIN_REGION_SIZE as u64)?;
            MIN_REGION_SIZE
        } else {
            len as usize
        };

        let prot = region::map_prot(oflags);
        let mut base = region::map_reservation(&fd, prot)?;

        let master = oflags.contains(OFlags::TRUNC);
        let driver = if master {
            // SAFETY: the mapping spans `committed` writable bytes of a
            // region we just truncated; nobody else has attached yet.
            unsafe { DriverRef::create(base, committed) }
        } else {
            // SAFETY: an initialized region starts with the driver.
            let adopted = unsafe { DriverRef::adopt(base) };
            let canonical = unsafe { adopted.canonical_addr() };
            if canonical == base as usize {
                adopted
            } else {
                tracing::debug!(
                    canonical,
                    actual = base as usize,
                    "remapping at the canonical base"
                );
                region::unmap(base)?;
                base = region::remap_canonical(&fd, canonical, prot)?;
                // SAFETY: same region, now at the base every process uses.
                unsafe { DriverRef::adopt(base) }
            }
        };

        tracing::debug!(name = %name, base = ?base, committed, master, "attached shared heap");
        Ok(Self {
            fd,
            base,
            driver,
            name,
            oflags,
        })
    }

    /// Allocate `n` payload bytes, aligned to [`DATA_ALIGN`].
    ///
    /// Returns null for `n == 0`. When no free chunk fits, the region
    /// grows by doubling, up to [`MAX_REGION_SIZE`].
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when growth has hit the cap, [`Error::Os`]
    /// when re-truncating the backing file fails.
    ///
    /// [`DATA_ALIGN`]: super::DATA_ALIGN
    pub fn allocate(&self, n: usize) -> Result<*mut u8> {
        // SAFETY: the handle keeps the mapping and the fd alive.
        unsafe { self.driver.allocate(&self.fd, n) }
    }

    /// Release a pointer previously returned by [`allocate`](Self::allocate).
    ///
    /// `n` is advisory and ignored; null is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::MisalignedPointer`] and [`Error::NotAllocated`] flag
    /// caller bugs (a pointer that never came from `allocate`, or a
    /// double free) and leave the heap untouched.
    pub fn deallocate(&self, ptr: *mut u8, n: usize) -> Result<()> {
        let _ = n;
        // SAFETY: the handle keeps the mapping alive.
        unsafe { self.driver.deallocate(ptr) }
    }

    /// Detach from the region, surfacing unmap errors that [`Drop`] would
    /// swallow.
    ///
    /// The master built the driver in place and the embedded lock owns no
    /// kernel object, so teardown is the unmap itself. The backing file
    /// persists until [`unlink`](Self::unlink).
    pub fn close(mut self) -> Result<()> {
        tracing::debug!(name = %self.name, "detaching shared heap");
        let base = std::mem::replace(&mut self.base, ptr::null_mut());
        region::unmap(base)
        // Drop then skips the unmap and closes the fd.
    }

    /// Remove the region by name. Attached processes keep working until
    /// they unmap.
    pub fn unlink(&self) -> Result<()> {
        region::unlink(&self.name)
    }

    /// The mode of the backing object's inode (not necessarily the mode
    /// passed at open).
    pub fn mode(&self) -> Result<Mode> {
        let stat = rustix::fs::fstat(&self.fd).map_err(|e| Error::os("fstat", e))?;
        Ok(Mode::from_bits_truncate(stat.st_mode))
    }

    /// The canonical region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flags this handle was opened with.
    pub fn oflags(&self) -> OFlags {
        self.oflags
    }

    /// Whether this handle created and initialized the region.
    pub fn is_master(&self) -> bool {
        self.oflags.contains(OFlags::TRUNC)
    }

    /// Base address of the mapping: the canonical base.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Committed bytes of the region right now.
    pub fn committed(&self) -> Result<usize> {
        // SAFETY: the handle keeps the mapping alive; the lock orders the
        // read against growth in other processes.
        unsafe {
            let _lock = self.driver.lock()?;
            Ok(self.driver.committed())
        }
    }

    /// Walk the heap under the lock, verifying every metadata invariant,
    /// and return aggregate statistics.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupted`] describing the first violated invariant.
    pub fn stats(&self) -> Result<HeapStats> {
        // SAFETY: the handle keeps the mapping alive.
        unsafe { self.driver.audit() }
    }
}

impl SharedAlloc for SharedHeap {
    fn allocate(&self, n: usize) -> Result<*mut u8> {
        SharedHeap::allocate(self, n)
    }

    fn deallocate(&self, ptr: *mut u8, n: usize) -> Result<()> {
        SharedHeap::deallocate(self, ptr, n)
    }
}

impl Drop for SharedHeap {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // Best effort; `close` exists for callers that need the error.
            let _ = region::unmap(self.base);
        }
        // The fd closes with OwnedFd; the file persists until unlinked.
    }
}

// SAFETY: SharedHeap is Send + Sync because every mutation of the shared
// metadata happens under the embedded cross-process semaphore, and the
// mapping plus fd stay valid for the lifetime of the handle.
unsafe impl Send for SharedHeap {}
unsafe impl Sync for SharedHeap {}

/// Remove a region by name without holding an attached handle.
pub fn unlink(name: &str) -> Result<()> {
    region::unlink(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmheap-shared-{tag}-{}", std::process::id())
    }

    fn master(tag: &str) -> SharedHeap {
        let name = unique_name(tag);
        let _ = unlink(&name);
        SharedHeap::create(&name, Mode::RUSR | Mode::WUSR).unwrap()
    }

    #[test]
    fn test_create_allocate_deallocate_round_trip() {
        let heap = master("round-trip");
        let before = heap.stats().unwrap();

        let p = heap.allocate(100).unwrap();
        assert!(!p.is_null());
        assert_eq!(p as usize % super::super::DATA_ALIGN, 0);
        unsafe {
            p.write_bytes(0xAB, 100);
        }

        let mid = heap.stats().unwrap();
        assert_eq!(mid.used_chunks, 1);
        assert_eq!(mid.used_bytes, 112); // 100 rounded up to the alignment

        heap.deallocate(p, 100).unwrap();
        assert_eq!(heap.stats().unwrap(), before);

        heap.unlink().unwrap();
        heap.close().unwrap();
    }

    #[test]
    fn test_zero_allocate_and_null_free() {
        let heap = master("edges");
        let before = heap.stats().unwrap();

        assert!(heap.allocate(0).unwrap().is_null());
        heap.deallocate(std::ptr::null_mut(), 0).unwrap();
        assert_eq!(heap.stats().unwrap(), before);

        heap.unlink().unwrap();
    }

    #[test]
    fn test_misaligned_pointer_is_rejected() {
        let heap = master("misaligned");
        let p = heap.allocate(64).unwrap();

        match heap.deallocate(unsafe { p.add(1) }, 0) {
            Err(Error::MisalignedPointer { .. }) => {}
            other => panic!("expected MisalignedPointer, got {other:?}"),
        }

        heap.deallocate(p, 64).unwrap();
        heap.unlink().unwrap();
    }

    #[test]
    fn test_double_free_is_rejected() {
        let heap = master("double-free");
        let p = heap.allocate(64).unwrap();
        heap.deallocate(p, 64).unwrap();

        match heap.deallocate(p, 64) {
            Err(Error::NotAllocated { .. }) => {}
            other => panic!("expected NotAllocated, got {other:?}"),
        }

        heap.unlink().unwrap();
    }

    #[test]
    fn test_payloads_stay_inside_the_region() {
        let heap = master("bounds");
        let base = heap.base() as usize;

        for n in [1usize, 16, 100, 1000, 4000] {
            let p = heap.allocate(n).unwrap() as usize;
            let committed = heap.committed().unwrap();
            assert!(p >= base);
            assert!(p + n <= base + committed);
        }

        heap.unlink().unwrap();
    }

    #[test]
    fn test_accessors() {
        let heap = master("accessors");

        assert!(heap.is_master());
        assert!(heap.oflags().contains(OFlags::TRUNC));
        assert!(heap.name().starts_with("shmheap-shared-accessors"));

        let mode = heap.mode().unwrap();
        assert!(mode.contains(Mode::RUSR));
        assert!(mode.contains(Mode::WUSR));

        heap.unlink().unwrap();
    }

    #[test]
    fn test_default_name_uses_pid() {
        let heap = SharedHeap::open(
            None,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::RUSR | Mode::WUSR,
        )
        .unwrap();
        assert_eq!(heap.name(), format!("{}.shm", std::process::id()));
        heap.unlink().unwrap();
    }

    #[test]
    fn test_attach_after_unlink_fails() {
        let heap = master("unlinked");
        heap.unlink().unwrap();
        heap.close().unwrap();

        let name = unique_name("unlinked");
        match SharedHeap::open(Some(&name), OFlags::RDWR, Mode::empty()) {
            Err(Error::Os { op: "shm_open", .. }) => {}
            Err(other) => panic!("expected shm_open failure, got {other}"),
            Ok(_) => panic!("open succeeded on an unlinked region"),
        }
    }

    #[test]
    fn test_shared_alloc_capability_pair() {
        fn churn(alloc: &dyn SharedAlloc) {
            let p = alloc.allocate(48).unwrap();
            alloc.deallocate(p, 48).unwrap();
        }

        let heap = master("capability");
        churn(&heap);
        assert_eq!(heap.stats().unwrap().used_chunks, 0);
        heap.unlink().unwrap();
    }
}
