//! Mapping mechanics for the shared region.
//!
//! The region is a POSIX shared memory object mapped as one
//! `MAX_REGION_SIZE` reservation. Reserving the maximum up front means
//! growth only ever re-truncates the backing file; the mapping itself
//! never moves, so canonical addresses stay stable for the life of the
//! attach.

use super::layout::MAX_REGION_SIZE;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::OFlags;

/// Open (or create) the named shared memory object.
pub(crate) fn open(name: &str, oflags: OFlags, mode: Mode) -> Result<OwnedFd> {
    rustix::shm::open(name, oflags, mode).map_err(|e| Error::os("shm_open", e))
}

/// Remove the named shared memory object. Already-mapped processes keep
/// working until they unmap.
pub(crate) fn unlink(name: &str) -> Result<()> {
    rustix::shm::unlink(name).map_err(|e| Error::os("shm_unlink", e))
}

/// Current length of the backing file.
pub(crate) fn len(fd: impl AsFd) -> Result<u64> {
    let stat = rustix::fs::fstat(fd).map_err(|e| Error::os("fstat", e))?;
    Ok(stat.st_size as u64)
}

/// Truncate the backing file to `len` bytes.
pub(crate) fn set_len(fd: impl AsFd, len: u64) -> Result<()> {
    rustix::fs::ftruncate(fd, len).map_err(|e| Error::os("ftruncate", e))
}

/// Protection bits implied by the open flags: read-only opens clear
/// write, read-write opens keep both.
pub(crate) fn map_prot(oflags: OFlags) -> ProtFlags {
    let mut prot = ProtFlags::READ;
    if oflags.contains(OFlags::RDWR) {
        prot |= ProtFlags::WRITE;
    }
    prot
}

/// Map the full `MAX_REGION_SIZE` reservation at a kernel-chosen address.
pub(crate) fn map_reservation(fd: impl AsFd, prot: ProtFlags) -> Result<*mut u8> {
    // SAFETY: fresh mapping over a file descriptor we own; no existing
    // Rust objects are aliased.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            MAX_REGION_SIZE,
            prot,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| Error::os("mmap", e))?;
    Ok(ptr.cast())
}

/// Re-map the reservation at the canonical base recorded by the master,
/// refusing to replace any mapping already occupying those addresses.
pub(crate) fn remap_canonical(fd: impl AsFd, canonical: usize, prot: ProtFlags) -> Result<*mut u8> {
    // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping; on
    // conflict the call fails instead.
    let ptr = unsafe {
        rustix::mm::mmap(
            canonical as *mut _,
            MAX_REGION_SIZE,
            prot,
            MapFlags::SHARED | MapFlags::FIXED_NOREPLACE,
            fd,
            0,
        )
    }
    .map_err(|errno| Error::CanonicalRemap { canonical, errno })?;

    let actual = ptr as usize;
    if actual != canonical {
        // Kernels before 4.17 treat the flag as a plain hint; never
        // proceed with a divergent base.
        // SAFETY: unmapping the mapping we just created.
        unsafe {
            let _ = rustix::mm::munmap(ptr, MAX_REGION_SIZE);
        }
        return Err(Error::BaseMismatch { canonical, actual });
    }
    Ok(ptr.cast())
}

/// Unmap the full reservation.
pub(crate) fn unmap(base: *mut u8) -> Result<()> {
    // SAFETY: `base` is a reservation returned by one of the mapping
    // calls above; the caller guarantees it is no longer referenced.
    unsafe { rustix::mm::munmap(base.cast(), MAX_REGION_SIZE) }.map_err(|e| Error::os("munmap", e))
}
