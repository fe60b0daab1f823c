//! The driver: the control block at the base of the shared region.
//!
//! The driver owns the region. It holds the cross-process lock, the
//! canonical base address chosen by the master, the committed size of the
//! backing file, and one dummy-headed free list per size class. Its
//! alignment makes the address right after it the first valid chunk, so
//! the whole region is one contiguous chunk sequence.
//!
//! Every operation below that touches chunk tags or list links runs under
//! the embedded semaphore; operations on the allocator are strictly
//! serialized and the only observable history is a linearizable one.

use super::chunk::{Chunk, ChunkFooter, ChunkHeader, ChunkRef};
use super::layout::{
    align_up, size_class, CHUNK_OVERHEAD, DATA_ALIGN, MAX_REGION_SIZE, MIN_CHUNK_SIZE, NUM_CLASSES,
};
use super::sem::{SemGuard, Semaphore};
use crate::error::{Error, Result};
use rustix::fd::AsFd;
use std::mem;
use std::ptr;

/// The control block at offset 0 of every shared region.
#[repr(C, align(16))]
pub(crate) struct Driver {
    /// Cross-process lock guarding `size`, the free lists and every chunk
    /// tag.
    sem: Semaphore,
    /// Canonical base address; written once by the master at creation and
    /// read-only afterwards.
    addr: usize,
    /// Committed (truncated) bytes of the backing file; grows
    /// monotonically, only under the lock.
    size: usize,
    /// Dummy heads of the segregated free lists: index `i` holds free
    /// chunks whose size satisfies `floor(log2(size)) == i`.
    free_list: [Chunk; NUM_CLASSES],
}

/// Aggregate statistics from a full audit walk of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Committed bytes of the region, driver included.
    pub committed: usize,
    /// Payload bytes sitting in free chunks.
    pub free_bytes: usize,
    /// Number of free chunks.
    pub free_chunks: usize,
    /// Payload bytes currently handed out to callers.
    pub used_bytes: usize,
    /// Number of allocated chunks.
    pub used_chunks: usize,
}

/// Copyable handle to the driver of an attached region.
#[derive(Clone, Copy)]
pub(crate) struct DriverRef(*mut Driver);

impl DriverRef {
    /// Master path: construct the control block in place over the base of
    /// a freshly truncated region and seed the first free chunk.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a writable `MAP_SHARED` mapping at
    /// least `committed` bytes long, and no other process may have
    /// attached yet.
    pub unsafe fn create(base: *mut u8, committed: usize) -> Self {
        let driver = Self(base.cast::<Driver>());
        unsafe {
            // Zeroing leaves every dummy head empty with null links.
            ptr::write_bytes(base, 0, mem::size_of::<Driver>());
            (*driver.0).sem.init(1);
            (*driver.0).addr = base as usize;
            (*driver.0).size = committed;
            let span = committed - mem::size_of::<Driver>();
            if span >= MIN_CHUNK_SIZE {
                driver.add_span(base.add(mem::size_of::<Driver>()), span);
            }
        }
        driver
    }

    /// Attacher path: adopt the control block the master already built.
    ///
    /// # Safety
    ///
    /// `base` must be a mapping of a region the master initialized.
    pub unsafe fn adopt(base: *mut u8) -> Self {
        Self(base.cast())
    }

    /// The base address the master recorded at creation.
    ///
    /// # Safety
    ///
    /// The driver must be initialized.
    pub unsafe fn canonical_addr(self) -> usize {
        unsafe { (*self.0).addr }
    }

    /// Committed bytes right now. Races with growth unless the caller
    /// holds the lock.
    ///
    /// # Safety
    ///
    /// The driver must be initialized.
    pub unsafe fn committed(self) -> usize {
        unsafe { (*self.0).size }
    }

    /// Take the region lock for the duration of the returned guard.
    ///
    /// # Safety
    ///
    /// The driver must be initialized and stay mapped while the guard
    /// lives.
    pub unsafe fn lock<'a>(self) -> Result<SemGuard<'a>> {
        let sem = unsafe { &*ptr::addr_of!((*self.0).sem) };
        SemGuard::acquire(sem)
    }

    #[inline]
    fn base(self) -> usize {
        self.0 as usize
    }

    /// Address of the first chunk, right after the control block.
    #[inline]
    fn first_chunk(self) -> usize {
        self.base() + mem::size_of::<Driver>()
    }

    /// One past the committed region.
    unsafe fn end(self) -> usize {
        self.base() + unsafe { self.committed() }
    }

    /// Dummy head of a size class, addressable as a chunk.
    unsafe fn head(self, class: usize) -> ChunkRef {
        debug_assert!(class < NUM_CLASSES);
        unsafe { ChunkRef::new(ptr::addr_of_mut!((*self.0).free_list[class])) }
    }

    /// Head insertion into the class list matching the chunk's size.
    unsafe fn push_free(self, c: ChunkRef) {
        unsafe {
            let head = self.head(size_class(c.size()));
            let next = (*head.footer()).next;
            (*head.footer()).next = c.as_ptr();
            (*c.header()).prev = head.as_ptr();
            (*c.footer()).next = next;
            if !next.is_null() {
                (*ChunkRef::new(next).header()).prev = c.as_ptr();
            }
        }
    }

    /// Unlink a free chunk from its list.
    ///
    /// `prev` is never null for a listed chunk (the dummy head at worst),
    /// and the dummy's own `prev` is defined null and never dereferenced
    /// here.
    unsafe fn unlink_free(self, c: ChunkRef) {
        unsafe {
            let prev = (*c.header()).prev;
            let next = (*c.footer()).next;
            (*c.header()).prev = ptr::null_mut();
            (*c.footer()).next = ptr::null_mut();
            (*ChunkRef::new(prev).footer()).next = next;
            if !next.is_null() {
                (*ChunkRef::new(next).header()).prev = prev;
            }
        }
    }

    /// Physical predecessor, when it exists and is free.
    ///
    /// The word right before a chunk is its predecessor's footer; a zero
    /// size there means the predecessor is allocated and unreachable.
    unsafe fn before(self, c: ChunkRef) -> Option<ChunkRef> {
        if c.addr() == self.first_chunk() {
            return None;
        }
        unsafe {
            let footer = (c.addr() - mem::size_of::<ChunkFooter>()) as *mut ChunkFooter;
            let size = (*footer).size;
            if size == 0 {
                return None;
            }
            let start = footer as usize - size - mem::size_of::<ChunkHeader>();
            Some(ChunkRef::new(start as *mut Chunk))
        }
    }

    /// Physical successor, when it fits the committed region and is free.
    unsafe fn after(self, c: ChunkRef) -> Option<ChunkRef> {
        unsafe {
            let next = ChunkRef::new((c.addr() + c.full_size()) as *mut Chunk);
            if next.addr() + MIN_CHUNK_SIZE > self.end() {
                return None;
            }
            if next.is_allocated() {
                return None;
            }
            Some(next)
        }
    }

    /// Introduce `span` bytes at `addr` as one free chunk, merging with
    /// any free neighbors.
    unsafe fn add_span(self, addr: *mut u8, span: usize) -> ChunkRef {
        unsafe {
            let c = ChunkRef::init_free_span(addr, span);
            self.coalesce(c)
        }
    }

    /// Merge a free chunk with both free neighbors in one step and link
    /// the result by class.
    ///
    /// The rebuilt span re-enters through `add_span`; its second coalesce
    /// pass finds both neighbors gone and just links it, so the recursion
    /// bottoms out immediately.
    unsafe fn coalesce(self, c: ChunkRef) -> ChunkRef {
        unsafe {
            let before = self.before(c);
            let after = self.after(c);
            if before.is_none() && after.is_none() {
                self.push_free(c);
                return c;
            }
            let mut span = c.full_size();
            if let Some(b) = before {
                self.unlink_free(b);
                span += b.full_size();
            }
            if let Some(a) = after {
                self.unlink_free(a);
                span += a.full_size();
            }
            let start = before.unwrap_or(c);
            self.add_span(start.as_ptr().cast(), span)
        }
    }

    /// Claim a free chunk for a rounded request, splitting off the excess
    /// when it can stand as a chunk of its own.
    unsafe fn take(self, c: ChunkRef, req: usize) {
        debug_assert_eq!(req & (DATA_ALIGN - 1), 0, "request unaligned");
        unsafe {
            debug_assert!(c.size() >= req, "chunk smaller than request");
            self.unlink_free(c);
            let rem = c.size() - req;
            if rem >= MIN_CHUNK_SIZE {
                // Shrink in place; the relocated footer flags allocation
                // and the tail span goes back to the free lists.
                (*c.header()).size = req;
                (*c.footer()).size = 0;
                (*c.footer()).next = ptr::null_mut();
                self.add_span((c.addr() + c.full_size()) as *mut u8, rem);
            } else {
                // The slack cannot hold a minimum chunk; absorb it.
                (*c.footer()).size = 0;
            }
        }
    }

    /// Allocate `n` payload bytes.
    ///
    /// Returns null for `n == 0` without touching any state. Scans the
    /// free lists first-fit from the request's class upward, growing the
    /// region when nothing fits.
    ///
    /// # Safety
    ///
    /// The driver must be initialized and `fd` must be the region's
    /// backing file.
    pub unsafe fn allocate<Fd: AsFd>(self, fd: Fd, n: usize) -> Result<*mut u8> {
        if n == 0 {
            return Ok(ptr::null_mut());
        }
        if n > usize::MAX - (DATA_ALIGN - 1) {
            return Err(Error::OutOfMemory {
                limit: MAX_REGION_SIZE,
            });
        }
        let req = align_up(n);

        let _lock = unsafe { self.lock()? };
        unsafe {
            for class in size_class(req)..NUM_CLASSES {
                let mut cursor = (*self.head(class).footer()).next;
                while !cursor.is_null() {
                    let c = ChunkRef::new(cursor);
                    if c.size() >= req {
                        self.take(c, req);
                        return Ok(c.payload());
                    }
                    cursor = (*c.footer()).next;
                }
            }
            let need = req
                .checked_add(CHUNK_OVERHEAD)
                .ok_or(Error::OutOfMemory { limit: MAX_REGION_SIZE })?;
            let c = self.extend(fd, need)?;
            self.take(c, req);
            Ok(c.payload())
        }
    }

    /// Free a payload pointer.
    ///
    /// Null is a no-op. A misaligned pointer or a chunk not marked
    /// allocated is a caller bug and fails fast.
    ///
    /// # Safety
    ///
    /// The driver must be initialized; `p` must be null or a pointer
    /// obtained from [`allocate`](Self::allocate) on this region.
    pub unsafe fn deallocate(self, p: *mut u8) -> Result<()> {
        if p.is_null() {
            return Ok(());
        }
        let c = ChunkRef::from_payload(p)?;
        let _lock = unsafe { self.lock()? };
        unsafe {
            if (*c.footer()).size != 0 {
                return Err(Error::NotAllocated { addr: c.addr() });
            }
            (*c.footer()).size = (*c.header()).size;
            self.coalesce(c);
        }
        Ok(())
    }

    /// Grow the committed region by at least `need` bytes.
    ///
    /// Doubles the committed size until the delta covers the request,
    /// capped at `MAX_REGION_SIZE`; re-truncates the backing file and
    /// introduces the new tail as one free chunk, which coalesces with a
    /// free old tail. Must be called with the lock held.
    unsafe fn extend<Fd: AsFd>(self, fd: Fd, need: usize) -> Result<ChunkRef> {
        let old = unsafe { self.committed() };
        let mut grown = old;
        while grown < MAX_REGION_SIZE && grown - old < need {
            grown = (grown * 2).min(MAX_REGION_SIZE);
        }
        if grown - old < need {
            return Err(Error::OutOfMemory { limit: MAX_REGION_SIZE });
        }

        rustix::fs::ftruncate(fd, grown as u64).map_err(|e| Error::os("ftruncate", e))?;
        tracing::debug!(from = old, to = grown, "grew shared region");
        unsafe {
            (*self.0).size = grown;
            Ok(self.add_span((self.base() + old) as *mut u8, grown - old))
        }
    }

    /// Walk the physical chunk sequence and the class lists under the
    /// lock, verifying the boundary tags, the coalescing invariant, class
    /// membership and exact byte accounting.
    ///
    /// # Safety
    ///
    /// The driver must be initialized.
    pub unsafe fn audit(self) -> Result<HeapStats> {
        let _lock = unsafe { self.lock()? };

        unsafe {
            let committed = self.committed();
            let end = self.end();
            let mut stats = HeapStats {
                committed,
                free_bytes: 0,
                free_chunks: 0,
                used_bytes: 0,
                used_chunks: 0,
            };

            let mut at = self.first_chunk();
            let mut prev_free = false;
            while at < end {
                let c = ChunkRef::new(at as *mut Chunk);
                let size = c.size();
                if size == 0 || size % DATA_ALIGN != 0 {
                    return Err(Error::Corrupted(format!(
                        "chunk at {at:#x} has invalid size {size}"
                    )));
                }
                if at + c.full_size() > end {
                    return Err(Error::Corrupted(format!(
                        "chunk at {at:#x} overruns the committed region"
                    )));
                }
                let footer = (*c.footer()).size;
                if footer == 0 {
                    stats.used_bytes += size;
                    stats.used_chunks += 1;
                    prev_free = false;
                } else if footer == size {
                    if prev_free {
                        return Err(Error::Corrupted(format!("adjacent free chunks at {at:#x}")));
                    }
                    stats.free_bytes += size;
                    stats.free_chunks += 1;
                    prev_free = true;
                } else {
                    return Err(Error::Corrupted(format!(
                        "chunk at {at:#x}: footer size {footer} does not mirror header size {size}"
                    )));
                }
                at += c.full_size();
            }
            if at != end {
                return Err(Error::Corrupted(format!(
                    "chunk walk ended at {at:#x}, region ends at {end:#x}"
                )));
            }

            // Every free chunk must sit on exactly the list of its class.
            let mut listed = 0usize;
            for class in 0..NUM_CLASSES {
                let mut cursor = (*self.head(class).footer()).next;
                while !cursor.is_null() {
                    let c = ChunkRef::new(cursor);
                    if (*c.footer()).size != c.size() {
                        return Err(Error::Corrupted(format!(
                            "allocated chunk at {:#x} left on a free list",
                            c.addr()
                        )));
                    }
                    if size_class(c.size()) != class {
                        return Err(Error::Corrupted(format!(
                            "chunk at {:#x} with size {} filed under class {class}",
                            c.addr(),
                            c.size()
                        )));
                    }
                    listed += 1;
                    cursor = (*c.footer()).next;
                }
            }
            if listed != stats.free_chunks {
                return Err(Error::Corrupted(format!(
                    "{listed} chunks on the free lists, {} free chunks in the region",
                    stats.free_chunks
                )));
            }

            Ok(stats)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::layout::MIN_REGION_SIZE;
    use rustix::fs::MemfdFlags;
    use rustix::mm::{MapFlags, ProtFlags};

    /// A driver over a memfd-backed mapping, fully inside one process.
    struct TestRegion {
        fd: rustix::fd::OwnedFd,
        base: *mut u8,
        driver: DriverRef,
    }

    impl TestRegion {
        fn new() -> Self {
            let fd = rustix::fs::memfd_create("shmheap-driver-test", MemfdFlags::CLOEXEC).unwrap();
            rustix::fs::ftruncate(&fd, MIN_REGION_SIZE as u64).unwrap();
            let base = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    MAX_REGION_SIZE,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    &fd,
                    0,
                )
                .unwrap()
            }
            .cast::<u8>();
            let driver = unsafe { DriverRef::create(base, MIN_REGION_SIZE) };
            Self { fd, base, driver }
        }

        fn allocate(&self, n: usize) -> Result<*mut u8> {
            unsafe { self.driver.allocate(&self.fd, n) }
        }

        fn deallocate(&self, p: *mut u8) -> Result<()> {
            unsafe { self.driver.deallocate(p) }
        }

        fn audit(&self) -> HeapStats {
            unsafe { self.driver.audit().unwrap() }
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe {
                let _ = rustix::mm::munmap(self.base.cast(), MAX_REGION_SIZE);
            }
        }
    }

    #[test]
    fn test_create_seeds_one_free_chunk() {
        let region = TestRegion::new();
        let stats = region.audit();

        assert_eq!(stats.committed, MIN_REGION_SIZE);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.used_chunks, 0);
        assert_eq!(
            stats.free_bytes,
            MIN_REGION_SIZE - mem::size_of::<Driver>() - CHUNK_OVERHEAD
        );
    }

    #[test]
    fn test_allocate_splits_and_free_restores() {
        let region = TestRegion::new();
        let before = region.audit();

        let p = region.allocate(64).unwrap();
        assert_eq!(p as usize % DATA_ALIGN, 0);

        let mid = region.audit();
        assert_eq!(mid.used_chunks, 1);
        assert_eq!(mid.used_bytes, 64);
        assert_eq!(mid.free_chunks, 1);

        region.deallocate(p).unwrap();
        assert_eq!(region.audit(), before);
    }

    #[test]
    fn test_first_fit_reuses_freed_chunk() {
        let region = TestRegion::new();

        let a = region.allocate(64).unwrap();
        let _guard = region.allocate(16).unwrap();
        region.deallocate(a).unwrap();

        // The freed 64-byte chunk is the only one in its class and is
        // picked before the large tail chunk.
        let b = region.allocate(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_coalesce_merges_both_neighbors() {
        let region = TestRegion::new();

        let a = region.allocate(64).unwrap();
        let b = region.allocate(64).unwrap();
        let c = region.allocate(64).unwrap();
        let _guard = region.allocate(16).unwrap();

        region.deallocate(a).unwrap();
        region.deallocate(c).unwrap();
        let split = region.audit();
        assert_eq!(split.free_chunks, 3); // a, c, and the tail

        // Freeing b bridges a and c into one chunk in a single step.
        region.deallocate(b).unwrap();
        let merged = region.audit();
        assert_eq!(merged.free_chunks, 2);
        assert_eq!(
            merged.free_bytes,
            split.free_bytes + 64 + 2 * CHUNK_OVERHEAD
        );
    }

    #[test]
    fn test_small_remainder_is_absorbed() {
        let region = TestRegion::new();

        let a = region.allocate(32).unwrap();
        let _guard = region.allocate(16).unwrap();
        region.deallocate(a).unwrap();

        // A 16-byte request out of the freed 32-byte chunk leaves slack
        // too small for a chunk of its own.
        let used_before = region.audit().used_bytes;
        let b = region.allocate(16).unwrap();
        assert_eq!(a, b);
        assert_eq!(region.audit().used_bytes, used_before + 32);
    }

    #[test]
    fn test_extend_doubles_until_request_fits() {
        let region = TestRegion::new();

        // Far larger than the initial page: 4096 -> 8192 -> 16384.
        let p = region.allocate(8000).unwrap();
        let stats = region.audit();
        assert_eq!(stats.committed, 4 * MIN_REGION_SIZE);
        assert_eq!(stats.used_bytes, 8000);

        unsafe {
            // The grown tail is real mapped memory.
            p.write_bytes(0xEE, 8000);
        }
    }

    #[test]
    fn test_extend_coalesces_with_free_tail() {
        let region = TestRegion::new();
        let free_before = region.audit().free_bytes;

        // Leaves the initial tail chunk free; growth must merge the new
        // span into it rather than leave two adjacent free chunks.
        let p = region.allocate(6000).unwrap();
        let stats = region.audit();
        assert_eq!(stats.committed, 4 * MIN_REGION_SIZE);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(
            stats.free_bytes,
            free_before + 3 * MIN_REGION_SIZE - 6000 - CHUNK_OVERHEAD
        );
        region.deallocate(p).unwrap();
    }

    #[test]
    fn test_allocate_beyond_cap_is_out_of_memory() {
        let region = TestRegion::new();
        match region.allocate(MAX_REGION_SIZE) {
            Err(Error::OutOfMemory { limit }) => assert_eq!(limit, MAX_REGION_SIZE),
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        // The failed attempt must not have disturbed anything.
        region.audit();
    }

    #[test]
    fn test_double_free_fails_fast() {
        let region = TestRegion::new();
        let p = region.allocate(64).unwrap();
        region.deallocate(p).unwrap();
        match region.deallocate(p) {
            Err(Error::NotAllocated { .. }) => {}
            other => panic!("expected NotAllocated, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_allocate_is_null_and_stateless() {
        let region = TestRegion::new();
        let before = region.audit();
        assert!(region.allocate(0).unwrap().is_null());
        assert_eq!(region.audit(), before);
    }

    #[test]
    fn test_null_free_is_noop() {
        let region = TestRegion::new();
        let before = region.audit();
        region.deallocate(std::ptr::null_mut()).unwrap();
        assert_eq!(region.audit(), before);
    }
}
