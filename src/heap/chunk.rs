//! Boundary-tagged chunk layout and addressing.
//!
//! A chunk is a contiguous aligned span: header, payload, footer. The
//! header carries the payload size and the free-list `prev` link; the
//! footer mirrors the size while the chunk is free and holds `0` while it
//! is allocated, which doubles as the allocation flag, plus the free-list
//! `next` link. Splitting the two links between the tags keeps the
//! overhead at one tag pair per chunk.
//!
//! All link pointers are canonical addresses: every attached process maps
//! the region at the same base, so they can be stored in shared memory
//! as-is.

use super::layout::{CHUNK_OVERHEAD, DATA_ALIGN, MIN_CHUNK_SIZE};
use crate::error::{Error, Result};
use std::mem;
use std::ptr;

/// Leading tag of every chunk, aligned so the payload after it is too.
#[repr(C, align(16))]
pub(crate) struct ChunkHeader {
    /// Payload size in bytes: a nonzero multiple of `DATA_ALIGN`.
    pub size: usize,
    /// Previous chunk in the free list, or null. Unused while allocated.
    pub prev: *mut Chunk,
}

/// Trailing tag of every chunk.
#[repr(C, align(16))]
pub(crate) struct ChunkFooter {
    /// Mirror of the header size while free; `0` while allocated.
    pub size: usize,
    /// Next chunk in the free list, or null. Unused while allocated.
    pub next: *mut Chunk,
}

/// A chunk as laid out at the start of its span.
///
/// The footer here is a placeholder: the real footer sits at the end of
/// the payload. The placeholder pair is what makes the driver's dummy
/// list heads addressable as real chunks: a dummy has `size == 0`, so
/// its computed footer lands exactly on the placeholder.
#[repr(C)]
pub(crate) struct Chunk {
    /// Placeholder only; accessed through [`ChunkRef::header`].
    _header: ChunkHeader,
    /// Placeholder only; the real footer is found through
    /// [`ChunkRef::footer`].
    _footer: ChunkFooter,
}

/// Copyable handle to a chunk living inside the shared region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkRef(*mut Chunk);

impl ChunkRef {
    #[inline]
    pub fn new(ptr: *mut Chunk) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut Chunk {
        self.0
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Recover the chunk from a payload pointer handed back by a caller.
    ///
    /// A misaligned pointer cannot have come from `allocate` and is
    /// rejected as a caller bug.
    pub fn from_payload(payload: *mut u8) -> Result<Self> {
        let addr = payload as usize;
        if addr & (DATA_ALIGN - 1) != 0 {
            return Err(Error::MisalignedPointer { addr });
        }
        Ok(Self((addr - mem::size_of::<ChunkHeader>()) as *mut Chunk))
    }

    #[inline]
    pub fn header(self) -> *mut ChunkHeader {
        self.0.cast()
    }

    /// Payload address: right after the header.
    #[inline]
    pub fn payload(self) -> *mut u8 {
        (self.addr() + mem::size_of::<ChunkHeader>()) as *mut u8
    }

    /// Payload size from the header.
    ///
    /// # Safety
    ///
    /// `self` must reference a live chunk (or dummy head) in an attached
    /// region.
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { (*self.header()).size }
    }

    /// Whole span: header, payload, footer.
    ///
    /// # Safety
    ///
    /// Same as [`size`](Self::size).
    #[inline]
    pub unsafe fn full_size(self) -> usize {
        unsafe { CHUNK_OVERHEAD + self.size() }
    }

    /// The real footer at the end of the span.
    ///
    /// # Safety
    ///
    /// Same as [`size`](Self::size).
    #[inline]
    pub unsafe fn footer(self) -> *mut ChunkFooter {
        unsafe { (self.addr() + self.full_size() - mem::size_of::<ChunkFooter>()) as *mut ChunkFooter }
    }

    /// Whether the footer flags this chunk as allocated.
    ///
    /// # Safety
    ///
    /// Same as [`size`](Self::size).
    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { (*self.footer()).size == 0 }
    }

    /// Stamp a free chunk over `span` bytes at `addr`, with null links.
    ///
    /// The span arithmetic is an allocator invariant, not caller input.
    ///
    /// # Safety
    ///
    /// `addr..addr + span` must be writable region memory not referenced
    /// by any other chunk.
    pub unsafe fn init_free_span(addr: *mut u8, span: usize) -> Self {
        debug_assert_eq!(span & (DATA_ALIGN - 1), 0, "free span unaligned");
        debug_assert!(span >= MIN_CHUNK_SIZE, "free span below minimum chunk");
        let c = Self(addr.cast());
        unsafe {
            (*c.header()).size = span - CHUNK_OVERHEAD;
            (*c.header()).prev = ptr::null_mut();
            (*c.footer()).size = (*c.header()).size; // unallocated
            (*c.footer()).next = ptr::null_mut();
        }
        c
    }
}
