//! Layout constants and size arithmetic for the shared heap.

use super::chunk::Chunk;
use super::driver::Driver;
use std::mem;

/// Payload alignment. 16 is a typical `malloc` alignment.
pub const DATA_ALIGN: usize = 16;

/// Minimum payload bytes a chunk can carry; equals the alignment.
pub const MIN_DATA_SIZE: usize = DATA_ALIGN;

/// Initial (and minimum) committed size of a region: one typical page.
pub const MIN_REGION_SIZE: usize = 4096;

/// Maximum mappable region size. Larger reservations can fail to map on
/// some systems.
pub const MAX_REGION_SIZE: usize = 1 << (if usize::BITS == 64 { 32 } else { 30 });

/// Number of segregated free lists: one per possible size exponent.
pub(crate) const NUM_CLASSES: usize = usize::BITS as usize;

/// Header plus footer bytes wrapped around every payload.
pub(crate) const CHUNK_OVERHEAD: usize = mem::size_of::<Chunk>();

/// Smallest whole chunk: metadata plus the minimum payload.
pub(crate) const MIN_CHUNK_SIZE: usize = CHUNK_OVERHEAD + MIN_DATA_SIZE;

/// Round a byte count up to the next `DATA_ALIGN` multiple.
#[inline]
pub(crate) const fn align_up(n: usize) -> usize {
    (n + DATA_ALIGN - 1) & !(DATA_ALIGN - 1)
}

/// Segregated-list index for a chunk size: `floor(log2(size))`.
///
/// List `i` holds free chunks with sizes in `[2^i, 2^(i+1))`.
#[inline]
pub(crate) fn size_class(size: usize) -> usize {
    debug_assert!(size != 0, "size class of zero");
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

// The driver must fit in the initial page, and its size must keep the
// first chunk (and through it every header and footer) on the payload
// alignment.
const _: () = {
    assert!(mem::size_of::<Driver>() <= MIN_REGION_SIZE);
    assert!(mem::size_of::<Driver>() % DATA_ALIGN == 0);
    assert!(CHUNK_OVERHEAD % DATA_ALIGN == 0);
    assert!(MAX_REGION_SIZE.is_power_of_two());
};
