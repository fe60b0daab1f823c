//! The process-shared heap.
//!
//! # Architecture
//!
//! - [`SharedHeap`]: the per-process handle; attach/detach protocol and the
//!   allocate/deallocate entry points
//! - `driver`: the control block at the base of the region (lock, canonical
//!   base, committed size, segregated free lists)
//! - `chunk`: boundary-tagged chunk layout and addressing
//! - `sem`: futex-backed cross-process semaphore
//! - `region`: shm object and mapping mechanics
//!
//! # Example
//!
//! ```rust,ignore
//! use shmheap::{Mode, SharedHeap};
//!
//! let heap = SharedHeap::create("scratch.shm", Mode::RUSR | Mode::WUSR)?;
//! let p = heap.allocate(128)?;
//! heap.deallocate(p, 128)?;
//! heap.unlink()?;
//! heap.close()?;
//! ```

mod chunk;
mod driver;
mod layout;
mod region;
mod sem;
mod shared;

pub use driver::HeapStats;
pub use layout::{DATA_ALIGN, MAX_REGION_SIZE, MIN_REGION_SIZE};
pub use shared::{unlink, SharedAlloc, SharedHeap};

// The open flags and permission bits of the underlying shm object are
// plain rustix types; re-exported so callers don't need rustix directly.
pub use rustix::fs::Mode;
pub use rustix::shm::OFlags;
