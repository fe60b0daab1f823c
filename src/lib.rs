//! # shmheap
//!
//! A process-shared heap: a dynamic allocator whose backing store is a
//! POSIX shared memory object mapped at the same virtual address in every
//! attached process, so that pointers stored inside the heap stay valid
//! across process boundaries.
//!
//! One *master* process creates and initializes the region; any number of
//! cooperating processes attach later and see the same linked structures
//! built through the allocator.
//!
//! ## Features
//!
//! - **Canonical addresses**: every attacher maps the region at the base
//!   recorded by the master (remapping with `MAP_FIXED_NOREPLACE` when the
//!   kernel picks a different address), so raw pointers can be shared.
//! - **Boundary-tagged chunks**: header/footer metadata with segregated
//!   free lists, immediate neighbor coalescing, and split-on-allocate.
//! - **Dynamic growth**: the backing file doubles in size on demand, up to
//!   a fixed reservation that is mapped once and never moved.
//! - **Cross-process locking**: a futex-backed counting semaphore embedded
//!   in the region serializes every allocate/deallocate.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmheap::{Mode, SharedHeap};
//!
//! // Master: create and initialize the region.
//! let heap = SharedHeap::create("my-heap.shm", Mode::RUSR | Mode::WUSR)?;
//! let p = heap.allocate(64)?;
//!
//! // Another process: attach and see the same memory at the same address.
//! let heap = SharedHeap::attach("my-heap.shm")?;
//! # Ok::<(), shmheap::Error>(())
//! ```
//!
//! Linux-only: the attach protocol relies on `MAP_FIXED_NOREPLACE`
//! (Linux >= 4.17) to adopt the canonical base without clobbering
//! existing mappings.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod heap;

pub use error::{Error, Result};
pub use heap::{HeapStats, Mode, OFlags, SharedAlloc, SharedHeap};
