//! Error types for shmheap.

use thiserror::Error;

/// Result type alias using shmheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shared-heap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A system call failed; carries the call name and the OS error code.
    #[error("{op} failed: {errno}")]
    Os {
        /// Name of the failing system call.
        op: &'static str,
        /// The errno reported by the kernel.
        #[source]
        errno: rustix::io::Errno,
    },

    /// The shared region on disk is larger than the mappable maximum.
    #[error("shared region is {size} bytes, above the {max}-byte limit")]
    RegionTooLarge {
        /// Current length of the backing file.
        size: u64,
        /// The maximum mappable region size on this platform.
        max: usize,
    },

    /// A payload pointer handed to `deallocate` is not chunk-aligned.
    #[error("payload pointer {addr:#x} is not aligned to the chunk alignment")]
    MisalignedPointer {
        /// The offending address.
        addr: usize,
    },

    /// The chunk behind a freed pointer is not marked allocated.
    #[error("chunk at {addr:#x} is not allocated (double free?)")]
    NotAllocated {
        /// Address of the chunk header.
        addr: usize,
    },

    /// The region cannot grow enough to satisfy an allocation.
    #[error("out of shared memory: cannot grow region past {limit} bytes")]
    OutOfMemory {
        /// The growth limit that was hit.
        limit: usize,
    },

    /// Remapping at the canonical base recorded by the master failed.
    #[error("cannot remap shared region at canonical base {canonical:#x}: {errno}")]
    CanonicalRemap {
        /// The base address every process must map at.
        canonical: usize,
        /// The errno reported by the fixed remap.
        #[source]
        errno: rustix::io::Errno,
    },

    /// A fixed remap succeeded but landed away from the canonical base.
    #[error("shared region mapped at {actual:#x} instead of canonical base {canonical:#x}")]
    BaseMismatch {
        /// The base address every process must map at.
        canonical: usize,
        /// Where the mapping actually landed.
        actual: usize,
    },

    /// The audit walk found allocator metadata violating an invariant.
    #[error("heap metadata corrupted: {0}")]
    Corrupted(String),
}

impl Error {
    /// Wrap a failed system call with its name.
    pub(crate) fn os(op: &'static str, errno: rustix::io::Errno) -> Self {
        Self::Os { op, errno }
    }
}
