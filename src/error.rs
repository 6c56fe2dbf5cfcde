/// Why an [`acquire`](crate::Heap::acquire) or
/// [`release`](crate::Heap::release) failed.
///
/// A failed call leaves the heap exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// The grower could not supply `requested` more bytes.
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory { requested: usize },
    /// `addr` is not the payload of a block this heap currently has
    /// allocated. Covers double frees.
    #[error("invalid release of {addr:#x}: not an allocated block of this heap")]
    InvalidRelease { addr: usize },
}

/// A broken heap invariant, with the addresses of the blocks involved.
///
/// These are never repaired; they indicate corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    #[error("block {block:#x} is on the free list but marked allocated")]
    AllocatedInFreeList { block: usize },
    #[error("free list out of order: {prev:#x} is followed by {cur:#x}")]
    OutOfOrder { prev: usize, cur: usize },
    #[error("free blocks overlap: {prev:#x} runs to {prev_end:#x}, past {cur:#x}")]
    Overlap {
        prev: usize,
        prev_end: usize,
        cur: usize,
    },
    #[error("block header {block:#x} is misaligned")]
    MisalignedHeader { block: usize },
    #[error("block {block:#x} has stray low bits in its metadata {metadata:#x}")]
    MisalignedSize { block: usize, metadata: usize },
    /// Walking the blocks of the region at `region` did not land exactly on
    /// its end.
    #[error("blocks of region {region:#x} reach {reached:#x} instead of its end {end:#x}")]
    BrokenTiling {
        region: usize,
        reached: usize,
        end: usize,
    },
    #[error("{listed} blocks on the free list, but {marked} blocks marked free")]
    FreeCountMismatch { listed: usize, marked: usize },
}
