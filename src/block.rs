//! Block metadata.
//!
//! Every block, allocated or free, starts with a [`HEADER_SIZE`]-byte header
//! followed by its payload. The header packs the payload size and the
//! allocation flag into a single word: sizes are always multiples of
//! [`ALIGNMENT`], so the low bits of the size are free to carry flags.
//!
//! ```text
//! ┌──────────────────────────────────────┬──────────────────────────┐
//! │ Header (16 bytes)                    │ Payload (size bytes)     │
//! │ ┌────────────────────┬─────────────┐ │                          │
//! │ │ size | allocated   │ next (free) │ │                          │
//! │ └────────────────────┴─────────────┘ │                          │
//! └──────────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! The `next` link is only meaningful while the block sits on the free list.

use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Alignment of every header and payload, and the granularity of every block
/// size.
pub const ALIGNMENT: usize = 16;

/// Space taken by the header in front of each payload.
pub const HEADER_SIZE: usize = 16;

/// A free block is only split if the free remainder left behind would be
/// larger than this.
pub const MIN_FREE_SIZE: usize = 5 * ALIGNMENT;

const ALLOCATED: usize = 0x1;
const FLAG_MASK: usize = ALIGNMENT - 1;

/// Round `size` up to the next multiple of [`ALIGNMENT`], or `None` if that
/// would overflow.
pub const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(FLAG_MASK) {
        Some(padded) => Some(padded & !FLAG_MASK),
        None => None,
    }
}

/// Pack a size and allocation flag into a metadata word.
///
/// Panics if `size` is not a multiple of [`ALIGNMENT`].
pub const fn encode(size: usize, allocated: bool) -> usize {
    assert!(size & FLAG_MASK == 0, "block sizes must be aligned");
    size | (allocated as usize)
}

/// The size stored in a metadata word.
pub const fn decode_size(metadata: usize) -> usize {
    metadata & !FLAG_MASK
}

/// The allocation flag stored in a metadata word.
pub const fn decode_allocated(metadata: usize) -> bool {
    metadata & ALLOCATED != 0
}

/// The in-memory header of a block.
#[repr(C, align(16))]
pub(crate) struct Header {
    metadata: usize,
    next: Option<Block>,
}

const_assert!(core::mem::size_of::<Header>() == HEADER_SIZE);
const_assert!(core::mem::align_of::<Header>() == ALIGNMENT);
const_assert!(HEADER_SIZE % ALIGNMENT == 0);

/// A handle to a block header somewhere in a heap region.
///
/// Handles are ordered by header address, which is the order the free list
/// keeps. A `Block` is only ever created for a header that the owning heap
/// has formatted, and it must not outlive that heap.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Block {
    header: NonNull<Header>,
}

/// How two blocks sit relative to each other in memory.
pub(crate) enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl Block {
    /// Write a fresh header at `ptr` with an empty `next` link.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `HEADER_SIZE + size` bytes owned by the
    /// heap and not in use by any caller.
    pub unsafe fn format(ptr: NonNull<u8>, size: usize, allocated: bool) -> Block {
        assert!(
            ptr.as_ptr() as usize % ALIGNMENT == 0,
            "block header at {:p} is not aligned",
            ptr
        );
        let header: NonNull<Header> = ptr.cast();
        header.as_ptr().write(Header {
            metadata: encode(size, allocated),
            next: None,
        });
        Block { header }
    }

    /// Interpret an existing header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a header previously written by [`Block::format`].
    pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Block {
        Block { header: ptr.cast() }
    }

    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    pub fn addr(self) -> usize {
        self.as_ptr() as usize
    }

    /// The raw metadata word.
    pub fn metadata(self) -> usize {
        self.header().metadata
    }

    pub fn size(self) -> usize {
        decode_size(self.metadata())
    }

    pub fn is_allocated(self) -> bool {
        decode_allocated(self.metadata())
    }

    pub fn next(self) -> Option<Block> {
        self.header().next
    }

    /// Where the caller's bytes begin.
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.as_ptr().add(HEADER_SIZE)) }
    }

    /// One past the last payload byte, which is where the next block in the
    /// same region begins.
    pub fn end_ptr(self) -> *mut u8 {
        self.as_ptr()
            .wrapping_add(HEADER_SIZE.saturating_add(self.size()))
    }

    pub fn end(self) -> usize {
        self.addr()
            .saturating_add(HEADER_SIZE)
            .saturating_add(self.size())
    }

    pub fn relation(self, other: Block) -> Relation {
        if self.end() < other.addr() {
            Relation::Before
        } else if self.end() == other.addr() {
            Relation::AdjacentBefore
        } else if self.addr() < other.end() {
            Relation::Overlapping
        } else if self.addr() == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    pub fn info(self) -> BlockInfo {
        BlockInfo {
            addr: self.addr(),
            size: self.size(),
            allocated: self.is_allocated(),
        }
    }

    /// Change the recorded size, keeping the allocation flag.
    ///
    /// # Safety
    ///
    /// The new size must describe the bytes up to the next block header (or
    /// region end), or the heap's tiling is lost.
    pub unsafe fn set_size(self, size: usize) {
        let allocated = self.is_allocated();
        (*self.header.as_ptr()).metadata = encode(size, allocated);
    }

    /// # Safety
    ///
    /// The block must be kept on or off the free list to match.
    pub unsafe fn set_allocated(self, allocated: bool) {
        let size = self.size();
        (*self.header.as_ptr()).metadata = encode(size, allocated);
    }

    /// # Safety
    ///
    /// Only the free list may relink blocks.
    pub unsafe fn set_next(self, next: Option<Block>) {
        (*self.header.as_ptr()).next = next;
    }

    /// Whether splitting `size` bytes off this block leaves a free remainder
    /// worth keeping.
    pub fn can_split(self, size: usize) -> bool {
        self.size() > size + HEADER_SIZE + MIN_FREE_SIZE
    }

    /// Carve an allocated block of exactly `size` payload bytes off the end
    /// of this free block, shrinking this one to the remainder.
    ///
    /// Panics if the remainder would be no larger than [`MIN_FREE_SIZE`].
    ///
    /// # Safety
    ///
    /// This block must be free and exclusively owned by the heap.
    pub unsafe fn split_off(self, size: usize) -> Block {
        if !self.can_split(size) {
            panic!(
                "Can't split {} bytes off a block of size {} - need {} for header and remainder",
                size,
                self.size(),
                HEADER_SIZE + MIN_FREE_SIZE,
            )
        }

        let remainder = self.size() - size - HEADER_SIZE;
        self.set_size(remainder);
        let tail = NonNull::new_unchecked(self.end_ptr());
        let split = Block::format(tail, size, true);
        log::trace!(
            "Split {:#x}: {} bytes stay free, {} bytes allocated at {:#x}",
            self.addr(),
            remainder,
            size,
            split.addr(),
        );
        split
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:#x}, {}, {})",
            self.addr(),
            self.size(),
            if self.is_allocated() { "allocated" } else { "free" },
        )
    }
}

/// A snapshot of one block, as reported by heap walks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the header.
    pub addr: usize,
    /// Payload bytes.
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Address of the first payload byte.
    pub fn payload(&self) -> usize {
        self.addr + HEADER_SIZE
    }

    /// One past the last payload byte.
    pub fn end(&self) -> usize {
        self.addr + HEADER_SIZE + self.size
    }
}
