//! Heap regions.
//!
//! Every chunk of memory the heap obtains from its [`HeapGrower`] becomes a
//! region. A region starts with a small record linking it to the next region
//! (in address order), and the rest of it is tiled by blocks:
//!
//! ```text
//! ┌──────────────┬────────┬─────────┬────────┬─────────┬─────┐
//! │ RegionHeader │ Header │ Payload │ Header │ Payload │ ... │
//! └──────────────┴────────┴─────────┴────────┴─────────┴─────┘
//! ```
//!
//! Memory that starts exactly where a region ends is absorbed into that
//! region instead of getting a record of its own, so a contiguous grower
//! builds a single region. Blocks never cross a region boundary, so walking a
//! region from its first block to its end visits every block in it.
//!
//! [`HeapGrower`]: crate::grower::HeapGrower

use core::marker::PhantomData;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::block::{Block, ALIGNMENT, HEADER_SIZE};

#[repr(C, align(16))]
struct RegionHeader {
    next: Option<Region>,
    len: usize,
}

const_assert!(core::mem::size_of::<RegionHeader>() == HEADER_SIZE);

/// Bytes a region spends on bookkeeping before its first payload byte.
pub const REGION_OVERHEAD: usize = 2 * HEADER_SIZE;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Region {
    header: NonNull<RegionHeader>,
}

impl Region {
    /// Turn `len` fresh bytes at `ptr` into a region holding a single free
    /// block, and return both.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes of memory that nothing else uses, and
    /// that stay valid as long as the heap does.
    pub unsafe fn format(ptr: NonNull<u8>, len: usize) -> (Region, Block) {
        assert!(
            len >= REGION_OVERHEAD && len % ALIGNMENT == 0,
            "Can't make a region out of {} bytes",
            len
        );
        let header: NonNull<RegionHeader> = ptr.cast();
        header.as_ptr().write(RegionHeader { next: None, len });

        let first = NonNull::new_unchecked(ptr.as_ptr().add(HEADER_SIZE));
        let block = Block::format(first, len - REGION_OVERHEAD, false);
        (Region { header }, block)
    }

    /// Absorb `len` fresh bytes starting exactly at this region's end, as one
    /// free block with a single header, and return that block.
    ///
    /// # Safety
    ///
    /// As for [`Region::format`].
    pub unsafe fn append(self, ptr: NonNull<u8>, len: usize) -> Block {
        assert!(
            ptr.as_ptr() as usize == self.end() && len > HEADER_SIZE && len % ALIGNMENT == 0,
            "Can't append {} bytes at {:p} to a region ending at {:#x}",
            len,
            ptr,
            self.end()
        );
        (*self.header.as_ptr()).len += len;
        Block::format(ptr, len - HEADER_SIZE, false)
    }

    fn header(&self) -> &RegionHeader {
        unsafe { self.header.as_ref() }
    }

    fn as_ptr(self) -> *mut u8 {
        self.header.as_ptr().cast()
    }

    pub fn start(self) -> usize {
        self.as_ptr() as usize
    }

    pub fn len(self) -> usize {
        self.header().len
    }

    pub fn end(self) -> usize {
        self.start() + self.len()
    }

    pub fn next(self) -> Option<Region> {
        self.header().next
    }

    unsafe fn set_next(self, next: Option<Region>) {
        (*self.header.as_ptr()).next = next;
    }

    /// Whether `addr` falls within this region.
    pub fn contains(self, addr: usize) -> bool {
        self.start() <= addr && addr < self.end()
    }

    /// Address of the first block header.
    pub fn first_block(self) -> usize {
        self.start() + HEADER_SIZE
    }

    /// Walk every block in the region, in address order.
    ///
    /// The walk follows each header's size to find the next header, and stops
    /// once it reaches (or runs past) the end of the region.
    pub fn blocks(self) -> RegionBlocks {
        let start = self.as_ptr().wrapping_add(HEADER_SIZE);
        RegionBlocks {
            next: start,
            end: self.end(),
        }
    }
}

pub(crate) struct RegionBlocks {
    next: *mut u8,
    end: usize,
}

impl Iterator for RegionBlocks {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if (self.next as usize) >= self.end {
            return None;
        }
        let block = unsafe { Block::from_ptr(NonNull::new_unchecked(self.next)) };
        self.next = block.end_ptr();
        Some(block)
    }
}

/// The chain of regions, kept in address order.
pub(crate) struct RegionList {
    first: Option<Region>,
}

pub(crate) struct Regions<'list> {
    next: Option<Region>,
    _list: PhantomData<&'list RegionList>,
}

impl<'list> Iterator for Regions<'list> {
    type Item = Region;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.next.take()?;
        self.next = region.next();
        Some(region)
    }
}

impl RegionList {
    pub const fn new() -> Self {
        RegionList { first: None }
    }

    pub fn iter(&self) -> Regions<'_> {
        Regions {
            next: self.first,
            _list: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `region` must not overlap any region already on the list.
    pub unsafe fn insert(&mut self, region: Region) {
        let mut previous = None;
        for candidate in self.iter() {
            if candidate > region {
                break;
            }
            previous = Some(candidate);
        }

        match previous {
            None => {
                region.set_next(self.first);
                self.first = Some(region);
            }
            Some(previous) => {
                region.set_next(previous.next());
                previous.set_next(Some(region));
            }
        }
    }

    /// The region whose last byte sits just below `addr`, if any.
    pub fn ending_at(&self, addr: usize) -> Option<Region> {
        self.iter()
            .take_while(|region| region.start() < addr)
            .find(|region| region.end() == addr)
    }

    /// The region containing `addr`, if any.
    pub fn find(&self, addr: usize) -> Option<Region> {
        self.iter()
            .take_while(|region| region.start() <= addr)
            .find(|region| region.contains(addr))
    }
}
