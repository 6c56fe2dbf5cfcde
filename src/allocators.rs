//! The allocator itself.
//!
//! ## [`Heap`](struct.Heap.html)
//!
//! A `Heap` is a single-threaded heap and freed memory manager. It owns a
//! [`HeapGrower`] to obtain memory, the chain of regions that memory was
//! formatted into, and the free list. Everything else lives in the block
//! headers inside those regions.
//!
//! Allocation is first fit over the address-ordered free list. A block that
//! is big enough to leave a useful remainder is split, with the caller getting
//! the tail end and the head staying on the free list; otherwise the caller
//! gets the whole block. Releasing a block puts it back in address order and
//! merges it with free neighbours.
//!
//! Memory is never returned to the grower.

use core::ptr::NonNull;

use log::{debug, trace, warn};

use crate::block::{align_up, Block, BlockInfo, ALIGNMENT, HEADER_SIZE};
use crate::blocklist::FreeList;
use crate::check::{self, Stats, Usage};
use crate::error::{AllocError, Inconsistency};
use crate::grower::{round_up, HeapGrower};
use crate::region::{Region, RegionList, REGION_OVERHEAD};

/// When the free list can't satisfy a request, the heap grows by at least this
/// many pages at once.
pub const GROWTH_PAGES: usize = 15;

/// A first-fit heap over memory obtained from `G`.
pub struct Heap<G> {
    grower: G,
    regions: RegionList,
    free: FreeList,
}

impl<G: HeapGrower> Heap<G> {
    /// Create a heap, starting it with a single page from `grower` formatted
    /// as one free block.
    pub fn init(grower: G) -> Result<Self, AllocError> {
        let mut heap = Heap {
            grower,
            regions: RegionList::new(),
            free: FreeList::new(),
        };

        let page_size = heap.grower.page_size();
        let block = heap.extend(page_size)?;
        debug!(
            "Initialised heap with a {}-byte free block at {:#x}",
            block.size(),
            block.addr()
        );

        Ok(heap)
    }

    /// The grower this heap obtains memory from.
    pub fn grower(&self) -> &G {
        &self.grower
    }

    /// The current free list.
    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// Verify the free list: every entry free and aligned, in strictly
    /// ascending address order, none overlapping the next.
    pub fn check_consistency(&self) -> Result<Stats, Inconsistency> {
        check::check_free_list(&self.free)
    }

    /// [`check_consistency`](Self::check_consistency), plus a walk over every
    /// block in the heap to verify that blocks tile each region exactly and
    /// that every free block is on the free list.
    pub fn check_layout(&self) -> Result<Usage, Inconsistency> {
        check::check_layout(&self.regions, &self.free)
    }

    /// Every block in the heap, allocated or free, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.regions
            .iter()
            .flat_map(Region::blocks)
            .map(Block::info)
    }

    /// Tally every block in the heap.
    pub fn usage(&self) -> Usage {
        let mut usage = Usage::default();
        for region in self.regions.iter() {
            usage.regions += 1;
            usage.heap_bytes += region.len();
        }
        for block in self.blocks() {
            usage.record(block);
        }
        usage
    }

    /// Usable bytes at `ptr`, if it is an allocation of this heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.allocated_block(ptr).map(Block::size)
    }

    /// Obtain `len` more bytes from the grower and put them on the free list
    /// as one block, merged with any free block they directly follow.
    ///
    /// Memory starting at the end of an existing region extends that region
    /// and costs one block header; anything else becomes a new region.
    ///
    /// Nothing is changed unless the grower succeeds.
    fn extend(&mut self, len: usize) -> Result<Block, AllocError> {
        let (ptr, got) = match unsafe { self.grower.grow_heap(len) } {
            Ok(res) => res,
            Err(err) => {
                warn!("Could not grow heap by {} bytes: {:?}", len, err);
                return Err(AllocError::OutOfMemory { requested: len });
            }
        };

        // Whole quanta only; a ragged tail is left unused.
        let got = got / ALIGNMENT * ALIGNMENT;
        if got < len || got < REGION_OVERHEAD || ptr.as_ptr() as usize % ALIGNMENT != 0 {
            warn!(
                "Grower returned an unusable region {:p}:{} for a {}-byte request",
                ptr, got, len
            );
            return Err(AllocError::OutOfMemory { requested: len });
        }

        let block = match self.regions.ending_at(ptr.as_ptr() as usize) {
            Some(region) => {
                debug!("Extending region at {:#x} by {} bytes", region.start(), got);
                unsafe { region.append(ptr, got) }
            }
            None => {
                let (region, block) = unsafe { Region::format(ptr, got) };
                debug!("New {}-byte region at {:#x}", got, region.start());
                unsafe { self.regions.insert(region) };
                block
            }
        };

        // Merges with a free block at the end of the region it extends
        let block = unsafe {
            self.free.insert(block);
            self.free.coalesce(block)
        };
        debug!("Grew heap by {} bytes: {:?}", got, block);

        Ok(block)
    }

    /// How much to ask the grower for to serve an aligned request of `size`.
    fn growth_size(&self, size: usize) -> Option<usize> {
        let page_size = self.grower.page_size();
        let needed = round_up(size.checked_add(REGION_OVERHEAD)?, page_size)?;
        Some(needed.max(GROWTH_PAGES * page_size))
    }

    /// Allocate at least `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// The heap grows if no free block is big enough. The returned memory
    /// stays valid until passed to [`release`](Self::release).
    pub fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let needed = align_up(size).ok_or(AllocError::OutOfMemory { requested: size })?;
        trace!("acquire({}): looking for {} bytes", size, needed);

        let found = match self.free.find(needed) {
            Some(block) => block,
            None => {
                let len = self
                    .growth_size(needed)
                    .ok_or(AllocError::OutOfMemory { requested: size })?;
                self.extend(len)?
            }
        };

        let block = unsafe { self.free.coalesce(found) };
        let allocated = if block.can_split(needed) {
            unsafe { block.split_off(needed) }
        } else {
            trace!("acquire({}): using all of {:?}", size, block);
            unsafe {
                let removed = self.free.remove(block);
                debug_assert!(removed, "{:?} came from the free list", block);
                block.set_allocated(true);
            }
            block
        };

        Ok(allocated.payload())
    }

    /// Return an allocation to the heap.
    ///
    /// `ptr` must have come from [`acquire`](Self::acquire) on this heap and
    /// not have been released since; anything else is rejected with
    /// [`AllocError::InvalidRelease`] and leaves the heap untouched. The
    /// caller must not use the memory afterwards.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let block = match self.allocated_block(ptr) {
            Some(block) => block,
            None => {
                warn!("Rejecting release of {:p}", ptr);
                return Err(AllocError::InvalidRelease {
                    addr: ptr.as_ptr() as usize,
                });
            }
        };

        unsafe {
            block.set_allocated(false);
            self.free.insert(block);
            let merged = self.free.coalesce(block);
            trace!("release({:p}): now part of {:?}", ptr, merged);
        }

        Ok(())
    }

    /// The allocated block whose payload starts at `ptr`.
    ///
    /// Only headers found by walking the owning region are trusted, so an
    /// arbitrary pointer is never dereferenced.
    fn allocated_block(&self, ptr: NonNull<u8>) -> Option<Block> {
        let addr = (ptr.as_ptr() as usize).checked_sub(HEADER_SIZE)?;
        if addr % ALIGNMENT != 0 {
            return None;
        }

        let region = self.regions.find(addr)?;
        region
            .blocks()
            .take_while(|block| block.addr() <= addr)
            .find(|block| block.addr() == addr)
            .filter(|block| block.is_allocated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::block::MIN_FREE_SIZE;
    use crate::grower::ToyHeap;

    use test_log::test;

    const PAGE: usize = 4096;

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_init() {
        let mut buf = vec![0u8; 32 * PAGE];
        let heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();

        assert_eq!(heap.grower().size(), PAGE);
        let free: Vec<_> = heap.free_list().iter().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].addr, heap.grower().base() + HEADER_SIZE);
        assert_eq!(free[0].size, PAGE - REGION_OVERHEAD);
        assert!(heap.check_layout().is_ok());
    }

    #[test]
    fn test_init_fails_without_memory() {
        let mut buf = vec![0u8; PAGE - 1];
        let res = Heap::init(ToyHeap::new(&mut buf, PAGE));
        assert!(matches!(res, Err(AllocError::OutOfMemory { .. })));
    }

    #[test]
    fn test_basic() {
        let mut buf = vec![0u8; 64 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();
        let base = heap.grower().base();
        let region_end = base + PAGE;

        ////////////////////////////////////////////////////////////
        // Allocation

        // Each allocation is split off the end of the initial block, so they
        // are handed out top down.
        let p64 = heap.acquire(64).unwrap();
        assert_eq!(addr(p64), region_end - 64);
        let p50 = heap.acquire(50).unwrap();
        assert_eq!(addr(p50), addr(p64) - HEADER_SIZE - 64);
        assert_eq!(heap.usable_size(p50), Some(64));
        let p224 = heap.acquire(224).unwrap();
        assert_eq!(addr(p224), addr(p50) - HEADER_SIZE - 224);
        heap.check_layout().unwrap();

        let first = heap.free_list().iter().next().unwrap();
        assert_eq!(
            first.size,
            PAGE - REGION_OVERHEAD - (64 + 64 + 224) - 3 * HEADER_SIZE
        );
        log::info!("post-alloc: {}", heap.free_list());

        ////////////////////////////////////////////////////////////
        // Deallocation

        // Not adjacent to any free block: the list grows
        heap.release(p50).unwrap();
        let stats = heap.check_consistency().unwrap();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.adjacent, 0);
        log::info!("dealloc: {}", heap.free_list());

        // First fit: the big block comes before the hole p50 left
        let p48 = heap.acquire(48).unwrap();
        assert_eq!(addr(p48), addr(p224) - HEADER_SIZE - 48);
        assert_eq!(heap.usable_size(p48), Some(48));
        assert_eq!(heap.check_consistency().unwrap().length, 2);

        // Releasing everything merges back into a single block
        heap.release(p64).unwrap();
        heap.release(p224).unwrap();
        heap.release(p48).unwrap();
        let free: Vec<_> = heap.free_list().iter().collect();
        log::info!("done: {}", heap.free_list());
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, PAGE - REGION_OVERHEAD);
        assert_eq!(heap.grower().growths(), 1);
    }

    #[test]
    fn test_whole_block_when_remainder_too_small() {
        let mut buf = vec![0u8; 64 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();
        let initial = PAGE - REGION_OVERHEAD;

        // Leaves exactly MIN_FREE_SIZE behind: no split
        let size = initial - HEADER_SIZE - MIN_FREE_SIZE;
        let ptr = heap.acquire(size).unwrap();
        assert_eq!(addr(ptr), heap.grower().base() + REGION_OVERHEAD);
        assert_eq!(heap.usable_size(ptr), Some(initial));
        assert!(heap.free_list().is_empty());
        heap.check_layout().unwrap();
    }

    #[test]
    fn test_growth() {
        let mut buf = vec![0u8; 64 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();

        let big = heap.acquire(2 * PAGE).unwrap();
        assert_eq!(heap.grower().growths(), 2);
        assert_eq!(heap.grower().size(), PAGE + GROWTH_PAGES * PAGE);
        assert!(addr(big) > heap.grower().base() + PAGE);

        // Bigger than the growth policy's minimum
        let huge = heap.acquire(20 * PAGE).unwrap();
        assert_eq!(heap.usable_size(huge), Some(20 * PAGE));
        assert_eq!(heap.grower().size(), PAGE + GROWTH_PAGES * PAGE + 21 * PAGE);

        // The toy heap grows contiguously, so it all stays one region
        let usage = heap.check_layout().unwrap();
        assert_eq!(usage.regions, 1);
        assert_eq!(usage.heap_bytes, heap.grower().size());
        assert_eq!(usage.allocated_blocks, 2);
        assert_eq!(usage.accounted(), usage.heap_bytes);
    }

    #[test]
    fn test_contiguous_growth_merges() {
        let mut buf = vec![0u8; 64 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();
        let base = heap.grower().base();

        // Take the whole initial block so the growth is seen on its own
        let first = heap.acquire(PAGE - REGION_OVERHEAD).unwrap();
        assert!(heap.free_list().is_empty());

        let small = heap.acquire(100).unwrap();
        assert_eq!(heap.grower().growths(), 2);
        let free: Vec<_> = heap.free_list().iter().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].addr, base + PAGE);
        // One header for the new memory, and one for the split-off block
        assert_eq!(
            free[0].size,
            GROWTH_PAGES * PAGE - HEADER_SIZE - (112 + HEADER_SIZE)
        );

        // Everything released merges across the old region end
        heap.release(first).unwrap();
        heap.release(small).unwrap();
        let free: Vec<_> = heap.free_list().iter().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, (GROWTH_PAGES + 1) * PAGE - REGION_OVERHEAD);

        let usage = heap.check_layout().unwrap();
        assert_eq!(usage.regions, 1);
        assert_eq!(usage.accounted(), usage.heap_bytes);
    }

    #[test]
    fn test_merged_growth_is_reused() {
        let mut buf = vec![0u8; 64 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();

        let big = heap.acquire(2 * PAGE).unwrap();
        heap.release(big).unwrap();
        assert_eq!(heap.free_list().len(), 1);

        // Fits only in the initial page and the growth taken together
        let span = (GROWTH_PAGES + 1) * PAGE - REGION_OVERHEAD;
        let all = heap.acquire(span - 2 * ALIGNMENT).unwrap();
        assert_eq!(heap.usable_size(all), Some(span));
        assert_eq!(heap.grower().growths(), 2);
        assert!(heap.free_list().is_empty());
        heap.check_layout().unwrap();
    }

    #[test]
    fn test_zero_and_overflowing_sizes() {
        let mut buf = vec![0u8; 32 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();

        assert_eq!(heap.acquire(0), Err(AllocError::ZeroSize));
        assert_eq!(
            heap.acquire(usize::MAX),
            Err(AllocError::OutOfMemory {
                requested: usize::MAX
            })
        );
        assert!(matches!(
            heap.acquire(usize::MAX - 4 * PAGE),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert_eq!(heap.grower().growths(), 1);
        heap.check_layout().unwrap();
    }

    #[test]
    fn test_invalid_release() {
        let mut buf = vec![0u8; 32 * PAGE];
        let mut heap = Heap::init(ToyHeap::new(&mut buf, PAGE)).unwrap();
        let ptr = heap.acquire(128).unwrap();
        let before: Vec<_> = heap.blocks().collect();

        let inside = NonNull::new(ptr.as_ptr().wrapping_add(32)).unwrap();
        let unaligned = NonNull::new(ptr.as_ptr().wrapping_add(1)).unwrap();
        let mut elsewhere = [0u8; 64];
        let foreign = NonNull::new(elsewhere.as_mut_ptr().wrapping_add(HEADER_SIZE)).unwrap();

        for bad in [inside, unaligned, foreign] {
            assert_eq!(
                heap.release(bad),
                Err(AllocError::InvalidRelease { addr: addr(bad) })
            );
        }

        // The free block's payload is not an allocation either
        let free = heap.free_list().iter().next().unwrap();
        let free_payload = NonNull::new(free.payload() as *mut u8).unwrap();
        assert!(heap.release(free_payload).is_err());

        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);

        heap.release(ptr).unwrap();
        // Double free
        assert_eq!(
            heap.release(ptr),
            Err(AllocError::InvalidRelease { addr: addr(ptr) })
        );
        heap.check_layout().unwrap();
    }
}
