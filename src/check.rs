//! Heap consistency checks.
//!
//! [`check_free_list`] is the cheap one: a single pass over the free list. The
//! layout check additionally walks every block of every region.

use crate::block::{Block, BlockInfo, Relation, ALIGNMENT, HEADER_SIZE};
use crate::blocklist::FreeList;
use crate::error::Inconsistency;
use crate::region::RegionList;

/// Free list statistics gathered by a successful check.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Free payload bytes.
    pub size: usize,
    /// Number of free blocks directly followed by another free block. These
    /// are legal, but coalescing should keep this at 0.
    pub adjacent: usize,
}

/// A census of every block in the heap.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub regions: usize,
    /// Bytes obtained from the grower.
    pub heap_bytes: usize,
    pub allocated_blocks: usize,
    /// Payload bytes of allocated blocks.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
}

impl Usage {
    pub(crate) fn record(&mut self, block: BlockInfo) {
        if block.allocated {
            self.allocated_blocks += 1;
            self.allocated_bytes += block.size;
        } else {
            self.free_blocks += 1;
            self.free_bytes += block.size;
        }
    }

    /// Bytes spent on region records and block headers.
    pub fn overhead(&self) -> usize {
        HEADER_SIZE * (self.regions + self.allocated_blocks + self.free_blocks)
    }

    /// Payload bytes plus overhead. Equal to `heap_bytes` in a consistent
    /// heap.
    pub fn accounted(&self) -> usize {
        self.allocated_bytes + self.free_bytes + self.overhead()
    }
}

/// Walk the free list and verify that every block is free and aligned, and
/// that blocks are in strictly ascending address order without overlap.
///
/// The list is read only; the walk stops at the first violation, before
/// following any link out of a misaligned block.
pub fn check_free_list(list: &FreeList) -> Result<Stats, Inconsistency> {
    let mut stats = Stats::default();

    let mut current = list.first();
    let mut previous: Option<Block> = None;
    while let Some(cur) = current {
        if cur.addr() % ALIGNMENT != 0 {
            return Err(Inconsistency::MisalignedHeader { block: cur.addr() });
        }
        if cur.is_allocated() {
            return Err(Inconsistency::AllocatedInFreeList { block: cur.addr() });
        }
        if cur.metadata() % ALIGNMENT != 0 {
            return Err(Inconsistency::MisalignedSize {
                block: cur.addr(),
                metadata: cur.metadata(),
            });
        }

        if let Some(prev) = previous {
            if prev >= cur {
                return Err(Inconsistency::OutOfOrder {
                    prev: prev.addr(),
                    cur: cur.addr(),
                });
            }
            match prev.relation(cur) {
                Relation::Before => {}
                Relation::AdjacentBefore => {
                    // Right order, but these should have been merged.
                    stats.adjacent += 1;
                }
                Relation::Overlapping => {
                    return Err(Inconsistency::Overlap {
                        prev: prev.addr(),
                        prev_end: prev.end(),
                        cur: cur.addr(),
                    });
                }
                Relation::AdjacentAfter | Relation::After => {
                    unreachable!("{:?} sorts below {:?}", prev, cur)
                }
            }
        }

        stats.length += 1;
        stats.size += cur.size();
        previous = Some(cur);
        current = cur.next();
    }

    Ok(stats)
}

/// Check the free list, then walk every region and verify that its blocks
/// tile it exactly and that the free list holds every free block.
pub(crate) fn check_layout(regions: &RegionList, list: &FreeList) -> Result<Usage, Inconsistency> {
    let stats = check_free_list(list)?;
    let mut usage = Usage::default();

    for region in regions.iter() {
        usage.regions += 1;
        usage.heap_bytes += region.len();

        let mut reached = region.first_block();
        for block in region.blocks() {
            reached = block.end();
            if reached > region.end() {
                break;
            }
            usage.record(block.info());
        }

        if reached != region.end() {
            return Err(Inconsistency::BrokenTiling {
                region: region.start(),
                reached,
                end: region.end(),
            });
        }
    }

    if stats.length != usage.free_blocks {
        return Err(Inconsistency::FreeCountMismatch {
            listed: stats.length,
            marked: usage.free_blocks,
        });
    }

    Ok(usage)
}
