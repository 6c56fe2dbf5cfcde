use core::fmt;
use core::marker::PhantomData;

use crate::block::{Block, BlockInfo, HEADER_SIZE};

/// A `FreeList` is a singly linked list of the free blocks in a heap.
///
/// The links live inside the free blocks' own headers, so the list itself is
/// nothing but a head pointer. It does not own any memory; it is purely an
/// index into the heap's regions.
///
/// It maintains a few internal invariants:
///
/// - Each block should link to the next, with the last one linking to `None`.
/// - Each block should have an address < next.
/// - Every block on the list is marked free, and every free block is on the
///   list.
///
/// Adjacent blocks are merged by [`coalesce`](FreeList::coalesce), which the
/// heap calls after every insertion.
///
/// Only a [`Heap`](crate::Heap) builds one; outside code gets a shared
/// reference from [`Heap::free_list`](crate::Heap::free_list).
///
/// ```compile_fail
/// let list = first_fit_alloc::FreeList::new();
/// ```
pub struct FreeList {
    first: Option<Block>,
}

/// Iterator over the blocks of a [`FreeList`], in address order.
pub(crate) struct Blocks<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list FreeList>,
}

impl<'list> Iterator for Blocks<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

/// Public view of a [`FreeList`], yielding a snapshot of each block.
pub struct FreeListIter<'list> {
    blocks: Blocks<'list>,
}

impl<'list> Iterator for FreeListIter<'list> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.blocks.next().map(Block::info)
    }
}

impl<'list> IntoIterator for &'list FreeList {
    type Item = BlockInfo;
    type IntoIter = FreeListIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeBlock({:#x}, {})", block.addr, block.size)?;
        }

        write!(f, ")")
    }
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { first: None }
    }

    pub fn iter(&self) -> FreeListIter<'_> {
        FreeListIter {
            blocks: self.blocks(),
        }
    }

    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            next: self.first,
            _list: PhantomData,
        }
    }

    pub(crate) fn first(&self) -> Option<Block> {
        self.first
    }

    pub fn len(&self) -> usize {
        self.blocks().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// First fit: the first block, in address order, with at least `size`
    /// payload bytes.
    pub(crate) fn find(&self, size: usize) -> Option<Block> {
        self.blocks().find(|block| block.size() >= size)
    }

    /// The last block on the list with an address below `block`'s.
    ///
    /// This is a linear scan from the head; there are no back-links.
    pub(crate) fn predecessor(&self, block: Block) -> Option<Block> {
        let mut previous = None;
        for candidate in self.blocks() {
            if candidate >= block {
                break;
            }
            previous = Some(candidate);
        }
        previous
    }

    /// Link `block` in at its address-sorted position.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of this heap that is not already on the
    /// list, and must not overlap any block on it.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        match self.predecessor(block) {
            None => {
                // Before the current head, or the list is empty
                block.set_next(self.first);
                self.first = Some(block);
            }
            Some(previous) => {
                block.set_next(previous.next());
                previous.set_next(Some(block));
            }
        }
    }

    /// Unlink `block`, returning whether it was on the list.
    ///
    /// The removed block's `next` is cleared.
    ///
    /// # Safety
    ///
    /// `block` must be a block of this heap.
    pub(crate) unsafe fn remove(&mut self, block: Block) -> bool {
        if self.first == Some(block) {
            self.first = block.next();
            block.set_next(None);
            return true;
        }

        match self.predecessor(block) {
            Some(previous) if previous.next() == Some(block) => {
                previous.set_next(block.next());
                block.set_next(None);
                true
            }
            _ => false,
        }
    }

    /// Merge `block` with its list neighbours, if they sit directly next to it
    /// in memory, and return the block that now covers it.
    ///
    /// Each merge reclaims the absorbed block's header as payload.
    ///
    /// # Safety
    ///
    /// `block` must be on this list.
    pub(crate) unsafe fn coalesce(&mut self, block: Block) -> Block {
        let mut merged = block;

        if let Some(previous) = self.predecessor(block) {
            if previous.end() == block.addr() {
                log::trace!("Merging {:?} into preceding {:?}", block, previous);
                previous.set_size(previous.size() + HEADER_SIZE + block.size());
                previous.set_next(block.next());
                merged = previous;
            }
        }

        if let Some(next) = merged.next() {
            if merged.end() == next.addr() {
                log::trace!("Merging following {:?} into {:?}", next, merged);
                merged.set_size(merged.size() + HEADER_SIZE + next.size());
                merged.set_next(next.next());
            }
        }

        merged
    }
}
