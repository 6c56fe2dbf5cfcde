#![cfg_attr(not(test), no_std)]

//! A first-fit memory allocator with an address-ordered free list.
//!
//! A [`Heap`] carves variable-sized allocations out of memory it obtains from
//! a [`HeapGrower`]. Each block carries a 16-byte header packing its size and
//! an allocation bit; free blocks are additionally linked, in address order,
//! through their headers. That free list is the only index the heap keeps.
//!
//! ```
//! use first_fit_alloc::{Heap, ToyHeap};
//!
//! let mut buf = vec![0u8; 128 * 1024];
//! let mut heap = Heap::init(ToyHeap::new(&mut buf, 4096)).unwrap();
//!
//! let p1 = heap.acquire(32).unwrap();
//! let _p2 = heap.acquire(64).unwrap();
//! heap.release(p1).unwrap();
//! assert!(heap.check_consistency().is_ok());
//! ```
//!
//! The heap is not thread-safe, and never returns memory to its grower.

pub mod allocators;
pub mod block;
pub mod blocklist;
pub mod check;
pub mod error;
pub mod grower;
mod region;

pub use crate::allocators::{Heap, GROWTH_PAGES};
pub use crate::block::{BlockInfo, ALIGNMENT, HEADER_SIZE, MIN_FREE_SIZE};
pub use crate::blocklist::FreeList;
pub use crate::check::{Stats, Usage};
pub use crate::error::{AllocError, Inconsistency};
#[cfg(feature = "use_libc")]
pub use crate::grower::LibcHeapGrower;
pub use crate::grower::{HeapGrower, ToyHeap, ToyHeapOverflowError};
pub use crate::region::REGION_OVERHEAD;
