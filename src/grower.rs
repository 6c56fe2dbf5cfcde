//! Sources of fresh memory for a [`Heap`](crate::Heap).
//!
//! ### [`HeapGrower`]
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls to
//! the OS to extend the heap.
//!
//! ### [`LibcHeapGrower`]
//!
//! Maps anonymous pages with `mmap`. Only available with the `use_libc`
//! feature.
//!
//! ### [`ToyHeap`]
//!
//! `ToyHeap` hands out pages of a borrowed byte buffer, and can pretend to be a
//! heap with a hard size limit. It is mainly useful for testing.

use core::fmt;
use core::marker::PhantomData;
#[cfg(feature = "use_libc")]
use core::ptr::null_mut;
use core::ptr::NonNull;

#[cfg(feature = "use_libc")]
use errno::Errno;

use crate::block::ALIGNMENT;

// Round up value to the nearest multiple of increment, or None on overflow.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// The granularity of the memory this grower hands out. The heap
    /// initialises itself with exactly one page.
    fn page_size(&self) -> usize;

    /// Grow the heap by at least size. Returns a pointer and the size of the
    /// memory available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this crate:
    ///
    /// - On success the returned pointer is aligned to the page size and
    ///   points to at least `size` bytes that are available and untracked by
    ///   any other rust code, including the heap itself.
    /// - That memory must stay valid for as long as the heap using it.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;
}

/// LibcHeapGrower uses virtual memory to grow the heap upon request.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcHeapGrower {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl LibcHeapGrower {
    /// Pages mapped so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful `mmap` calls.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        let pagesize = self.page_size();
        let to_allocate = match round_up(size.max(1), pagesize) {
            Some(n) => n,
            None => return Err(Errno(libc::ENOMEM)),
        };

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file backs the mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => p,
            None => return Err(Errno(libc::ENOMEM)),
        };

        self.pages += to_allocate / pagesize;
        self.growths += 1;
        log::debug!("mmap'd {} bytes at {:p}", to_allocate, ptr);

        Ok((ptr, to_allocate))
    }
}

/// A fixed-size fake heap carved out of a borrowed buffer.
///
/// Pages are handed out front to back, so consecutive growths are adjacent
/// and ascending, as with `sbrk`.
pub struct ToyHeap<'a> {
    base: NonNull<u8>,
    capacity: usize,
    page_size: usize,
    size: usize,
    growths: usize,
    _buf: PhantomData<&'a mut [u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("toy heap overflow: {requested} bytes requested, {available} available")]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl<'a> ToyHeap<'a> {
    /// Use `buf` as backing memory, handing it out in pages of `page_size`
    /// bytes. The usable part of `buf` starts at its first page-aligned byte.
    ///
    /// Panics unless `page_size` is a power of two and a multiple of
    /// [`ALIGNMENT`].
    pub fn new(buf: &'a mut [u8], page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size % ALIGNMENT == 0,
            "page size {} must be a power of two multiple of {}",
            page_size,
            ALIGNMENT
        );
        let offset = buf.as_ptr().align_offset(page_size).min(buf.len());
        let capacity = (buf.len() - offset) / page_size * page_size;
        let base = unsafe { NonNull::new_unchecked(buf.as_mut_ptr().add(offset)) };

        ToyHeap {
            base,
            capacity,
            page_size,
            size: 0,
            growths: 0,
            _buf: PhantomData,
        }
    }

    /// Bytes handed out so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Usable bytes in the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of successful growths.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Address of the first byte handed out.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

impl<'a> HeapGrower for ToyHeap<'a> {
    type Err = ToyHeapOverflowError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        let available = self.capacity - self.size;
        let allocating = match round_up(size, self.page_size) {
            Some(n) if n <= available => n,
            _ => {
                return Err(ToyHeapOverflowError {
                    requested: size,
                    available,
                })
            }
        };

        let ptr = NonNull::new_unchecked(self.base.as_ptr().add(self.size));
        self.size += allocating;
        self.growths += 1;
        Ok((ptr, allocating))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 64), Some(0));
        assert_eq!(round_up(1, 64), Some(64));
        assert_eq!(round_up(64, 64), Some(64));
        assert_eq!(round_up(65, 64), Some(128));
        assert_eq!(round_up(usize::MAX, 64), None);
    }

    #[test]
    fn test_toy_heap_pages() {
        let mut buf = vec![0u8; 8 * 256 + 256];
        let mut toy = ToyHeap::new(&mut buf, 256);
        assert!(toy.capacity() >= 8 * 256);

        let (p1, n1) = unsafe { toy.grow_heap(10).unwrap() };
        let (p2, n2) = unsafe { toy.grow_heap(300).unwrap() };

        assert_eq!(n1, 256);
        assert_eq!(n2, 512);
        assert_eq!(p1.as_ptr() as usize % 256, 0);
        assert_eq!(p2.as_ptr() as usize, p1.as_ptr() as usize + n1);
        assert_eq!(toy.size(), 768);
        assert_eq!(toy.growths(), 2);
    }

    #[test]
    fn test_toy_heap_overflow() {
        let mut buf = vec![0u8; 4 * 256 + 256];
        let mut toy = ToyHeap::new(&mut buf, 256);
        let capacity = toy.capacity();

        let err = unsafe { toy.grow_heap(capacity + 1).unwrap_err() };
        assert_eq!(err.requested, capacity + 1);
        assert_eq!(err.available, capacity);
        // A failed growth hands out nothing
        assert_eq!(toy.size(), 0);
        assert_eq!(toy.growths(), 0);

        assert!(unsafe { toy.grow_heap(capacity) }.is_ok());
        assert!(unsafe { toy.grow_heap(1) }.is_err());
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn test_libc_grower() {
        let mut grower = LibcHeapGrower::default();
        let page = grower.page_size();
        let (ptr, len) = unsafe { grower.grow_heap(page + 1).unwrap() };

        assert_eq!(len, 2 * page);
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        assert_eq!(grower.pages(), 2);
        assert_eq!(grower.growths(), 1);

        // Fresh mappings are zeroed and writable
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            ptr.as_ptr().add(len - 1).write(0xAB);
        }
    }
}
