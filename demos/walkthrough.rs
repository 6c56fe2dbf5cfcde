//! Drives a heap backed by `mmap`, printing the free list as it goes.
//!
//! Run with `RUST_LOG=trace` to see every split and merge.

use first_fit_alloc::{Heap, LibcHeapGrower};

fn main() {
    env_logger::init();

    let mut heap = Heap::init(LibcHeapGrower::default()).expect("mmap failed");
    println!("init:     {}", heap.free_list());

    let p1 = heap.acquire(32).unwrap();
    let p2 = heap.acquire(64).unwrap();
    println!("acquired: {:p} {:p}", p1, p2);
    println!("          {}", heap.free_list());

    heap.release(p1).unwrap();
    println!("released: {}", heap.free_list());
    println!("check:    {:?}", heap.check_consistency());

    let p3 = heap.acquire(16).unwrap();
    println!("acquired: {:p}", p3);

    // Too big for the first page: the heap grows
    let big = heap.acquire(64 * 1024).unwrap();
    println!(
        "acquired: {:p} after {} mmap calls",
        big,
        heap.grower().growths()
    );

    for ptr in [p2, p3, big] {
        heap.release(ptr).unwrap();
    }
    if let Err(err) = heap.release(p2) {
        println!("rejected: {}", err);
    }

    let usage = heap.check_layout().expect("heap is consistent");
    println!("usage:    {:?}", usage);
    for block in heap.blocks() {
        let state = if block.allocated { "allocated" } else { "free" };
        println!("  {:#x} {:>6} {}", block.addr, block.size, state);
    }
}
