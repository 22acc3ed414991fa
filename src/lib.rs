//! # Memory Block Allocation
//!
//! A fixed-arena memory management library for applications that need to
//! run forever without memory allocation problems.
//!
//! - All memory is acquired from the host on initialization
//! - Allocating and freeing blocks never calls back into the host
//! - Fragmentation is limited: every block is rounded up to a multiple of
//!   the smallest block size of its space
//! - Small overhead per memory block (4 bits)
//!
//! Memory is acquired with [`init`], then [`allocate`] and [`deallocate`]
//! hand out and recover blocks until [`term`] returns the arena to the
//! host. Allocation is broken into two spaces with the following block
//! sizes in bytes:
//!
//! ```text
//! small blocks :  16,  32,  48,   64,   80,   96,  112,  128
//! big blocks   : 256, 512, 768, 1024, 1280, 1536, 1792, 2048
//! ```
//!
//! The values passed to [`init`] set the number of smallest blocks (in
//! units of 1024) each space can hold; any block size of a space may be
//! allocated while the space has room. Each space is managed by a map of
//! 32-bit words, one nibble per smallest block, and no block ever spans a
//! map word. Odd multiples of the smallest size can therefore fragment a
//! word; the counters from [`stat_get`] make that visible.

use std::cell::RefCell;

use crate::mem::allocator::BlockAllocator;

pub mod error;
pub mod mem;
pub mod utils;

pub use crate::error::{err_str, MbErr};
pub use crate::mem::allocator::{BlockStat, STAT_SLOTS};
pub use crate::mem::{read_bytes, write_bytes, MbPtr};
pub use crate::utils::MemMetrics;

thread_local! {
    static BLOCK_ALLOCATOR: RefCell<Option<BlockAllocator>> = RefCell::new(None);
}

/// Initialize the library: acquire one contiguous arena from the host and
/// set up both block spaces over it.
///
/// `k_small` and `k_big` give each space's capacity as a count of 1024
/// smallest blocks.
pub fn init(k_small: usize, k_big: usize) {
    BLOCK_ALLOCATOR.with(|it| {
        if it.borrow().is_none() {
            *it.borrow_mut() = Some(BlockAllocator::init(k_small, k_big));
        } else {
            unreachable!("mblib can only be initialized once");
        }
    });
}

/// Terminate the library, returning the arena to the host.
pub fn term() {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = it.borrow_mut().take() {
            alloc.term();
        } else {
            unreachable!("mblib is not initialized");
        }
    });
}

/// Allocate a block of at least `size` bytes, rounded up to the closest
/// block size of the space that serves it.
///
/// `None` means no block was handed out; [`err`] holds the reason.
pub fn allocate(size: usize) -> Option<MbPtr> {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &mut *it.borrow_mut() {
            alloc.allocate(size)
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Free a block returned by [`allocate`]. Problems are recorded in
/// [`err`].
pub fn deallocate(ptr: MbPtr) {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &mut *it.borrow_mut() {
            alloc.free(ptr)
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Error code of the last operation.
pub fn err() -> MbErr {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &*it.borrow() {
            alloc.last_err()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Per-run-length allocation counters for both spaces, or `None` with
/// `MapCorrupt` recorded when a map encoding violation is found.
pub fn stat_get() -> Option<BlockStat> {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &mut *it.borrow_mut() {
            alloc.stat_get()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Byte totals across both spaces, derived from a stats scan.
pub fn mem_metrics() -> Option<MemMetrics> {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &mut *it.borrow_mut() {
            alloc.mem_metrics()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Print the block usage counters to stdout. For debugging.
pub fn dump_stat() {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &mut *it.borrow_mut() {
            alloc.dump_stat()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Print both space maps to stdout. For debugging.
pub fn dump_map() {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &*it.borrow() {
            alloc.dump_map()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}

/// Whether both memory spaces are entirely unused. For testing.
pub fn test_free() -> bool {
    BLOCK_ALLOCATOR.with(|it| {
        if let Some(alloc) = &*it.borrow() {
            alloc.test_free()
        } else {
            unreachable!("mblib is not initialized");
        }
    })
}
