//! Process heap management.
//!
//! A heap lives in one [`VmArea`](vmem::VmArea) of an address space, the
//! *region*. The region is carved into blocks that are tracked by two
//! intrusive chains: one with every block in address order and one with the
//! free blocks only. Allocation is best fit with block splitting; release
//! coalesces the freed block with its free neighbours. When no free block
//! fits, the heap top is moved forward inside the reserved area.
//!
//! The crate is layered:
//!
//! - [`Region`]: the allocator proper, operating on an exclusively borrowed
//!   [`AddressSpace`](vmem::AddressSpace).
//! - [`ProcessHeap`]: a lock-protected address space whose region is created
//!   on first use. It offers typed [`grow`](ProcessHeap::grow) and
//!   [`shrink`](ProcessHeap::shrink) calls as well as the combined
//!   [`sys_brk`](ProcessHeap::sys_brk) entry point.
//! - [`KernelAllocator`]: a [`GlobalAlloc`](core::alloc::GlobalAlloc) front
//!   end for the kernel's own heap.
//!
//! # Example
//!
//! ```
//! use heap::{HeapConfig, ProcessHeap};
//!
//! let heap = ProcessHeap::new(
//!     HeapConfig::new()
//!         .with_initial_size(4096)
//!         .with_reserved_size(64 * 1024),
//! );
//!
//! let small = heap.grow(100).unwrap();
//! // too large for the initial block, so the heap top moves
//! let top = heap.brk().unwrap();
//! let large = heap.grow(16 * 1024).unwrap();
//! assert!(heap.brk().unwrap() > top);
//!
//! unsafe {
//!     heap.shrink(large).unwrap();
//!     heap.shrink(small).unwrap();
//! }
//! let stats = heap.stats().unwrap();
//! assert_eq!((stats.blocks, stats.used_bytes), (1, 0));
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    block::{ALIGNMENT, BlockInfo, BlockOffset, HumanSize, OVERHEAD, round_size},
    config::HeapConfig,
    error::HeapError,
    kernel::KernelAllocator,
    process::ProcessHeap,
    region::{REGION_HEADER_SIZE, Region, RegionStats},
};

mod block;
mod config;
mod error;
mod kernel;
mod process;
mod region;
