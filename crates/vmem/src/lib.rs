//! Virtual memory primitives consumed by the heap manager.
//!
//! This crate models the narrow slice of the virtual-memory layer that a
//! process heap needs:
//!
//! - [`AddressSpace`]: the per-process memory descriptor. It owns the mapped
//!   [`VmArea`]s and exposes the `brk` / `start_brk` cursors that the growth
//!   primitive moves.
//! - [`VmArea`]: a contiguous, page-granular virtual range with its
//!   [`MapFlags`] and [`AllocClass`].
//! - [`PageAllocator`]: the page provider backing an area. The
//!   [`HostPageAllocator`] backs areas with zeroed, page-aligned host memory
//!   so that virtual addresses equal host addresses. The
//!   [`ArenaPageAllocator`] carves pages from a fixed range and never uses
//!   the global allocator.
//!
//! # Example
//!
//! ```
//! use vmem::{AddressSpace, AllocClass, MapFlags, PAGE_SIZE};
//!
//! let mut mm = AddressSpace::new();
//! let area = mm
//!     .create_vm_area(
//!         0x4000_0000,
//!         PAGE_SIZE + 1,
//!         MapFlags::RW | MapFlags::PRESENT | MapFlags::UPDADDR,
//!         AllocClass::HighUser,
//!     )
//!     .unwrap();
//! assert_eq!(area.len(), 2 * PAGE_SIZE);
//! assert_eq!(mm.find_vm_area(area.start() + 10), Some(area));
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    area::{AllocClass, MapFlags, VmArea},
    page::{ArenaPageAllocator, HostPageAllocator, PageAllocator},
    space::{AddressSpace, MAX_AREAS, VmError},
};

mod area;
mod page;
mod space;

pub const PAGE_SIZE: usize = 4096;

/// Power-of-two alignment helpers for addresses and sizes.
pub trait Align: Sized {
    fn checked_align_up(&self, align: usize) -> Option<Self>;
    fn is_aligned(&self, align: usize) -> bool;

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
}

impl Align for usize {
    fn checked_align_up(&self, align: usize) -> Option<Self> {
        self.checked_next_multiple_of(align)
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.is_multiple_of(align)
    }
}
