use core::ptr::{self, NonNull};

use arrayvec::ArrayVec;
use snafu::{OptionExt as _, Snafu, ensure};
use snafu_utils::Location;

use crate::{AllocClass, Align as _, HostPageAllocator, MapFlags, PAGE_SIZE, PageAllocator, VmArea};

/// Maximum number of areas in one address space.
pub const MAX_AREAS: usize = 16;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VmError {
    #[snafu(display("cannot create an empty memory area"))]
    EmptyArea {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("requested base {base:#x} is not page aligned"))]
    UnalignedBase {
        base: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("area of {size:#x} bytes does not fit in the address space"))]
    AreaTooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address space already holds {max} areas"))]
    TooManyAreas {
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate {count} pages for {class:?}"))]
    OutOfPages {
        count: usize,
        class: AllocClass,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("fixed address {requested:#x} is unavailable, pages are at {actual:#x}"))]
    FixedAddressUnavailable {
        requested: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Memory descriptor of one address space.
///
/// Owns every [`VmArea`] mapped into the space and the pages backing them.
/// `start_brk` and `brk` describe the process heap: the base of the heap area
/// and its current logical top. Both are zero until a heap is created and are
/// only moved by the heap's growth primitive.
///
/// At most [`MAX_AREAS`] areas can be mapped at a time. The descriptor never
/// allocates from the global allocator, so it can back the allocator itself.
///
/// Dropping the address space unmaps all areas.
#[derive(Debug)]
pub struct AddressSpace<A = HostPageAllocator>
where
    A: PageAllocator,
{
    pages: A,
    areas: ArrayVec<VmArea, MAX_AREAS>,
    /// Current logical top of the heap.
    pub brk: usize,
    /// Base of the heap area.
    pub start_brk: usize,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// Creates an empty address space backed by host memory.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_page_allocator(HostPageAllocator::new())
    }
}

impl<A> AddressSpace<A>
where
    A: PageAllocator,
{
    #[must_use]
    pub const fn with_page_allocator(pages: A) -> Self {
        Self {
            pages,
            areas: ArrayVec::new_const(),
            brk: 0,
            start_brk: 0,
        }
    }

    pub fn page_allocator(&self) -> &A {
        &self.pages
    }

    /// Returns the mapped areas in creation order.
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.iter()
    }

    /// Creates and backs a new memory area of at least `size` bytes.
    ///
    /// `size` is rounded up to whole pages. The area is placed at
    /// `requested_base` if possible; otherwise it is placed wherever the page
    /// allocator provides memory, which is only allowed if `flags` contains
    /// [`MapFlags::UPDADDR`].
    ///
    /// The pages of the new area are zero-filled.
    pub fn create_vm_area(
        &mut self,
        requested_base: usize,
        size: usize,
        flags: MapFlags,
        class: AllocClass,
    ) -> Result<VmArea, VmError> {
        ensure!(size > 0, EmptyAreaSnafu);
        ensure!(!self.areas.is_full(), TooManyAreasSnafu { max: MAX_AREAS });
        ensure!(
            requested_base.is_page_aligned(),
            UnalignedBaseSnafu {
                base: requested_base
            }
        );
        let size = size
            .checked_align_up(PAGE_SIZE)
            .context(AreaTooLargeSnafu { size })?;
        let count = size / PAGE_SIZE;

        let pages = self
            .pages
            .allocate_pages(count, class)
            .context(OutOfPagesSnafu { count, class })?;
        let start = pages.as_ptr().expose_provenance();

        if start != requested_base && !flags.contains(MapFlags::UPDADDR) {
            unsafe {
                self.pages.free_pages(pages, count, class);
            }
            return FixedAddressUnavailableSnafu {
                requested: requested_base,
                actual: start,
            }
            .fail();
        }

        let Some(end) = start.checked_add(size) else {
            unsafe {
                self.pages.free_pages(pages, count, class);
            }
            return AreaTooLargeSnafu { size }.fail();
        };

        let area = VmArea::new(start..end, flags, class);
        assert!(
            self.areas.iter().all(|a| !a.overlaps(&area)),
            "page allocator returned pages overlapping an existing area: {area:?}"
        );
        log::debug!(
            "created area {start:#x}..{end:#x} ({count} pages, {flags:?}, {class:?}, requested {requested_base:#x})"
        );
        self.areas.push(area);
        Ok(area)
    }

    /// Returns the area containing `addr`, if any.
    #[must_use]
    pub fn find_vm_area(&self, addr: usize) -> Option<VmArea> {
        self.areas.iter().find(|a| a.contains(addr)).copied()
    }
}

impl<A> Drop for AddressSpace<A>
where
    A: PageAllocator,
{
    fn drop(&mut self) {
        for area in self.areas.drain(..) {
            let Some(pages) = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(area.start()))
            else {
                continue;
            };
            log::debug!("unmapping area {:#x}..{:#x}", area.start(), area.end());
            unsafe {
                self.pages
                    .free_pages(pages, area.len() / PAGE_SIZE, area.class());
            }
        }
    }
}
