use alloc::alloc::{alloc_zeroed, dealloc};
use core::{alloc::Layout, ptr::NonNull};

use crate::{AllocClass, PAGE_SIZE};

/// Source of the physical pages that back a virtual memory area.
pub trait PageAllocator {
    /// Allocates `count` contiguous, zero-filled pages.
    ///
    /// Returns `None` if the request cannot be satisfied.
    fn allocate_pages(&mut self, count: usize, class: AllocClass) -> Option<NonNull<u8>>;

    /// Returns pages obtained from [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Safety
    ///
    /// `pages` must have been returned by `allocate_pages` on this allocator
    /// with the same `count` and `class`, and must not be used afterwards.
    unsafe fn free_pages(&mut self, pages: NonNull<u8>, count: usize, class: AllocClass);
}

/// Page allocator backed by page-aligned host memory.
///
/// Virtual addresses handed out through this allocator are plain host
/// addresses, which makes the heap manager runnable on a hosted target.
#[derive(Debug, Default)]
pub struct HostPageAllocator {
    limit: Option<usize>,
    in_use: [usize; AllocClass::ALL.len()],
}

impl HostPageAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            limit: None,
            in_use: [0; AllocClass::ALL.len()],
        }
    }

    /// Creates an allocator that refuses to hand out more than `pages` pages
    /// in total.
    #[must_use]
    pub const fn with_limit(pages: usize) -> Self {
        Self {
            limit: Some(pages),
            in_use: [0; AllocClass::ALL.len()],
        }
    }

    /// Number of pages currently allocated for `class`.
    #[must_use]
    pub fn pages_in_use(&self, class: AllocClass) -> usize {
        self.in_use[class.index()]
    }

    /// Number of pages currently allocated across all classes.
    #[must_use]
    pub fn total_pages_in_use(&self) -> usize {
        self.in_use.iter().sum()
    }

    fn layout(count: usize) -> Option<Layout> {
        let size = count.checked_mul(PAGE_SIZE)?;
        Layout::from_size_align(size, PAGE_SIZE).ok()
    }
}

impl PageAllocator for HostPageAllocator {
    fn allocate_pages(&mut self, count: usize, class: AllocClass) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }
        if let Some(limit) = self.limit
            && self.total_pages_in_use() + count > limit
        {
            return None;
        }
        let layout = Self::layout(count)?;
        let pages = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.in_use[class.index()] += count;
        Some(pages)
    }

    unsafe fn free_pages(&mut self, pages: NonNull<u8>, count: usize, class: AllocClass) {
        let layout = Self::layout(count).expect("page count was valid when allocated");
        let in_use = &mut self.in_use[class.index()];
        assert!(*in_use >= count, "freeing more {class:?} pages than allocated");
        *in_use -= count;
        unsafe {
            dealloc(pages.as_ptr(), layout);
        }
    }
}

/// Page allocator over a fixed range of memory handed in by the caller.
///
/// Pages are carved from the front of the range. Freed pages are only
/// reused when they are the most recently allocated ones; anything else
/// stays reserved until the allocator is dropped. The allocator never
/// touches the global allocator, so it can back the heap that serves it.
#[derive(Debug)]
pub struct ArenaPageAllocator {
    base: *mut u8,
    pages: usize,
    next: usize,
    in_use: [usize; AllocClass::ALL.len()],
}

// The arena is owned exclusively by the allocator.
unsafe impl Send for ArenaPageAllocator {}

impl ArenaPageAllocator {
    /// Creates an allocator over `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and valid for reads and writes of
    /// `pages * PAGE_SIZE` bytes for as long as the allocator and any memory
    /// it handed out are in use. Nothing else may access that memory.
    #[must_use]
    pub const unsafe fn new(base: *mut u8, pages: usize) -> Self {
        Self {
            base,
            pages,
            next: 0,
            in_use: [0; AllocClass::ALL.len()],
        }
    }

    #[must_use]
    pub fn pages_in_use(&self, class: AllocClass) -> usize {
        self.in_use[class.index()]
    }

    /// Number of pages that have never been handed out.
    #[must_use]
    pub fn remaining_pages(&self) -> usize {
        self.pages - self.next
    }
}

impl PageAllocator for ArenaPageAllocator {
    fn allocate_pages(&mut self, count: usize, class: AllocClass) -> Option<NonNull<u8>> {
        if count == 0 || count > self.remaining_pages() {
            return None;
        }
        assert!(
            self.base.addr().is_multiple_of(PAGE_SIZE),
            "arena base {:p} is not page aligned",
            self.base
        );
        let pages = unsafe { self.base.add(self.next * PAGE_SIZE) };
        unsafe {
            pages.write_bytes(0, count * PAGE_SIZE);
        }
        self.next += count;
        self.in_use[class.index()] += count;
        NonNull::new(pages)
    }

    unsafe fn free_pages(&mut self, pages: NonNull<u8>, count: usize, class: AllocClass) {
        let offset = pages.addr().get().wrapping_sub(self.base.addr());
        assert!(
            offset.is_multiple_of(PAGE_SIZE) && offset / PAGE_SIZE + count <= self.next,
            "pages {pages:p} were not allocated from this arena"
        );
        let in_use = &mut self.in_use[class.index()];
        assert!(*in_use >= count, "freeing more {class:?} pages than allocated");
        *in_use -= count;
        if offset / PAGE_SIZE + count == self.next {
            self.next -= count;
        }
    }
}
