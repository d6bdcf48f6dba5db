use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use log::error;
use snafu_utils::Report;
use vmem::{AddressSpace, ArenaPageAllocator, PageAllocator};

use crate::{ALIGNMENT, HeapConfig, ProcessHeap};

/// [`GlobalAlloc`] front end of the kernel's own heap.
///
/// Requests are served from a [`ProcessHeap`] whose pages come from `A`,
/// by default an [`ArenaPageAllocator`] over a fixed memory range. Neither the
/// heap nor the arena ever allocate through the global allocator, so a
/// `KernelAllocator` can be installed as `#[global_allocator]`:
///
/// ```no_run
/// use heap::{HeapConfig, KernelAllocator};
/// use vmem::{ArenaPageAllocator, PAGE_SIZE};
///
/// const PAGES: usize = 1024;
///
/// #[repr(C, align(4096))]
/// struct Arena([u8; PAGES * PAGE_SIZE]);
///
/// static mut ARENA: Arena = Arena([0; PAGES * PAGE_SIZE]);
///
/// #[global_allocator]
/// static KERNEL: KernelAllocator = KernelAllocator::new(
///     HeapConfig::kernel()
///         .with_initial_size(256 * 1024)
///         .with_reserved_size(PAGES * PAGE_SIZE),
///     unsafe { ArenaPageAllocator::new((&raw const ARENA).cast_mut().cast(), PAGES) },
/// );
///
/// let v = vec![0_u8; 100];
/// # drop(v);
/// ```
///
/// Layouts aligned to more than [`ALIGNMENT`] bytes get a larger block; the
/// address of that block is stored right in front of the aligned pointer.
#[derive(Debug)]
pub struct KernelAllocator<A = ArenaPageAllocator>
where
    A: PageAllocator,
{
    heap: ProcessHeap<A>,
}

impl<A> KernelAllocator<A>
where
    A: PageAllocator,
{
    /// Creates an allocator whose heap region is reserved from `pages` on
    /// first use.
    #[must_use]
    pub const fn new(config: HeapConfig, pages: A) -> Self {
        Self::with_heap(ProcessHeap::with_address_space(
            config,
            AddressSpace::with_page_allocator(pages),
        ))
    }

    #[must_use]
    pub const fn with_heap(heap: ProcessHeap<A>) -> Self {
        Self { heap }
    }

    #[must_use]
    pub const fn heap(&self) -> &ProcessHeap<A> {
        &self.heap
    }

    fn grow(&self, size: usize) -> *mut u8 {
        match self.heap.grow(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                error!("kernel heap: {}", Report::new(e));
                ptr::null_mut()
            }
        }
    }
}

unsafe impl<A> GlobalAlloc for KernelAllocator<A>
where
    A: PageAllocator,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.grow(layout.size());
        }

        let Some(size) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(block) = NonNull::new(self.grow(size)) else {
            return ptr::null_mut();
        };
        // at least ALIGNMENT bytes in, at most align bytes in
        let offset = (block.addr().get() + 1).next_multiple_of(layout.align()) - block.addr().get();
        unsafe {
            let aligned = block.add(offset);
            back_pointer(aligned).write(block);
            aligned.as_ptr()
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let block = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            unsafe { back_pointer(ptr).read() }
        };
        if let Err(e) = unsafe { self.heap.shrink(block) } {
            error!("kernel heap: {}", Report::new(e));
        }
    }
}

#[expect(clippy::cast_ptr_alignment)]
unsafe fn back_pointer(aligned: NonNull<u8>) -> NonNull<NonNull<u8>> {
    unsafe { aligned.cast::<NonNull<u8>>().sub(1) }
}
