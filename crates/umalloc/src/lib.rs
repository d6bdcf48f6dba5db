//! User-space `malloc` family on top of the combined `brk` call.
//!
//! Every allocation is prefixed with a small [`MallocHeader`] carrying a magic
//! number and the requested size. The header is what the kernel hands out;
//! the pointer returned to the caller points right past it.
//!
//! ```text
//!   brk(size + HEADER_SIZE)
//!   │
//!   ▼
//!   ┌──────────────────────┬──────────────────────┐
//!   │ magic │ size │ (pad) │ size bytes           │
//!   └──────────────────────┴──────────────────────┘
//!                          ▲
//!                          malloc(size)
//! ```
//!
//! Freeing hands the header address back through the same `brk` call, which
//! the kernel recognizes as an address inside its heap and releases.
//!
//! ```
//! use heap::{HeapConfig, ProcessHeap};
//! use umalloc::Malloc;
//!
//! let heap = ProcessHeap::new(HeapConfig::new());
//! let malloc = Malloc::new(|arg: usize| unsafe { heap.sys_brk(arg) });
//!
//! let p = malloc.malloc(10);
//! assert!(!p.is_null());
//! unsafe {
//!     assert_eq!(malloc.usable_size(p), 10);
//!     malloc.free(p);
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::ptr;

use log::trace;

/// Marks a header written by [`Malloc::malloc`].
pub const MALLOC_MAGIC: u32 = 0x600D_C0DE;

/// Bytes in front of every user allocation.
pub const HEADER_SIZE: usize = size_of::<MallocHeader>();

/// Prefix of every user allocation.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocHeader {
    pub magic: u32,
    pub size: usize,
}

/// The combined allocate/release call of the kernel heap.
///
/// `arg` is either a number of bytes to allocate, in which case the address
/// of the new memory (or `0`) is returned, or an address previously returned
/// by the call, in which case that memory is released and `0` is returned.
///
/// # Soundness
///
/// The call tells the two cases apart by value alone. With a router such as
/// `ProcessHeap::sys_brk`, a size that happens to fall inside the heap area
/// is taken as a release of whatever block lives there. [`Malloc`] asks for
/// `size + HEADER_SIZE` bytes, so an implementation wrapping such a router
/// is only sound while every requested total stays below the heap area's
/// start address. Whoever builds the closure takes on that contract.
pub trait Brk {
    fn brk(&self, arg: usize) -> usize;
}

impl<F> Brk for F
where
    F: Fn(usize) -> usize,
{
    fn brk(&self, arg: usize) -> usize {
        self(arg)
    }
}

/// `malloc`, `calloc`, `realloc` and `free` over a [`Brk`] implementation.
#[derive(Debug)]
pub struct Malloc<B>
where
    B: Brk,
{
    brk: B,
}

impl<B> Malloc<B>
where
    B: Brk,
{
    /// Creates the allocator on top of `brk`.
    ///
    /// A `brk` that routes values inside the heap area to release makes
    /// requests of that magnitude unsound; see [`Brk`].
    pub const fn new(brk: B) -> Self {
        Self { brk }
    }

    /// Allocates `size` bytes aligned to 16 bytes.
    ///
    /// Returns null if `size` is zero or the heap is exhausted.
    #[must_use]
    pub fn malloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let Some(total) = size.checked_add(HEADER_SIZE) else {
            return ptr::null_mut();
        };
        let header = ptr::with_exposed_provenance_mut::<MallocHeader>(self.brk.brk(total));
        if header.is_null() {
            trace!("malloc({size}): out of memory");
            return ptr::null_mut();
        }
        unsafe {
            header.write(MallocHeader {
                magic: MALLOC_MAGIC,
                size,
            });
            trace!("malloc({size}) = {:p}", header.add(1));
            header.add(1).cast()
        }
    }

    /// Allocates zero-filled memory for `count` elements of `size` bytes.
    ///
    /// Returns null if the total size overflows, is zero, or cannot be
    /// allocated.
    #[must_use]
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe {
                ptr.write_bytes(0, total);
            }
        }
        ptr
    }

    /// Resizes an allocation, moving it to a new block.
    ///
    /// A null `ptr` behaves like [`malloc`](Self::malloc); a zero `size`
    /// frees `ptr` and returns null. Otherwise the first `min(old, size)`
    /// bytes are copied into a new allocation and `ptr` is freed. If the new
    /// allocation fails, null is returned and `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not carry a valid header.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            unsafe {
                self.free(ptr);
            }
            return ptr::null_mut();
        }
        let old_size = unsafe { self.usable_size(ptr) };
        let new = self.malloc(size);
        if new.is_null() {
            return new;
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size.min(size));
            self.free(ptr);
        }
        new
    }

    /// Releases an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not carry a valid header, which includes pointers
    /// that were already freed.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { Self::header(ptr) };
        trace!("free({ptr:p})");
        unsafe {
            (*header).magic = 0;
        }
        self.brk.brk(header.expose_provenance());
    }

    /// Returns the size requested for an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not carry a valid header.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe { (*Self::header(ptr)).size }
    }

    #[expect(clippy::cast_ptr_alignment)]
    unsafe fn header(ptr: *mut u8) -> *mut MallocHeader {
        let header = unsafe { ptr.cast::<MallocHeader>().sub(1) };
        assert_eq!(
            unsafe { (*header).magic },
            MALLOC_MAGIC,
            "{ptr:p} is not a valid pointer"
        );
        header
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use heap::{HeapConfig, ProcessHeap, RegionStats};

    use super::*;

    type TestMalloc<'a> = Malloc<&'a dyn Fn(usize) -> usize>;

    fn with_test_malloc<F>(test_fn: F)
    where
        F: FnOnce(&TestMalloc<'_>, &ProcessHeap),
    {
        let heap = ProcessHeap::new(
            HeapConfig::new()
                .with_initial_size(4096)
                .with_reserved_size(64 * 1024),
        );
        let brk = |arg: usize| unsafe { heap.sys_brk(arg) };
        let malloc = Malloc::new(&brk as &dyn Fn(usize) -> usize);
        test_fn(&malloc, &heap);
    }

    fn stats(heap: &ProcessHeap) -> RegionStats {
        heap.stats().unwrap()
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(MALLOC_MAGIC, 0x600D_C0DE);
    }

    #[test]
    fn test_malloc_free() {
        with_test_malloc(|m, heap| unsafe {
            let p = m.malloc(100);
            assert!(!p.is_null());
            assert!(p.addr().is_multiple_of(16));
            assert_eq!(m.usable_size(p), 100);
            p.write_bytes(0x33, 100);
            m.free(p);
            assert_eq!(stats(heap).blocks, 1);
        });
    }

    #[test]
    fn test_malloc_zero_and_free_null() {
        with_test_malloc(|m, heap| unsafe {
            assert!(m.malloc(0).is_null());
            assert!(m.malloc(usize::MAX).is_null());
            m.free(ptr::null_mut());
            assert!(heap.stats().is_none_or(|s| s.used_bytes == 0));
        });
    }

    #[test]
    fn test_lifo_release_restores_state() {
        with_test_malloc(|m, heap| unsafe {
            heap.init().unwrap();
            let before = stats(heap);
            let top = heap.brk();

            let ptrs = [1, 100, 1000, 3000, 16]
                .into_iter()
                .map(|size| m.malloc(size))
                .collect::<Vec<_>>();
            assert!(ptrs.iter().all(|p| !p.is_null()));
            for p in ptrs.into_iter().rev() {
                m.free(p);
            }

            // the 3000 byte request no longer fit and grew the heap
            assert!(heap.brk() > top);
            let after = stats(heap);
            assert_eq!(after.blocks, 1);
            assert_eq!(after.used_bytes, 0);
            assert_eq!(
                after.free_bytes - before.free_bytes,
                heap.brk().unwrap() - top.unwrap()
            );
        });
    }

    #[test]
    fn test_out_of_order_release() {
        with_test_malloc(|m, heap| unsafe {
            let a = m.malloc(64);
            let b = m.malloc(64);
            let c = m.malloc(64);
            m.free(b);
            m.free(a);
            m.free(c);
            let s = stats(heap);
            assert_eq!((s.blocks, s.used_bytes), (1, 0));
        });
    }

    #[test]
    fn test_calloc() {
        with_test_malloc(|m, _| unsafe {
            let p = m.malloc(256);
            p.write_bytes(0xff, 256);
            m.free(p);

            let q = m.calloc(16, 16);
            assert_eq!(q, p);
            for i in 0..256 {
                assert_eq!(q.add(i).read(), 0);
            }
            m.free(q);

            assert!(m.calloc(usize::MAX, 2).is_null());
            assert!(m.calloc(0, 16).is_null());
        });
    }

    #[test]
    fn test_realloc() {
        with_test_malloc(|m, heap| unsafe {
            let p = m.realloc(ptr::null_mut(), 32);
            assert!(!p.is_null());
            for i in 0..32 {
                p.add(i).write(u8::try_from(i).unwrap());
            }

            let q = m.realloc(p, 200);
            assert_eq!(m.usable_size(q), 200);
            for i in 0..32 {
                assert_eq!(q.add(i).read(), u8::try_from(i).unwrap());
            }

            let r = m.realloc(q, 8);
            assert_eq!(m.usable_size(r), 8);
            for i in 0..8 {
                assert_eq!(r.add(i).read(), u8::try_from(i).unwrap());
            }

            assert!(m.realloc(r, 0).is_null());
            assert_eq!(stats(heap).used_bytes, 0);
        });
    }

    #[test]
    fn test_failed_realloc_keeps_block() {
        with_test_malloc(|m, heap| unsafe {
            let p = m.malloc(40);
            p.write_bytes(0x33, 40);
            assert!(m.realloc(p, 1024 * 1024).is_null());
            assert_eq!(m.usable_size(p), 40);
            assert_eq!(p.add(39).read(), 0x33);
            m.free(p);
            assert_eq!(stats(heap).used_bytes, 0);
        });
    }

    #[test]
    #[should_panic(expected = "is not a valid pointer")]
    fn test_double_free() {
        with_test_malloc(|m, _| unsafe {
            let p = m.malloc(64);
            let _q = m.malloc(64);
            m.free(p);
            m.free(p);
        });
    }

    #[test]
    #[should_panic(expected = "is not a valid pointer")]
    fn test_free_foreign_pointer() {
        with_test_malloc(|m, _| unsafe {
            let mut buf = [0_u128; 4];
            m.free(buf.as_mut_ptr().add(2).cast());
        });
    }

    #[test]
    fn test_size_inside_area_is_routed_as_release() {
        with_test_malloc(|m, heap| unsafe {
            let p = m.malloc(64);
            let header = p.sub(HEADER_SIZE).addr();
            assert_eq!(stats(heap).blocks, 2);

            // the request total equals a live header address
            assert!(m.malloc(header - HEADER_SIZE).is_null());
            let s = stats(heap);
            assert_eq!((s.blocks, s.used_bytes), (1, 0));
        });
    }

    #[test]
    fn test_custom_brk() {
        let calls = Cell::new(0);
        let m = Malloc::new(|_: usize| {
            calls.set(calls.get() + 1);
            0
        });
        assert!(m.malloc(10).is_null());
        assert!(m.calloc(2, 5).is_null());
        assert_eq!(calls.get(), 2);
    }
}
