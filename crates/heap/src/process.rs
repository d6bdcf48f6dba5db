use core::ptr::{self, NonNull};

use log::{error, trace};
use snafu::OptionExt as _;
use snafu_utils::Report;
use spin::mutex::SpinMutex;
use vmem::{AddressSpace, HostPageAllocator, PageAllocator};

use crate::{
    HeapConfig, Region, RegionStats,
    error::{HeapError, NotInRegionSnafu},
};

/// Heap of one address space.
///
/// The address space is kept behind a spin lock, and every operation holds
/// the lock until it returns. The heap region itself is created lazily, on
/// the first call that needs it, using the configuration given at
/// construction.
///
/// ```
/// use heap::{HeapConfig, ProcessHeap};
///
/// let heap = ProcessHeap::new(HeapConfig::new());
/// let ptr = heap.grow(100).unwrap();
/// unsafe { heap.shrink(ptr).unwrap(); }
/// assert_eq!(heap.stats().unwrap().free_blocks, 1);
/// ```
#[derive(Debug)]
pub struct ProcessHeap<A = HostPageAllocator>
where
    A: PageAllocator,
{
    config: HeapConfig,
    mm: SpinMutex<AddressSpace<A>>,
}

impl ProcessHeap {
    /// Creates a heap over a fresh, host-backed address space.
    #[must_use]
    pub const fn new(config: HeapConfig) -> Self {
        Self::with_address_space(config, AddressSpace::new())
    }
}

impl<A> ProcessHeap<A>
where
    A: PageAllocator,
{
    #[must_use]
    pub const fn with_address_space(config: HeapConfig, mm: AddressSpace<A>) -> Self {
        Self {
            config,
            mm: SpinMutex::new(mm),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Creates the heap region now instead of on first use.
    ///
    /// Does nothing if the region already exists.
    pub fn init(&self) -> Result<(), HeapError> {
        let mut mm = self.mm.lock();
        Self::region(&self.config, &mut mm)?;
        Ok(())
    }

    /// Returns the current heap top, or `None` before the region exists.
    pub fn brk(&self) -> Option<usize> {
        let mm = self.mm.lock();
        mm.find_vm_area(mm.start_brk).map(|_| mm.brk)
    }

    /// Allocates `size` bytes, creating the heap region on first use.
    pub fn grow(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let mut mm = self.mm.lock();
        Self::region(&self.config, &mut mm)?.allocate(size)
    }

    /// Releases memory obtained from [`grow`](Self::grow).
    ///
    /// # Safety
    ///
    /// See [`Region::release`].
    pub unsafe fn shrink(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let mut mm = self.mm.lock();
        let addr = ptr.addr().get();
        let mut region = Region::open(&mut mm).context(NotInRegionSnafu { addr })?;
        unsafe { region.release(ptr) }
    }

    /// Combined allocate/release entry point of the legacy system call.
    ///
    /// An `arg` strictly inside the heap area is treated as a pointer to
    /// release and `0` is returned. Any other value is a number of bytes to
    /// allocate, and the address of the new memory is returned. Failures are
    /// logged and reported as `0`.
    ///
    /// # Safety
    ///
    /// An `arg` inside the heap area must be a live pointer obtained from
    /// this heap, as required by [`shrink`](Self::shrink).
    pub unsafe fn sys_brk(&self, arg: usize) -> usize {
        let mut mm = self.mm.lock();
        let mut region = match Self::region(&self.config, &mut mm) {
            Ok(region) => region,
            Err(e) => {
                error!("sys_brk({arg:#x}): {}", Report::new(e));
                return 0;
            }
        };

        if let Some(ptr) = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(arg))
            .filter(|_| region.area().strictly_contains(arg))
        {
            trace!("sys_brk({arg:#x}): releasing");
            if let Err(e) = unsafe { region.release(ptr) } {
                error!("sys_brk({arg:#x}): {}", Report::new(e));
            }
            return 0;
        }

        trace!("sys_brk({arg:#x}): allocating");
        match region.allocate(arg) {
            Ok(ptr) => ptr.as_ptr().expose_provenance(),
            Err(e) => {
                error!("sys_brk({arg:#x}): {}", Report::new(e));
                0
            }
        }
    }

    /// Runs `f` on the heap region, if it has been created.
    pub fn with_region<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Region<'_, A>) -> R,
    {
        let mut mm = self.mm.lock();
        let mut region = Region::open(&mut mm)?;
        Some(f(&mut region))
    }

    /// Validates the heap region and summarizes it.
    ///
    /// # Panics
    ///
    /// Panics if the region is corrupted.
    pub fn stats(&self) -> Option<RegionStats> {
        self.with_region(|region| region.check())
    }

    pub fn dump(&self) {
        self.with_region(|region| region.dump());
    }

    fn region<'a>(
        config: &HeapConfig,
        mm: &'a mut AddressSpace<A>,
    ) -> Result<Region<'a, A>, HeapError> {
        match mm.find_vm_area(mm.start_brk) {
            Some(area) => Ok(Region::with_area(mm, area)),
            None => Region::create(mm, config),
        }
    }
}
