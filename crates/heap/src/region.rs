//! Coalescing free-list allocator over a growable heap region.
//!
//! A region is a [`VmArea`] whose first bytes hold a [`RegionHeader`]. The
//! rest of the region, up to the heap top (`brk`), is tiled by blocks:
//!
//! ```text
//! base                                                        brk        end
//! ┌──────────────┬─────────────┬──────────────┬───── ─ ─ ─────┬─ ─ ─ ─ ─ ─┐
//! │ RegionHeader │ block       │ block        │      ...      │  reserved │
//! │ head/tail/.. │ hdr | data  │ hdr | data   │               │           │
//! └──────────────┴─────────────┴──────────────┴───── ─ ─ ─────┴─ ─ ─ ─ ─ ─┘
//! ```
//!
//! Blocks are linked twice:
//!
//! - **address order** (`prev` / `next`): every block, in memory order,
//!   from the region `head` to its `tail`;
//! - **free order** (`prev_free` / `next_free`): only the free blocks,
//!   starting at the region's `free` pointer, most recently freed first.
//!
//! # Algorithm
//!
//! - **Allocation** rounds the request to [`ALIGNMENT`] and picks the
//!   smallest free block that fits (best fit, earliest in free order on
//!   ties). An oversized block is split and its remainder takes the original
//!   block's place in the free order. When nothing fits, the heap top is
//!   advanced and a new block is appended at the tail.
//! - **Release** marks the block free and merges it with any free neighbour
//!   in address order, so no two adjacent blocks are ever both free.
//!
//! The region never shrinks: memory above the heap top is only reached
//! through the growth primitive, which refuses to pass the end of the
//! reserved area.

use core::{
    fmt, iter,
    ptr::{self, NonNull},
};

use log::{debug, error, info, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};
use vmem::{AddressSpace, HostPageAllocator, PageAllocator, VmArea};

use crate::{
    ALIGNMENT, HeapConfig, OVERHEAD,
    block::{BlockHeader, BlockInfo, BlockOffset, HumanSize, round_size},
    error::{
        CreateAreaSnafu, HeapError, NotInRegionSnafu, OutOfReservedRangeSnafu, SizeOverflowSnafu,
        ZeroSizeSnafu,
    },
};

/// Bookkeeping stored at the base of every region.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionHeader {
    /// First block in address order.
    head: Option<BlockOffset>,
    /// Last block in address order.
    tail: Option<BlockOffset>,
    /// First block in free order, `None` iff no block is free.
    free: Option<BlockOffset>,
}

/// Bytes taken by the region header at the base of the region.
pub const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();
const _: () = assert!(REGION_HEADER_SIZE % ALIGNMENT == 0);

const FIRST_BLOCK: BlockOffset = match BlockOffset::new(REGION_HEADER_SIZE) {
    Some(block) => block,
    None => panic!("region header must not be empty"),
};

/// A block is only split if the remainder can hold a header and at least one
/// aligned unit of usable memory.
const MIN_SPLIT_REMAINDER: usize = OVERHEAD + ALIGNMENT;

/// Summary of a region, produced by [`Region::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

/// Exclusive view of the heap region of an address space.
///
/// The view borrows the [`AddressSpace`] mutably: the heap top lives in its
/// `brk` field and is moved by the growth primitive.
pub struct Region<'a, A = HostPageAllocator>
where
    A: PageAllocator,
{
    mm: &'a mut AddressSpace<A>,
    area: VmArea,
}

impl<A> fmt::Debug for Region<'_, A>
where
    A: PageAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("area", &self.area)
            .field("top", &format_args!("{:#x}", self.top()))
            .finish_non_exhaustive()
    }
}

impl<'a, A> Region<'a, A>
where
    A: PageAllocator,
{
    /// Reserves a new heap area in `mm` and initializes it.
    ///
    /// The region header is placed at the area base, followed by a single
    /// free block of `config.initial_size()` bytes. `start_brk` is set to the
    /// area base and `brk` to the end of the initial block.
    pub(crate) fn create(
        mm: &'a mut AddressSpace<A>,
        config: &HeapConfig,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let area = mm
            .create_vm_area(
                config.base(),
                config.reserved_size(),
                config.flags(),
                config.class(),
            )
            .context(CreateAreaSnafu)?;
        info!(
            "allocated heap {:#x}..{:#x}: {} initial, {} reserved",
            area.start(),
            area.end(),
            HumanSize(config.initial_size()),
            HumanSize(area.len()),
        );

        mm.start_brk = area.start();
        mm.brk = area.start() + config.bootstrap_size();

        let mut region = Self::with_area(mm, area);
        region.write_block(FIRST_BLOCK, BlockHeader::new(config.initial_size(), true));
        region.write_header(RegionHeader {
            head: Some(FIRST_BLOCK),
            tail: Some(FIRST_BLOCK),
            free: Some(FIRST_BLOCK),
        });
        region.dump();
        Ok(region)
    }

    /// Opens the heap region of `mm`, if it has one.
    pub fn open(mm: &'a mut AddressSpace<A>) -> Option<Self> {
        let area = mm.find_vm_area(mm.start_brk)?;
        Some(Self::with_area(mm, area))
    }

    pub(crate) fn with_area(mm: &'a mut AddressSpace<A>, area: VmArea) -> Self {
        assert_eq!(
            area.start(),
            mm.start_brk,
            "heap base does not start its area"
        );
        assert!(
            (area.start()..=area.end()).contains(&mm.brk),
            "heap top {:#x} lies outside of {area:?}",
            mm.brk
        );
        Self { mm, area }
    }

    #[must_use]
    pub fn area(&self) -> VmArea {
        self.area
    }

    /// Address of the region header.
    #[must_use]
    pub fn base(&self) -> usize {
        self.area.start()
    }

    /// Current heap top: the first byte past the last block.
    #[must_use]
    pub fn top(&self) -> usize {
        self.mm.brk
    }

    /// End of the reserved area, the hard ceiling of the heap top.
    #[must_use]
    pub fn end(&self) -> usize {
        self.area.end()
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`] and stays valid until
    /// it is passed to [`release`](Self::release).
    ///
    /// Fails if `size` is zero, or if no free block fits and growing the heap
    /// would pass the end of the reserved area. On failure the region is left
    /// untouched.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        ensure!(size > 0, ZeroSizeSnafu);
        let rounded = round_size(size).context(SizeOverflowSnafu { requested: size })?;
        debug!("searching block of size {}", HumanSize(rounded));

        let block = if let Some(block) = self.find_best_fit(rounded) {
            if self.block(block).size - rounded >= MIN_SPLIT_REMAINDER {
                self.split(block, rounded);
            } else {
                debug!("found fitting block {}", self.info(block));
                self.remove_from_free_list(block);
            }
            block
        } else {
            warn!(
                "no free block fits {}, creating a new one",
                HumanSize(rounded)
            );
            let increment = rounded
                .checked_add(OVERHEAD)
                .context(SizeOverflowSnafu { requested: size })?;
            self.append_block(rounded, increment)?
        };

        self.block_mut(block).free = false;
        self.dump();
        Ok(self.payload_ptr(block))
    }

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// The block is merged with its free neighbours in address order.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this region and must not
    /// have been released since. Pointers that do not even fall on a block
    /// boundary inside the region are rejected with
    /// [`HeapError::NotInRegion`]; any other misuse corrupts the heap.
    ///
    /// # Panics
    ///
    /// Panics if the block is already free.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.addr().get();
        let block = self.block_at(addr).context(NotInRegionSnafu { addr })?;
        assert!(
            !self.block(block).free,
            "double free of block {}",
            self.info(block)
        );

        let prev = self.previous_block(block);
        let next = self.next_block(block);
        self.block_mut(block).free = true;
        debug!("freeing block {}", self.info(block));

        let prev = prev.filter(|b| self.block(*b).free);
        let next = next.filter(|b| self.block(*b).free);
        match (prev, next) {
            (Some(prev), Some(next)) => {
                self.merge(prev, block);
                self.merge(prev, next);
            }
            (Some(prev), None) => self.merge(prev, block),
            (None, Some(next)) => {
                self.merge(block, next);
                self.add_to_free_list(block);
            }
            (None, None) => self.add_to_free_list(block),
        }

        self.dump();
        Ok(())
    }

    /// Moves the heap top forward by `increment` bytes.
    ///
    /// Returns the previous top, i.e. the start of the newly available
    /// memory. Fails without touching the top if the new top would pass the
    /// end of the reserved area.
    pub(crate) fn advance_top(&mut self, increment: usize) -> Result<usize, HeapError> {
        let top = self.mm.brk;
        let end = self.area.end();
        let Some(new_top) = top.checked_add(increment).filter(|t| *t <= end) else {
            error!("the new heap top would pass the reserved end {end:#x}");
            return OutOfReservedRangeSnafu {
                increment,
                top,
                end,
            }
            .fail();
        };
        info!("expanding heap from {top:#x} to {new_top:#x}");
        self.mm.brk = new_top;
        Ok(top)
    }

    /// Iterates over all blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        iter::successors(self.header().head, |b| self.block(*b).next).map(|b| self.info(b))
    }

    /// Iterates over the free blocks in free order.
    pub fn free_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        iter::successors(self.header().free, |b| self.block(*b).next_free)
            .map(|b| self.info(b))
    }

    /// Logs both block chains at debug level.
    pub fn dump(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        debug!("# LIST:");
        for info in self.blocks() {
            debug!("#  {info}");
        }
        if self.header().free.is_some() {
            debug!("# FREE:");
            for info in self.free_blocks() {
                debug!("#  {info}");
            }
        }
    }

    /// Validates every structural invariant of the region.
    ///
    /// # Panics
    ///
    /// Panics with a message naming the violated invariant if the region is
    /// corrupted.
    pub fn check(&self) -> RegionStats {
        let header = self.header();
        let head = self.head();
        let tail = self.tail();
        assert_eq!(head, FIRST_BLOCK, "the head block does not start the region");

        let mut stats = RegionStats::default();
        let mut expected = FIRST_BLOCK;
        let mut prev: Option<(BlockOffset, bool)> = None;
        let mut it = Some(head);
        while let Some(b) = it {
            assert_eq!(b, expected, "block {b:?} is not adjacent to its predecessor");
            let block = self.block(b);
            assert_eq!(
                block.prev,
                prev.map(|(p, _)| p),
                "block {b:?} has a broken address-order back link"
            );
            assert!(
                block.size > 0 && block.size.is_multiple_of(ALIGNMENT),
                "block {b:?} has an invalid size {:#x}",
                block.size
            );
            if block.free {
                assert!(
                    !prev.is_some_and(|(_, free)| free),
                    "free block {b:?} is not coalesced with its predecessor"
                );
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                assert!(
                    block.prev_free.is_none() && block.next_free.is_none(),
                    "used block {b:?} is linked into the free order"
                );
                stats.used_bytes += block.size;
            }
            if block.next.is_none() {
                assert_eq!(b, tail, "the last block is not the tail");
            }
            stats.blocks += 1;
            expected = b.following(block.size);
            prev = Some((b, block.free));
            it = block.next;
        }
        assert_eq!(
            expected.get(),
            self.top_offset(),
            "blocks do not reach the heap top"
        );

        let mut listed = 0;
        let mut prev_free = None;
        let mut it = header.free;
        while let Some(b) = it {
            assert!(
                listed < stats.free_blocks,
                "the free order holds more blocks than are free"
            );
            let block = self.block(b);
            assert!(block.free, "used block {b:?} is on the free order");
            assert_eq!(
                block.prev_free, prev_free,
                "block {b:?} has a broken free-order back link"
            );
            listed += 1;
            prev_free = Some(b);
            it = block.next_free;
        }
        assert_eq!(
            listed, stats.free_blocks,
            "not every free block is on the free order"
        );

        stats
    }

    fn top_offset(&self) -> usize {
        self.mm.brk - self.area.start()
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn header_ptr(&self) -> *mut RegionHeader {
        ptr::with_exposed_provenance_mut::<u8>(self.area.start()).cast()
    }

    fn header(&self) -> RegionHeader {
        unsafe { self.header_ptr().read() }
    }

    fn header_mut(&mut self) -> &mut RegionHeader {
        unsafe { &mut *self.header_ptr() }
    }

    fn write_header(&mut self, header: RegionHeader) {
        unsafe { self.header_ptr().write(header) }
    }

    fn head(&self) -> BlockOffset {
        self.header()
            .head
            .unwrap_or_else(|| panic!("the head of heap {:#x} is not set", self.base()))
    }

    fn tail(&self) -> BlockOffset {
        self.header()
            .tail
            .unwrap_or_else(|| panic!("the tail of heap {:#x} is not set", self.base()))
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn block_ptr(&self, block: BlockOffset) -> *mut BlockHeader {
        let offset = block.get();
        assert!(
            offset >= REGION_HEADER_SIZE && offset.is_multiple_of(ALIGNMENT),
            "block {block:?} is not at a block boundary"
        );
        assert!(
            offset + OVERHEAD <= self.top_offset(),
            "block {block:?} lies beyond the heap top {:#x}",
            self.top()
        );
        ptr::with_exposed_provenance_mut::<u8>(self.area.start() + offset).cast()
    }

    fn block(&self, block: BlockOffset) -> &BlockHeader {
        unsafe { &*self.block_ptr(block) }
    }

    fn block_mut(&mut self, block: BlockOffset) -> &mut BlockHeader {
        unsafe { &mut *self.block_ptr(block) }
    }

    fn write_block(&mut self, block: BlockOffset, header: BlockHeader) {
        unsafe { self.block_ptr(block).write(header) }
    }

    fn info(&self, block: BlockOffset) -> BlockInfo {
        let header = self.block(block);
        BlockInfo {
            offset: block,
            addr: self.area.start() + block.get(),
            size: header.size,
            free: header.free,
        }
    }

    fn payload_ptr(&self, block: BlockOffset) -> NonNull<u8> {
        let ptr = ptr::with_exposed_provenance_mut::<u8>(self.area.start() + block.payload());
        NonNull::new(ptr).unwrap_or_else(|| unreachable!("heap blocks never start at address 0"))
    }

    /// Maps a pointer handed out by `allocate` back to its block.
    fn block_at(&self, addr: usize) -> Option<BlockOffset> {
        let offset = addr
            .checked_sub(self.area.start())?
            .checked_sub(OVERHEAD)?;
        if offset < REGION_HEADER_SIZE
            || !offset.is_multiple_of(ALIGNMENT)
            || offset + OVERHEAD >= self.top_offset()
        {
            return None;
        }
        BlockOffset::new(offset)
    }

    fn previous_block(&self, block: BlockOffset) -> Option<BlockOffset> {
        if self.head() == block {
            return None;
        }
        let prev = self.block(block).prev;
        assert!(prev.is_some(), "block {block:?} is not the head but has no predecessor");
        prev
    }

    fn next_block(&self, block: BlockOffset) -> Option<BlockOffset> {
        if self.tail() == block {
            return None;
        }
        let next = self.block(block).next;
        assert!(next.is_some(), "block {block:?} is not the tail but has no successor");
        next
    }

    fn is_in_free_list(&self, block: BlockOffset) -> bool {
        self.block(block).prev_free.is_some() || self.header().free == Some(block)
    }

    fn add_to_free_list(&mut self, block: BlockOffset) {
        assert!(self.block(block).free, "adding used block {block:?} to the free order");
        let first = self.header().free;
        if let Some(first) = first {
            self.block_mut(first).prev_free = Some(block);
        }
        let header = self.block_mut(block);
        header.prev_free = None;
        header.next_free = first;
        self.header_mut().free = Some(block);
    }

    fn remove_from_free_list(&mut self, block: BlockOffset) {
        let BlockHeader {
            prev_free,
            next_free,
            ..
        } = *self.block(block);
        if let Some(prev) = prev_free {
            self.block_mut(prev).next_free = next_free;
        } else {
            assert_eq!(
                self.header().free,
                Some(block),
                "block {block:?} has no free-order predecessor but is not first"
            );
            self.header_mut().free = next_free;
        }
        if let Some(next) = next_free {
            self.block_mut(next).prev_free = prev_free;
        }
        let header = self.block_mut(block);
        header.prev_free = None;
        header.next_free = None;
    }

    /// Puts `new` at the position `old` holds in the free order.
    fn replace_in_free_list(&mut self, old: BlockOffset, new: BlockOffset) {
        let BlockHeader {
            prev_free,
            next_free,
            ..
        } = *self.block(old);
        if let Some(prev) = prev_free {
            self.block_mut(prev).next_free = Some(new);
        } else {
            assert_eq!(
                self.header().free,
                Some(old),
                "block {old:?} has no free-order predecessor but is not first"
            );
            self.header_mut().free = Some(new);
        }
        if let Some(next) = next_free {
            self.block_mut(next).prev_free = Some(new);
        }
        let header = self.block_mut(new);
        header.prev_free = prev_free;
        header.next_free = next_free;
        let header = self.block_mut(old);
        header.prev_free = None;
        header.next_free = None;
    }

    fn find_best_fit(&self, size: usize) -> Option<BlockOffset> {
        let mut best: Option<(BlockOffset, usize)> = None;
        let mut it = self.header().free;
        while let Some(b) = it {
            let block = self.block(b);
            assert!(block.free, "block {b:?} is on the free order but in use");
            if block.size >= size && best.is_none_or(|(_, best_size)| block.size < best_size) {
                best = Some((b, block.size));
                if block.size == size {
                    break;
                }
            }
            it = block.next_free;
        }
        best.map(|(b, _)| b)
    }

    /// Carves `size` bytes off the front of a free block.
    ///
    /// The remainder becomes a free block that takes over the original
    /// block's position in the free order; the front block leaves the free
    /// order.
    fn split(&mut self, block: BlockOffset, size: usize) {
        let header = *self.block(block);
        assert!(header.free, "splitting used block {block:?}");
        assert!(
            header.size - size >= MIN_SPLIT_REMAINDER,
            "block {block:?} is too small to split at {size:#x}"
        );
        debug!("splitting {}", self.info(block));

        let rest = block.following(size);
        self.write_block(
            rest,
            BlockHeader {
                prev: Some(block),
                next: header.next,
                ..BlockHeader::new(header.size - size - OVERHEAD, true)
            },
        );
        if let Some(next) = header.next {
            self.block_mut(next).prev = Some(rest);
        }
        let front = self.block_mut(block);
        front.size = size;
        front.next = Some(rest);
        self.replace_in_free_list(block, rest);
        if self.tail() == block {
            self.header_mut().tail = Some(rest);
        }

        debug!("into {} and {}", self.info(block), self.info(rest));
    }

    /// Absorbs `second` into `first`.
    ///
    /// Both blocks must be free and adjacent in address order. `second`
    /// leaves the free order; `first` keeps its position in it.
    fn merge(&mut self, first: BlockOffset, second: BlockOffset) {
        let a = *self.block(first);
        let b = *self.block(second);
        assert!(a.free, "the first block {first:?} is not free");
        assert!(b.free, "the second block {second:?} is not free");
        assert!(
            a.next == Some(second) && b.prev == Some(first) && a.end(first) == second.get(),
            "blocks {first:?} and {second:?} are not adjacent"
        );
        debug!("merging {} and {}", self.info(first), self.info(second));

        if self.is_in_free_list(second) {
            self.remove_from_free_list(second);
        }
        if let Some(next) = b.next {
            self.block_mut(next).prev = Some(first);
        }
        let merged = self.block_mut(first);
        merged.size += b.size + OVERHEAD;
        merged.next = b.next;
        if self.tail() == second {
            self.header_mut().tail = Some(first);
        }

        debug!("into {}", self.info(first));
    }

    /// Grows the heap and appends a used block of `size` bytes at the tail.
    fn append_block(&mut self, size: usize, increment: usize) -> Result<BlockOffset, HeapError> {
        let tail = self.tail();
        let top = self.advance_top(increment)?;

        let tail_header = *self.block(tail);
        assert!(tail_header.next.is_none(), "the tail block has a successor");
        let block = tail.following(tail_header.size);
        assert_eq!(
            self.area.start() + block.get(),
            top,
            "the heap top does not follow the tail block"
        );

        self.write_block(
            block,
            BlockHeader {
                prev: Some(tail),
                ..BlockHeader::new(size, false)
            },
        );
        self.block_mut(tail).next = Some(block);
        self.header_mut().tail = Some(block);
        Ok(block)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: HeapConfig = HeapConfig::new()
        .with_initial_size(4096)
        .with_reserved_size(64 * 1024);

    struct TestRegion<'a> {
        region: Region<'a>,
    }

    impl TestRegion<'_> {
        fn allocate(&mut self, size: usize) -> NonNull<u8> {
            let ptr = self.region.allocate(size).unwrap();
            unsafe {
                ptr.as_ptr().write_bytes(0x33, size);
            }
            self.region.check();
            ptr
        }

        unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
            unsafe {
                for i in 0..size {
                    assert_eq!(ptr.add(i).read(), 0x33);
                }
                ptr.as_ptr().write_bytes(0x55, size);
                self.region.release(ptr).unwrap();
            }
            self.region.check();
        }

        fn block_of(&self, ptr: NonNull<u8>) -> BlockInfo {
            self.region
                .blocks()
                .find(|b| b.payload_addr() == ptr.addr().get())
                .unwrap()
        }

        fn offset(&self, ptr: NonNull<u8>) -> usize {
            ptr.addr().get() - OVERHEAD - self.region.base()
        }
    }

    fn with_test_region<F>(config: HeapConfig, test_fn: F)
    where
        F: FnOnce(&mut TestRegion<'_>),
    {
        let mut mm = AddressSpace::new();
        let region = Region::create(&mut mm, &config).unwrap();
        test_fn(&mut TestRegion { region });
    }

    #[test]
    fn test_create() {
        with_test_region(SMALL, |t| {
            let region = &t.region;
            assert_eq!(region.base(), region.mm.start_brk);
            assert_eq!(region.top(), region.base() + REGION_HEADER_SIZE + OVERHEAD + 4096);
            assert_eq!(region.end(), region.base() + 64 * 1024);

            let blocks = region.blocks().collect::<Vec<_>>();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].offset, FIRST_BLOCK);
            assert_eq!(blocks[0].size, 4096);
            assert!(blocks[0].free);

            let stats = region.check();
            assert_eq!(
                stats,
                RegionStats {
                    blocks: 1,
                    free_blocks: 1,
                    used_bytes: 0,
                    free_bytes: 4096,
                    largest_free: 4096,
                }
            );
        });
    }

    #[test]
    fn test_open_existing_region() {
        let mut mm = AddressSpace::new();
        assert!(Region::open(&mut mm).is_none());
        let stats = {
            let mut region = Region::create(&mut mm, &SMALL).unwrap();
            region.allocate(100).unwrap();
            region.check()
        };
        let region = Region::open(&mut mm).unwrap();
        assert_eq!(region.check(), stats);
    }

    #[test]
    fn test_sizes_are_aligned() {
        with_test_region(SMALL, |t| {
            for size in [1, 15, 16, 17, 100, 255, 1000] {
                let ptr = t.allocate(size);
                assert!(ptr.addr().get().is_multiple_of(ALIGNMENT));
                let block = t.block_of(ptr);
                assert!(block.size >= size);
                assert!(block.size.is_multiple_of(ALIGNMENT));
                assert!(!block.free);
            }
        });
    }

    #[test]
    fn test_invalid_sizes() {
        with_test_region(SMALL, |t| {
            let before = t.region.check();
            assert!(matches!(
                t.region.allocate(0),
                Err(HeapError::ZeroSize { .. })
            ));
            assert!(matches!(
                t.region.allocate(usize::MAX),
                Err(HeapError::SizeOverflow { .. })
            ));
            assert!(matches!(
                t.region.allocate(usize::MAX - 15),
                Err(HeapError::SizeOverflow { .. })
            ));
            assert_eq!(t.region.check(), before);
        });
    }

    #[test]
    fn test_split_reuses_freed_block() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(128);
            let b = t.allocate(128);
            t.release(a, 128);

            let c = t.allocate(32);
            assert_eq!(c, a);

            let blocks = t.region.blocks().collect::<Vec<_>>();
            assert_eq!(blocks.len(), 4);
            assert_eq!((blocks[0].size, blocks[0].free), (32, false));
            assert_eq!((blocks[1].size, blocks[1].free), (128 - 32 - OVERHEAD, true));
            assert_eq!(blocks[2].payload_addr(), b.addr().get());
            assert!(blocks[3].free);

            // the remainder took the freed block's place at the front of the free order
            let free = t.region.free_blocks().collect::<Vec<_>>();
            assert_eq!(free.len(), 2);
            assert_eq!(free[0].offset, blocks[1].offset);
            assert_eq!(free[1].offset, blocks[3].offset);

            t.release(c, 32);
            t.release(b, 128);
            assert_eq!(t.region.check().blocks, 1);
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let _b = t.allocate(64);
            t.release(a, 64);

            // no 64/64/free/32 split: the 32 byte remainder cannot hold a header plus 16 bytes
            let c = t.allocate(32);
            assert_eq!(c, a);
            assert_eq!(t.block_of(c).size, 64);
            assert_eq!(t.region.check().free_blocks, 1);
        });
    }

    #[test]
    fn test_best_fit() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(256);
            let _s1 = t.allocate(16);
            let b = t.allocate(64);
            let _s2 = t.allocate(16);
            let c = t.allocate(128);
            let _s3 = t.allocate(16);
            t.release(a, 256);
            t.release(b, 64);
            t.release(c, 128);
            assert_eq!(t.region.check().free_blocks, 4);

            assert_eq!(t.allocate(60), b);
            assert_eq!(t.allocate(100), c);
            assert_eq!(t.allocate(200), a);
            assert_eq!(t.region.check().free_blocks, 1);
        });
    }

    #[test]
    fn test_equal_sizes_follow_free_order() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let _s1 = t.allocate(16);
            let b = t.allocate(64);
            let _s2 = t.allocate(16);
            t.release(a, 64);
            t.release(b, 64);

            // most recently freed first
            assert_eq!(t.allocate(64), b);
            assert_eq!(t.allocate(64), a);
        });
    }

    #[test]
    fn test_merge_with_both_neighbours() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let b = t.allocate(64);
            let c = t.allocate(64);
            let _d = t.allocate(64);
            t.release(a, 64);
            t.release(c, 64);
            assert_eq!(t.region.check().free_blocks, 3);

            t.release(b, 64);
            let stats = t.region.check();
            assert_eq!(stats.free_blocks, 2);
            let first = t.region.blocks().next().unwrap();
            assert_eq!(first.offset, FIRST_BLOCK);
            assert_eq!(first.size, 3 * 64 + 2 * OVERHEAD);
            assert!(first.free);
        });
    }

    #[test]
    fn test_merge_with_previous() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let b = t.allocate(64);
            let _c = t.allocate(64);
            t.release(a, 64);
            t.release(b, 64);

            let first = t.region.blocks().next().unwrap();
            assert_eq!(first.size, 2 * 64 + OVERHEAD);
            assert!(first.free);
            assert_eq!(t.region.check().free_blocks, 2);
        });
    }

    #[test]
    fn test_merge_with_next() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let b = t.allocate(64);
            let _c = t.allocate(64);
            t.release(b, 64);
            t.release(a, 64);

            let first = t.region.free_blocks().next().unwrap();
            assert_eq!(first.offset.get(), t.offset(a));
            assert_eq!(first.size, 2 * 64 + OVERHEAD);
            assert_eq!(t.region.check().free_blocks, 2);
        });
    }

    #[test]
    fn test_merge_into_tail() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let b = t.allocate(64);
            t.release(b, 64);
            t.release(a, 64);

            let blocks = t.region.blocks().collect::<Vec<_>>();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].size, 4096);
            assert!(blocks[0].free);
        });
    }

    #[test]
    fn test_round_trip_restores_free_capacity() {
        with_test_region(SMALL, |t| unsafe {
            let _pinned = t.allocate(32);
            for size in [1, 100, 1024, 4000 - 32 - OVERHEAD] {
                let before = t.region.check();
                let ptr = t.allocate(size);
                t.release(ptr, size);
                assert_eq!(t.region.check(), before, "size {size}");
            }
        });
    }

    #[test]
    fn test_growth_appends_block() {
        with_test_region(SMALL, |t| unsafe {
            let before = t.region.check();
            let top = t.region.top();

            let ptr = t.allocate(8192);
            assert_eq!(t.region.top(), top + 8192 + OVERHEAD);
            assert_eq!(ptr.addr().get(), top + OVERHEAD);
            let blocks = t.region.blocks().collect::<Vec<_>>();
            assert_eq!(blocks.len(), 2);
            assert!(blocks[0].free);
            assert_eq!((blocks[1].size, blocks[1].free), (8192, false));
            assert_eq!(t.region.tail(), blocks[1].offset);

            t.release(ptr, 8192);
            let after = t.region.check();
            assert_eq!(after.blocks, 1);
            assert_eq!(after.free_bytes, before.free_bytes + 8192 + OVERHEAD);
        });
    }

    #[test]
    fn test_growth_ceiling() {
        with_test_region(SMALL, |t| {
            let top = t.region.top();
            let before = t.region.check();
            assert!(matches!(
                t.region.allocate(64 * 1024),
                Err(HeapError::OutOfReservedRange { .. })
            ));
            assert_eq!(t.region.top(), top);
            assert_eq!(t.region.check(), before);

            // exactly up to the end of the reservation
            let rest = t.region.end() - top - OVERHEAD;
            t.allocate(rest);
            assert_eq!(t.region.top(), t.region.end());
            assert!(matches!(
                t.region.allocate(8192),
                Err(HeapError::OutOfReservedRange { .. })
            ));
            // the initial block still serves smaller requests
            t.allocate(4096);
            assert!(t.region.allocate(16).is_err());
        });
    }

    #[test]
    fn test_advance_top() {
        with_test_region(SMALL, |t| {
            let top = t.region.top();
            assert_eq!(t.region.advance_top(0).unwrap(), top);
            assert!(t.region.advance_top(usize::MAX).is_err());
            assert!(t.region.advance_top(t.region.end() - top + 1).is_err());
            assert_eq!(t.region.top(), top);
            assert_eq!(t.region.advance_top(t.region.end() - top).unwrap(), top);
            assert_eq!(t.region.top(), t.region.end());
        });
    }

    #[test]
    fn test_release_foreign_pointer() {
        with_test_region(SMALL, |t| unsafe {
            let before = t.region.check();
            let mut outside = 0_u128;
            let ptr = NonNull::from(&mut outside).cast::<u8>();
            assert!(matches!(
                t.region.release(ptr),
                Err(HeapError::NotInRegion { .. })
            ));

            let base = t.region.base();
            for addr in [base + OVERHEAD, base + REGION_HEADER_SIZE + OVERHEAD + 8, t.region.top()] {
                let ptr = NonNull::new(ptr::with_exposed_provenance_mut::<u8>(addr)).unwrap();
                assert!(matches!(
                    t.region.release(ptr),
                    Err(HeapError::NotInRegion { .. })
                ));
            }
            assert_eq!(t.region.check(), before);
        });
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free() {
        with_test_region(SMALL, |t| unsafe {
            let a = t.allocate(64);
            let _b = t.allocate(64);
            t.release(a, 64);
            let _ = t.region.release(a);
        });
    }

    #[test]
    fn test_default_heap_scenario() {
        with_test_region(HeapConfig::new(), |t| {
            let top = t.region.top();
            t.allocate(100);
            t.allocate(4_000_000);
            assert_eq!(t.region.top(), top, "served from the initial block");

            t.allocate(5_000_000);
            assert_eq!(t.region.top(), top + 5_000_000 + OVERHEAD);

            assert!(matches!(
                t.region.allocate(64 * 1024 * 1024),
                Err(HeapError::OutOfReservedRange { .. })
            ));
        });
    }

    #[test]
    fn test_random_workload() {
        with_test_region(SMALL, |t| unsafe {
            let mut seed = 0x2545_f491_u32;
            let mut next = move || {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345) & 0x7fff_ffff;
                seed as usize
            };

            let mut live = Vec::new();
            for _ in 0..2000 {
                if live.is_empty() || next() % 3 != 0 {
                    let size = next() % 700 + 1;
                    match t.region.allocate(size) {
                        Ok(ptr) => {
                            ptr.as_ptr().write_bytes(0x33, size);
                            live.push((ptr, size));
                        }
                        Err(HeapError::OutOfReservedRange { .. }) => {}
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                    t.region.check();
                } else {
                    let (ptr, size) = live.swap_remove(next() % live.len());
                    t.release(ptr, size);
                }
            }
            for (ptr, size) in live {
                t.release(ptr, size);
            }

            let stats = t.region.check();
            assert_eq!(stats.blocks, 1);
            assert_eq!(
                stats.free_bytes,
                t.region.top() - t.region.base() - REGION_HEADER_SIZE - OVERHEAD
            );
        });
    }
}
