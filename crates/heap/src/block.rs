//! Block headers embedded in the managed memory.
//!
//! Every block starts with a [`BlockHeader`] followed by its usable bytes:
//!
//! ```text
//! ┌────────────────────────────────────────────┬──────────────────────┐
//! │ BlockHeader (OVERHEAD bytes)               │ usable (size bytes)  │
//! │ size │ free │ prev │ next │ prev_free │ .. │                      │
//! └────────────────────────────────────────────┴──────────────────────┘
//! ^ block offset                               ^ pointer handed out
//! ```
//!
//! Links are [`BlockOffset`]s relative to the region base rather than raw
//! pointers, so every dereference can be bounds-checked against the heap top.

use core::{
    fmt::{self, Write as _},
    num::NonZeroUsize,
};

use arrayvec::ArrayString;

/// Alignment of block sizes and of every pointer handed out.
pub const ALIGNMENT: usize = 16;

/// Bytes taken by the header in front of every block.
pub const OVERHEAD: usize = size_of::<BlockHeader>();
const _: () = assert!(OVERHEAD % ALIGNMENT == 0);
const _: () = assert!(align_of::<BlockHeader>() == ALIGNMENT);

/// Rounds a requested size up to the block alignment.
///
/// Returns `None` if the rounded size does not fit in `usize`.
#[must_use]
pub fn round_size(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(ALIGNMENT)
}

/// Position of a block header, in bytes from the start of its region.
///
/// Offset zero always holds the region header, so a block offset is never
/// zero and `Option<BlockOffset>` is as small as a `usize`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockOffset(NonZeroUsize);

impl fmt::Debug for BlockOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

impl BlockOffset {
    #[must_use]
    pub const fn new(offset: usize) -> Option<Self> {
        match NonZeroUsize::new(offset) {
            Some(offset) => Some(Self(offset)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// Offset of the first usable byte of the block.
    #[must_use]
    pub const fn payload(self) -> usize {
        self.get() + OVERHEAD
    }

    /// Offset right past a block of `size` usable bytes starting here.
    pub(crate) fn following(self, size: usize) -> Self {
        let offset = self
            .0
            .checked_add(OVERHEAD + size)
            .expect("block offset overflows the address space");
        Self(offset)
    }
}

/// Metadata stored in front of every block.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    /// Usable bytes following the header, a multiple of [`ALIGNMENT`].
    pub(crate) size: usize,
    /// Whether the block is on the free chain.
    pub(crate) free: bool,
    /// Previous block in address order.
    pub(crate) prev: Option<BlockOffset>,
    /// Next block in address order.
    pub(crate) next: Option<BlockOffset>,
    /// Previous block in free order.
    pub(crate) prev_free: Option<BlockOffset>,
    /// Next block in free order.
    pub(crate) next_free: Option<BlockOffset>,
}

impl BlockHeader {
    pub(crate) const fn new(size: usize, free: bool) -> Self {
        Self {
            size,
            free,
            prev: None,
            next: None,
            prev_free: None,
            next_free: None,
        }
    }

    /// Offset one past the last usable byte of the block at `offset`.
    pub(crate) fn end(&self, offset: BlockOffset) -> usize {
        offset.following(self.size).get()
    }
}

/// Snapshot of one block, as reported by the region diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position of the header inside the region.
    pub offset: BlockOffset,
    /// Address of the header.
    pub addr: usize,
    /// Usable bytes.
    pub size: usize,
    pub free: bool,
}

impl BlockInfo {
    /// Address of the first usable byte.
    #[must_use]
    pub fn payload_addr(&self) -> usize {
        self.addr + OVERHEAD
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} [{:>10}]({})",
            self.addr,
            HumanSize(self.size),
            u8::from(self.free)
        )
    }
}

/// Byte count rendered with a binary unit, e.g. `4.00 MiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        let mut whole = self.0;
        let mut rem = 0;
        let mut unit = 0;
        while whole >= 1024 && unit < UNITS.len() - 1 {
            rem = whole % 1024;
            whole /= 1024;
            unit += 1;
        }
        // rendered on the stack: this runs inside the allocator
        let mut buf = ArrayString::<32>::new();
        if unit == 0 {
            write!(buf, "{whole} B")?;
        } else {
            let hundredths = rem * 100 / 1024;
            write!(buf, "{whole}.{hundredths:02} {}", UNITS[unit])?;
        }
        f.pad(&buf)
    }
}
