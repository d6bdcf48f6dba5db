use snafu::ensure;
use vmem::{AllocClass, Align as _, MapFlags};

use crate::{
    ALIGNMENT, OVERHEAD,
    error::{HeapError, InvalidConfigSnafu},
    region::REGION_HEADER_SIZE,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Shape of a heap region, fixed when the region is created.
///
/// The region reserves `reserved_size` bytes of virtual memory at (or near)
/// `base`. Right after the region header sits a single free block of
/// `initial_size` usable bytes; everything between the end of that block and
/// the end of the reservation is only handed out through the growth
/// primitive.
///
/// ```
/// use heap::HeapConfig;
///
/// let config = HeapConfig::new()
///     .with_initial_size(64 * 1024)
///     .with_reserved_size(1024 * 1024);
/// assert_eq!(config.initial_size(), 64 * 1024);
/// assert_eq!(config.base(), HeapConfig::DEFAULT_BASE);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    base: usize,
    initial_size: usize,
    reserved_size: usize,
    flags: MapFlags,
    class: AllocClass,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    pub const DEFAULT_BASE: usize = 0x4000_0000;
    pub const DEFAULT_INITIAL_SIZE: usize = 4 * MIB;
    pub const DEFAULT_RESERVED_SIZE: usize = 32 * MIB;
    pub const DEFAULT_FLAGS: MapFlags = MapFlags::RW
        .union(MapFlags::PRESENT)
        .union(MapFlags::USER)
        .union(MapFlags::UPDADDR);

    /// Configuration of a user process heap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: Self::DEFAULT_BASE,
            initial_size: Self::DEFAULT_INITIAL_SIZE,
            reserved_size: Self::DEFAULT_RESERVED_SIZE,
            flags: Self::DEFAULT_FLAGS,
            class: AllocClass::HighUser,
        }
    }

    /// Configuration of the kernel's own heap.
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            base: 0xc100_0000,
            initial_size: Self::DEFAULT_INITIAL_SIZE,
            reserved_size: Self::DEFAULT_RESERVED_SIZE,
            flags: MapFlags::RW
                .union(MapFlags::PRESENT)
                .union(MapFlags::UPDADDR),
            class: AllocClass::Kernel,
        }
    }

    #[must_use]
    pub const fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub const fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    #[must_use]
    pub const fn with_reserved_size(mut self, reserved_size: usize) -> Self {
        self.reserved_size = reserved_size;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_class(mut self, class: AllocClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn initial_size(&self) -> usize {
        self.initial_size
    }

    #[must_use]
    pub const fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    #[must_use]
    pub const fn flags(&self) -> MapFlags {
        self.flags
    }

    #[must_use]
    pub const fn class(&self) -> AllocClass {
        self.class
    }

    /// Bytes between the region base and the end of the initial block.
    pub(crate) const fn bootstrap_size(&self) -> usize {
        REGION_HEADER_SIZE + OVERHEAD + self.initial_size
    }

    pub(crate) fn validate(&self) -> Result<(), HeapError> {
        ensure!(
            self.base.is_page_aligned(),
            InvalidConfigSnafu {
                reason: "base must be page aligned",
            }
        );
        ensure!(
            self.initial_size > 0 && self.initial_size.is_multiple_of(ALIGNMENT),
            InvalidConfigSnafu {
                reason: "initial size must be a non-zero multiple of the block alignment",
            }
        );
        ensure!(
            self.initial_size
                .checked_add(REGION_HEADER_SIZE + OVERHEAD)
                .is_some_and(|size| size <= self.reserved_size),
            InvalidConfigSnafu {
                reason: "reservation cannot hold the region header and the initial block",
            }
        );
        Ok(())
    }
}
