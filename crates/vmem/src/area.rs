use core::{fmt, ops::Range};

use bitflags::bitflags;

bitflags! {
    /// Protection and placement flags of a virtual memory area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// The area is readable and writable.
        const RW = 1 << 0;

        /// Pages are backed as soon as the area is created.
        const PRESENT = 1 << 1;

        /// Userspace can access the area.
        const USER = 1 << 2;

        /// The requested base is a hint.
        ///
        /// If set, the area may be placed at another address when the
        /// requested one cannot be honoured.
        const UPDADDR = 1 << 3;
    }
}

/// Page allocation policy used to back an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocClass {
    /// Pages for kernel-internal data.
    Kernel,
    /// Pages for user data, taken from low memory.
    User,
    /// Pages for user data, preferring high memory.
    HighUser,
}

impl AllocClass {
    pub(crate) const ALL: [Self; 3] = [Self::Kernel, Self::User, Self::HighUser];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Kernel => 0,
            Self::User => 1,
            Self::HighUser => 2,
        }
    }
}

/// A contiguous, page-granular range of virtual memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmArea {
    start: usize,
    end: usize,
    flags: MapFlags,
    class: AllocClass,
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmArea")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("flags", &self.flags)
            .field("class", &self.class)
            .finish()
    }
}

impl VmArea {
    pub(crate) fn new(range: Range<usize>, flags: MapFlags, class: AllocClass) -> Self {
        assert!(range.start < range.end, "empty area: {range:#x?}");
        Self {
            start: range.start,
            end: range.end,
            flags,
            class,
        }
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    #[must_use]
    pub fn class(&self) -> AllocClass {
        self.class
    }

    /// Returns `true` if `addr` lies in `start..end`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Returns `true` if `addr` lies strictly between `start` and `end`.
    #[must_use]
    pub fn strictly_contains(&self, addr: usize) -> bool {
        self.start < addr && addr < self.end
    }

    pub(crate) fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}
