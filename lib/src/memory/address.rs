use core::fmt;

use super::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);

/// Page-table level, counted from the leaf (`One`) to the root (`Four`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableLevel {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl TableLevel {
    pub const fn next_lower(self) -> Option<Self> {
        match self {
            Self::Four => Some(Self::Three),
            Self::Three => Some(Self::Two),
            Self::Two => Some(Self::One),
            Self::One => None,
        }
    }

    /// Bytes covered by a single entry at this level.
    pub const fn entry_span(self) -> usize {
        PAGE_SIZE << (9 * (self as usize - 1))
    }
}

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    pub const fn page_align(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self(align_up(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(&self) -> bool {
        (self.0 & (PAGE_SIZE - 1)) == 0
    }

    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn frame_index(&self) -> usize {
        self.0 / PAGE_SIZE
    }

    pub const fn from_frame_index(index: usize) -> Self {
        Self(index * PAGE_SIZE)
    }
}

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn page_align(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self(align_up(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(&self) -> bool {
        (self.0 & (PAGE_SIZE - 1)) == 0
    }

    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn page_index(&self) -> usize {
        self.0 / PAGE_SIZE
    }

    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Index into the page table at `level` that this address selects.
    pub const fn table_index(&self, level: TableLevel) -> usize {
        (self.0 >> (12 + 9 * (level as usize - 1))) & 0x1ff
    }

    /// Bits 48..64 must be copies of bit 47.
    pub const fn is_canonical(&self) -> bool {
        let upper = (self.0 as u64) >> 47;
        upper == 0 || upper == 0x1_ffff
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<PhysicalAddress> for x86_64::PhysAddr {
    fn from(addr: PhysicalAddress) -> Self {
        x86_64::PhysAddr::new(addr.as_u64())
    }
}

impl From<x86_64::PhysAddr> for PhysicalAddress {
    fn from(addr: x86_64::PhysAddr) -> Self {
        Self::new(addr.as_u64() as usize)
    }
}

impl From<x86_64::VirtAddr> for VirtualAddress {
    fn from(addr: x86_64::VirtAddr) -> Self {
        Self::new(addr.as_u64() as usize)
    }
}

/// Half-open range of virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl VirtualRange {
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    pub const fn from_size(start: VirtualAddress, size: usize) -> Self {
        Self {
            start,
            end: VirtualAddress::new(start.as_usize() + size),
        }
    }

    pub const fn size(&self) -> usize {
        self.end.as_usize().saturating_sub(self.start.as_usize())
    }

    pub const fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_usize() >= self.start.as_usize() && addr.as_usize() < self.end.as_usize()
    }

    pub const fn overlaps(&self, other: &VirtualRange) -> bool {
        self.start.as_usize() < other.end.as_usize() && other.start.as_usize() < self.end.as_usize()
    }

    /// Page-aligned start addresses of every page touched by the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> {
        let first = self.start.page_align().as_usize();
        let end = self.end.align_up().as_usize();
        (first..end).step_by(PAGE_SIZE).map(VirtualAddress::new)
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
