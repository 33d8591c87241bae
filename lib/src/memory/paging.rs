//! Four-level x86_64 page tables.
//!
//! [`AddressSpace`] edits the hierarchy rooted at a PML4 frame. Tables are reached
//! through a [`PhysicalMapper`], which in the kernel is the bootloader's higher-half
//! direct map and in tests is a plain host buffer.

use bitflags::bitflags;
use core::{
    error::Error,
    fmt::{Display, Formatter},
    ptr,
};
use heapless::Vec;
use log::{debug, trace, warn};
use x86_64::structures::{
    idt::PageFaultErrorCode,
    paging::{page_table::PageTableEntry, PageTable, PageTableFlags},
};

use super::{
    address::{checked_align_up, PhysicalAddress, TableLevel, VirtualAddress, VirtualRange},
    physical::PhysicalMemoryManager,
    PAGE_SIZE,
};

pub const MAX_PROTECTED_RANGES: usize = 16;
pub const MAX_DEMAND_REGIONS: usize = 16;

pub trait PhysicalMapper {
    /// Virtual address through which the physical address can be dereferenced
    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress;
}

/// Physical memory visible at a constant offset, as with a higher-half direct map.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMapper {
    offset: usize,
}

impl OffsetMapper {
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl PhysicalMapper for OffsetMapper {
    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(phys.as_usize()))
    }
}

pub trait VirtualMemoryManager {
    /// Maps a virtual page to a physical frame with specified flags
    fn map<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<MapFlush, MapError>;

    /// Maps a virtual page, replacing any existing mapping and returning its frame
    fn remap<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<(Option<PhysicalAddress>, MapFlush), MapError>;

    /// Unmaps a virtual page and hands its frame back to the caller
    fn unmap<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        frames: &mut F,
    ) -> Result<(PhysicalAddress, MapFlush), UnmapError>;

    /// Walks the tables for a virtual address
    fn translate(&self, virtual_addr: VirtualAddress) -> Result<Translation, TranslateError>;

    fn translate_addr(
        &self,
        virtual_addr: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        self.translate(virtual_addr).map(|t| t.address)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4KiB => PAGE_SIZE,
            Self::Size2MiB => PAGE_SIZE * 512,
            Self::Size1GiB => PAGE_SIZE * 512 * 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Start of the frame (or huge frame) backing the page
    pub frame: PhysicalAddress,
    /// Exact physical address of the translated byte
    pub address: PhysicalAddress,
    pub flags: PageFlags,
    pub size: PageSize,
}

/// A page whose TLB entry may be stale.
#[derive(Debug)]
#[must_use = "page must be flushed from the TLB or explicitly ignored"]
pub struct MapFlush(VirtualAddress);

impl MapFlush {
    pub fn page(&self) -> VirtualAddress {
        self.0
    }

    #[cfg(target_arch = "x86_64")]
    pub fn flush(self) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(self.0.as_u64()));
    }

    pub fn ignore(self) {}
}

/// Every page in the range may have a stale TLB entry.
#[derive(Debug)]
#[must_use = "range must be flushed from the TLB or explicitly ignored"]
pub struct RangeFlush(VirtualRange);

impl RangeFlush {
    pub fn range(&self) -> VirtualRange {
        self.0
    }

    #[cfg(target_arch = "x86_64")]
    pub fn flush(self) {
        for page in self.0.pages() {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(page.as_u64()));
        }
    }

    pub fn ignore(self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandRegion {
    pub range: VirtualRange,
    pub flags: PageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    NoPhysicalMemory,
    InvalidAddress,
    HugePageConflict,
    Protected,
    RegionTableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    NotMapped,
    InvalidAddress,
    HugePage,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    NotMapped,
    InvalidAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The page was present; the access broke its permissions.
    ProtectionViolation,
    /// Nothing is supposed to live at the faulting address.
    NotDemandPaged,
    OutOfMemory,
    Map(MapError),
}

pub struct AddressSpace<M: PhysicalMapper> {
    root: PhysicalAddress,
    mapper: M,
    protected: Vec<VirtualRange, MAX_PROTECTED_RANGES>,
    demand: Vec<DemandRegion, MAX_DEMAND_REGIONS>,
}

impl<M: PhysicalMapper> AddressSpace<M> {
    /// Takes over an existing hierarchy, such as the one the bootloader left in CR3.
    ///
    /// # Safety
    /// `root` must be a valid PML4 frame reachable through `mapper`, and nothing else
    /// may edit the hierarchy while this address space exists.
    pub unsafe fn from_root(root: PhysicalAddress, mapper: M) -> Self {
        Self {
            root,
            mapper,
            protected: Vec::new(),
            demand: Vec::new(),
        }
    }

    /// Builds an empty hierarchy with a freshly allocated root table.
    pub fn create<F: PhysicalMemoryManager + ?Sized>(
        mapper: M,
        frames: &mut F,
    ) -> Result<Self, MapError> {
        let root = frames
            .allocate_frame()
            .map_err(|_| MapError::NoPhysicalMemory)?;
        let space = Self {
            root,
            mapper,
            protected: Vec::new(),
            demand: Vec::new(),
        };
        unsafe { space.zero_frame(root) };
        debug!("Created address space with root {:#x}", root);

        Ok(space)
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Marks a range that later map, remap and unmap calls must leave alone.
    /// Every page the range touches is protected, including partial ones at either end.
    pub fn protect(&mut self, range: VirtualRange) -> Result<(), MapError> {
        let end = checked_align_up(range.end.as_usize(), PAGE_SIZE).ok_or(MapError::InvalidAddress)?;
        let range = VirtualRange::new(range.start.page_align(), VirtualAddress::new(end));
        self.protected
            .push(range)
            .map_err(|_| MapError::RegionTableFull)?;
        debug!(
            "Protected {:#x}..{:#x}",
            range.start.as_usize(),
            range.end.as_usize()
        );

        Ok(())
    }

    pub fn is_protected(&self, addr: VirtualAddress) -> bool {
        self.protected.iter().any(|r| r.contains(addr))
    }

    /// Registers a range whose pages are mapped to zeroed frames on first touch.
    pub fn add_demand_region(
        &mut self,
        range: VirtualRange,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !range.start.is_page_aligned() || !range.end.is_page_aligned() {
            return Err(MapError::InvalidAddress);
        }
        if self.protected.iter().any(|p| p.overlaps(&range)) {
            return Err(MapError::Protected);
        }
        self.demand
            .push(DemandRegion { range, flags })
            .map_err(|_| MapError::RegionTableFull)
    }

    /// Decides whether a page fault at `addr` is recoverable and, if so, resolves it.
    pub fn handle_page_fault<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        addr: VirtualAddress,
        error_code: PageFaultErrorCode,
        frames: &mut F,
    ) -> Result<MapFlush, FaultError> {
        if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            return Err(FaultError::ProtectionViolation);
        }
        let region = self
            .demand
            .iter()
            .find(|r| r.range.contains(addr))
            .copied()
            .ok_or(FaultError::NotDemandPaged)?;
        if error_code.contains(PageFaultErrorCode::USER_MODE)
            && !region.flags.contains(PageFlags::USER)
        {
            return Err(FaultError::ProtectionViolation);
        }

        let page = addr.page_align();
        let frame = frames
            .allocate_frame()
            .map_err(|_| FaultError::OutOfMemory)?;
        unsafe { self.zero_frame(frame) };

        match self.map(page, frame, region.flags, frames) {
            Ok(flush) => {
                trace!("Demand-mapped {:#x} -> {:#x}", page, frame);
                Ok(flush)
            }
            // Mapped since the faulting access was decoded; only the TLB is stale.
            Err(MapError::AlreadyMapped) => {
                if let Err(free) = frames.free_frame(frame) {
                    warn!("Could not release frame after failed fault: {}", free);
                }
                trace!("Demand fault at {:#x} was already resolved", page);
                Ok(MapFlush(page))
            }
            Err(e) => {
                if let Err(free) = frames.free_frame(frame) {
                    warn!("Could not release frame after failed fault: {}", free);
                }
                Err(match e {
                    MapError::NoPhysicalMemory => FaultError::OutOfMemory,
                    other => FaultError::Map(other),
                })
            }
        }
    }

    /// Maps `size` bytes of contiguous physical memory, rolling back on failure.
    pub fn map_range<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        size: usize,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<RangeFlush, MapError> {
        let range = VirtualRange::from_size(virtual_addr, size);
        for (i, page) in range.pages().enumerate() {
            let frame = physical_addr.offset(i * PAGE_SIZE);
            match self.map(page, frame, flags, frames) {
                Ok(flush) => flush.ignore(),
                Err(e) => {
                    for mapped in range.pages().take(i) {
                        if let Ok((_, flush)) = self.unmap(mapped, frames) {
                            flush.ignore();
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(RangeFlush(range))
    }

    /// Backs every page of `range` with a fresh zeroed frame.
    pub fn map_anonymous<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        range: VirtualRange,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<RangeFlush, MapError> {
        for (i, page) in range.pages().enumerate() {
            if let Err(e) = self.map_fresh_frame(page, flags, frames) {
                let done = VirtualRange::from_size(range.start.page_align(), i * PAGE_SIZE);
                self.unmap_anonymous(done, frames).ignore();
                return Err(e);
            }
        }
        debug!(
            "Mapped anonymous {:#x}..{:#x}",
            range.start.as_usize(),
            range.end.as_usize()
        );

        Ok(RangeFlush(range))
    }

    /// Unmaps every mapped page of `range` and frees the frames behind them.
    pub fn unmap_anonymous<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        range: VirtualRange,
        frames: &mut F,
    ) -> RangeFlush {
        for page in range.pages() {
            if let Ok((frame, flush)) = self.unmap(page, frames) {
                flush.ignore();
                if let Err(e) = frames.free_frame(frame) {
                    warn!("Could not release frame {:#x}: {}", frame, e);
                }
            }
        }

        RangeFlush(range)
    }

    fn map_fresh_frame<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        page: VirtualAddress,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<(), MapError> {
        let frame = frames
            .allocate_frame()
            .map_err(|_| MapError::NoPhysicalMemory)?;
        unsafe { self.zero_frame(frame) };

        match self.map(page, frame, flags, frames) {
            Ok(flush) => {
                flush.ignore();
                Ok(())
            }
            Err(e) => {
                if let Err(free) = frames.free_frame(frame) {
                    warn!("Could not release frame {:#x}: {}", frame, free);
                }
                Err(e)
            }
        }
    }

    fn table(&self, phys: PhysicalAddress) -> *mut PageTable {
        self.mapper.phys_to_virt(phys).as_mut_ptr()
    }

    unsafe fn zero_frame(&self, frame: PhysicalAddress) {
        ptr::write_bytes(self.mapper.phys_to_virt(frame).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }

    fn check_page(addr: VirtualAddress) -> bool {
        addr.is_page_aligned() && addr.is_canonical()
    }

    /// Returns the table an entry points to, creating it when absent.
    fn next_table_create<F: PhysicalMemoryManager + ?Sized>(
        &self,
        entry: &mut PageTableEntry,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<PhysicalAddress, MapError> {
        let mut parent_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if flags.contains(PageFlags::USER) {
            parent_flags |= PageTableFlags::USER_ACCESSIBLE;
        }

        let current = entry.flags();
        if !current.contains(PageTableFlags::PRESENT) {
            let frame = frames
                .allocate_frame()
                .map_err(|_| MapError::NoPhysicalMemory)?;
            unsafe { self.zero_frame(frame) };
            entry.set_addr(frame.into(), parent_flags);
            trace!("Allocated page table at {:#x}", frame);
            return Ok(frame);
        }
        if current.contains(PageTableFlags::HUGE_PAGE) {
            return Err(MapError::HugePageConflict);
        }
        // The leaf decides the final permissions, parents only need to allow them.
        if !current.contains(parent_flags) {
            entry.set_flags(current | parent_flags);
        }

        Ok(entry.addr().into())
    }

    fn map_entry<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        flags: PageFlags,
        frames: &mut F,
        overwrite: bool,
    ) -> Result<(Option<PhysicalAddress>, MapFlush), MapError> {
        if !Self::check_page(virtual_addr) || !physical_addr.is_page_aligned() {
            return Err(MapError::InvalidAddress);
        }
        if self.is_protected(virtual_addr) {
            return Err(MapError::Protected);
        }

        let mut table = self.table(self.root);
        for level in [TableLevel::Four, TableLevel::Three, TableLevel::Two] {
            let entry = unsafe { &mut (&mut *table)[virtual_addr.table_index(level)] };
            match self.next_table_create(entry, flags, frames) {
                Ok(next) => table = self.table(next),
                Err(e) => {
                    self.reclaim_tables(virtual_addr, frames);
                    return Err(e);
                }
            }
        }

        let entry = unsafe { &mut (&mut *table)[virtual_addr.table_index(TableLevel::One)] };
        let previous = if entry.flags().contains(PageTableFlags::PRESENT) {
            if !overwrite {
                return Err(MapError::AlreadyMapped);
            }
            Some(entry.addr().into())
        } else {
            None
        };

        entry.set_addr(
            physical_addr.into(),
            PageTableFlags::from(flags | PageFlags::PRESENT),
        );
        trace!("Mapped {:#x} -> {:#x}", virtual_addr, physical_addr);

        Ok((previous, MapFlush(virtual_addr)))
    }

    /// Frees intermediate tables on the path to `virtual_addr` that no longer map anything.
    ///
    /// Only tables allocated from `frames` are released; loader-built tables and the
    /// root stay in place.
    fn reclaim_tables<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        frames: &mut F,
    ) {
        let mut parents: [(*mut PageTable, usize); 3] = [(ptr::null_mut(), 0); 3];
        let mut depth = 0;
        let mut table = self.table(self.root);
        for level in [TableLevel::Four, TableLevel::Three, TableLevel::Two] {
            let index = virtual_addr.table_index(level);
            let flags = unsafe { (&*table)[index].flags() };
            if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE)
            {
                break;
            }
            parents[depth] = (table, index);
            depth += 1;
            table = self.table(unsafe { (&*table)[index].addr() }.into());
        }

        while depth > 0 {
            depth -= 1;
            let (parent, index) = parents[depth];
            let entry = unsafe { &mut (&mut *parent)[index] };
            let child: PhysicalAddress = entry.addr().into();
            let empty = unsafe { (&*self.table(child)).iter().all(PageTableEntry::is_unused) };
            if !empty || !frames.owns_frame(child) {
                break;
            }

            entry.set_unused();
            if let Err(e) = frames.free_frame(child) {
                warn!("Could not release page table {:#x}: {}", child, e);
                break;
            }
            trace!("Reclaimed page table {:#x}", child);
        }
    }

    fn leaf_entry(&self, virtual_addr: VirtualAddress) -> Result<*mut PageTableEntry, UnmapError> {
        let mut table = self.table(self.root);
        for level in [TableLevel::Four, TableLevel::Three, TableLevel::Two] {
            let entry = unsafe { &(&*table)[virtual_addr.table_index(level)] };
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return Err(UnmapError::NotMapped);
            }
            if flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(UnmapError::HugePage);
            }
            table = self.table(entry.addr().into());
        }

        Ok(unsafe { &mut (&mut *table)[virtual_addr.table_index(TableLevel::One)] as *mut PageTableEntry })
    }
}

impl<M: PhysicalMapper> VirtualMemoryManager for AddressSpace<M> {
    fn map<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<MapFlush, MapError> {
        self.map_entry(virtual_addr, physical_addr, flags, frames, false)
            .map(|(_, flush)| flush)
    }

    fn remap<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        physical_addr: PhysicalAddress,
        flags: PageFlags,
        frames: &mut F,
    ) -> Result<(Option<PhysicalAddress>, MapFlush), MapError> {
        self.map_entry(virtual_addr, physical_addr, flags, frames, true)
    }

    fn unmap<F: PhysicalMemoryManager + ?Sized>(
        &mut self,
        virtual_addr: VirtualAddress,
        frames: &mut F,
    ) -> Result<(PhysicalAddress, MapFlush), UnmapError> {
        if !Self::check_page(virtual_addr) {
            return Err(UnmapError::InvalidAddress);
        }
        if self.is_protected(virtual_addr) {
            return Err(UnmapError::Protected);
        }

        let entry = unsafe { &mut *self.leaf_entry(virtual_addr)? };
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(UnmapError::NotMapped);
        }
        let frame = entry.addr().into();
        entry.set_unused();
        self.reclaim_tables(virtual_addr, frames);
        trace!("Unmapped {:#x} (was {:#x})", virtual_addr, frame);

        Ok((frame, MapFlush(virtual_addr)))
    }

    fn translate(&self, virtual_addr: VirtualAddress) -> Result<Translation, TranslateError> {
        if !virtual_addr.is_canonical() {
            return Err(TranslateError::InvalidAddress);
        }

        let mut table = self.table(self.root);
        let mut level = TableLevel::Four;
        loop {
            let entry = unsafe { &(&*table)[virtual_addr.table_index(level)] };
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return Err(TranslateError::NotMapped);
            }

            let size = match level {
                TableLevel::One => Some(PageSize::Size4KiB),
                TableLevel::Two if flags.contains(PageTableFlags::HUGE_PAGE) => {
                    Some(PageSize::Size2MiB)
                }
                TableLevel::Three if flags.contains(PageTableFlags::HUGE_PAGE) => {
                    Some(PageSize::Size1GiB)
                }
                _ => None,
            };
            if let Some(size) = size {
                let frame = PhysicalAddress::new(
                    entry.addr().as_u64() as usize & !(size.bytes() - 1),
                );
                let offset = virtual_addr.as_usize() & (size.bytes() - 1);
                return Ok(Translation {
                    frame,
                    address: frame.offset(offset),
                    flags: PageFlags::from(flags),
                    size,
                });
            }

            table = self.table(entry.addr().into());
            level = match level.next_lower() {
                Some(lower) => lower,
                None => return Err(TranslateError::NotMapped),
            };
        }
    }
}

impl From<PageFlags> for PageTableFlags {
    fn from(flags: PageFlags) -> Self {
        let mut x86_flags = PageTableFlags::empty();

        if flags.contains(PageFlags::PRESENT) {
            x86_flags |= PageTableFlags::PRESENT;
        }
        if flags.contains(PageFlags::WRITABLE) {
            x86_flags |= PageTableFlags::WRITABLE;
        }
        if flags.contains(PageFlags::USER) {
            x86_flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if flags.contains(PageFlags::WRITE_THROUGH) {
            x86_flags |= PageTableFlags::WRITE_THROUGH;
        }
        if flags.contains(PageFlags::NO_CACHE) {
            x86_flags |= PageTableFlags::NO_CACHE;
        }
        if flags.contains(PageFlags::ACCESSED) {
            x86_flags |= PageTableFlags::ACCESSED;
        }
        if flags.contains(PageFlags::DIRTY) {
            x86_flags |= PageTableFlags::DIRTY;
        }
        if flags.contains(PageFlags::HUGE_PAGE) {
            x86_flags |= PageTableFlags::HUGE_PAGE;
        }
        if flags.contains(PageFlags::GLOBAL) {
            x86_flags |= PageTableFlags::GLOBAL;
        }
        if flags.contains(PageFlags::NO_EXECUTE) {
            x86_flags |= PageTableFlags::NO_EXECUTE;
        }

        x86_flags
    }
}

impl From<PageTableFlags> for PageFlags {
    fn from(flags: PageTableFlags) -> Self {
        // Same bit positions; anything the kernel does not model is dropped.
        PageFlags::from_bits_truncate(flags.bits())
    }
}

impl Display for MapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use MapError::*;
        let message = match self {
            AlreadyMapped => "already mapped",
            NoPhysicalMemory => "no physical memory",
            InvalidAddress => "invalid address",
            HugePageConflict => "covered by a huge page",
            Protected => "protected range",
            RegionTableFull => "region table full",
        };

        write!(f, "{}", message)
    }
}

impl Display for UnmapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use UnmapError::*;
        let message = match self {
            NotMapped => "not mapped",
            InvalidAddress => "invalid address",
            HugePage => "covered by a huge page",
            Protected => "protected range",
        };

        write!(f, "{}", message)
    }
}

impl Display for TranslateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use TranslateError::*;
        let message = match self {
            NotMapped => "not mapped",
            InvalidAddress => "invalid address",
        };

        write!(f, "{}", message)
    }
}

impl Display for FaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use FaultError::*;
        match self {
            ProtectionViolation => write!(f, "protection violation"),
            NotDemandPaged => write!(f, "address is not demand paged"),
            OutOfMemory => write!(f, "out of memory"),
            Map(e) => write!(f, "mapping failed: {}", e),
        }
    }
}

impl Error for MapError {}
impl Error for UnmapError {}
impl Error for TranslateError {}
impl Error for FaultError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{boot::MemoryRegion, memory::physical::BitmapFrameAllocator};
    use bitmap_allocator::BitAlloc4K;

    const RAM_BASE: usize = 0x10_0000;

    /// A 4 KiB-aligned raw frame standing in for physical RAM.
    #[repr(align(4096))]
    struct Aligned4K([u8; PAGE_SIZE]);

    /// Simulated physical memory at `RAM_BASE` plus a frame allocator over it.
    struct TestMachine {
        ram: std::vec::Vec<Aligned4K>,
        pmm: Box<BitmapFrameAllocator<BitAlloc4K>>,
    }

    impl TestMachine {
        fn with_frames(n: usize) -> Self {
            let ram = (0..n).map(|_| Aligned4K([0; PAGE_SIZE])).collect();
            let mut pmm = Box::new(BitmapFrameAllocator::new());
            pmm.initialize(&[MemoryRegion::usable(RAM_BASE, n * PAGE_SIZE)]);
            Self { ram, pmm }
        }

        fn mapper(&self) -> OffsetMapper {
            OffsetMapper::new((self.ram.as_ptr() as usize).wrapping_sub(RAM_BASE))
        }

        fn space(&mut self) -> AddressSpace<OffsetMapper> {
            let mapper = self.mapper();
            AddressSpace::create(mapper, self.pmm.as_mut()).unwrap()
        }

        fn frame(&mut self) -> PhysicalAddress {
            self.pmm.allocate_frame().unwrap()
        }

        fn bytes(&self, frame: PhysicalAddress) -> &[u8] {
            &self.ram[(frame.as_usize() - RAM_BASE) / PAGE_SIZE].0
        }
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn translate_returns_what_was_mapped() {
        let mut machine = TestMachine::with_frames(32);
        let mut space = machine.space();
        let frame = machine.frame();
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE;

        space
            .map(va(0xffff_8000_1234_5000), frame, flags, machine.pmm.as_mut())
            .unwrap()
            .ignore();

        let translation = space.translate(va(0xffff_8000_1234_5abc)).unwrap();
        assert_eq!(translation.frame, frame);
        assert_eq!(translation.address, frame.offset(0xabc));
        assert_eq!(translation.size, PageSize::Size4KiB);
        assert!(translation.flags.contains(flags));
        assert!(!translation.flags.contains(PageFlags::USER));

        let (unmapped, flush) = space
            .unmap(va(0xffff_8000_1234_5000), machine.pmm.as_mut())
            .unwrap();
        flush.ignore();
        assert_eq!(unmapped, frame);
        assert_eq!(
            space.translate_addr(va(0xffff_8000_1234_5000)),
            Err(TranslateError::NotMapped)
        );
    }

    #[test]
    fn intermediate_tables_are_allocated_and_reclaimed() {
        let mut machine = TestMachine::with_frames(32);
        let mut space = machine.space();
        let baseline = machine.pmm.free_frames();
        let a = machine.frame();
        let b = machine.frame();

        space
            .map(va(0x4000_0000), a, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap()
            .ignore();
        // PDPT, PD and PT plus the two data frames.
        assert_eq!(machine.pmm.free_frames(), baseline - 5);

        space
            .map(va(0x4000_1000), b, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap()
            .ignore();
        assert_eq!(machine.pmm.free_frames(), baseline - 5);

        space.unmap(va(0x4000_0000), machine.pmm.as_mut()).unwrap().1.ignore();
        assert_eq!(machine.pmm.free_frames(), baseline - 5);
        space.unmap(va(0x4000_1000), machine.pmm.as_mut()).unwrap().1.ignore();
        assert_eq!(machine.pmm.free_frames(), baseline - 2);
    }

    #[test]
    fn existing_mappings_need_an_explicit_remap() {
        let mut machine = TestMachine::with_frames(32);
        let mut space = machine.space();
        let first = machine.frame();
        let second = machine.frame();

        space
            .map(va(0x20_0000), first, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap()
            .ignore();
        assert_eq!(
            space
                .map(va(0x20_0000), second, PageFlags::WRITABLE, machine.pmm.as_mut())
                .unwrap_err(),
            MapError::AlreadyMapped
        );

        let (previous, flush) = space
            .remap(va(0x20_0000), second, PageFlags::empty(), machine.pmm.as_mut())
            .unwrap();
        flush.ignore();
        assert_eq!(previous, Some(first));
        let translation = space.translate(va(0x20_0000)).unwrap();
        assert_eq!(translation.frame, second);
        assert!(!translation.flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn protected_ranges_cannot_be_touched() {
        let mut machine = TestMachine::with_frames(32);
        let mut space = machine.space();
        let kernel = machine.frame();
        let intruder = machine.frame();
        let image = VirtualRange::from_size(va(0xffff_ffff_8000_0000), 4 * PAGE_SIZE);

        space
            .map(image.start, kernel, PageFlags::empty(), machine.pmm.as_mut())
            .unwrap()
            .ignore();
        space.protect(image).unwrap();

        let pmm = machine.pmm.as_mut();
        assert_eq!(
            space.remap(image.start, intruder, PageFlags::WRITABLE, pmm).unwrap_err(),
            MapError::Protected
        );
        assert_eq!(
            space
                .map(image.start.offset(PAGE_SIZE), intruder, PageFlags::WRITABLE, pmm)
                .unwrap_err(),
            MapError::Protected
        );
        assert_eq!(space.unmap(image.start, pmm).unwrap_err(), UnmapError::Protected);
        assert_eq!(space.translate_addr(image.start), Ok(kernel));

        // Just past the end is fair game.
        space.map(image.end, intruder, PageFlags::WRITABLE, pmm).unwrap().ignore();
    }

    #[test]
    fn partially_covered_pages_are_protected() {
        let mut machine = TestMachine::with_frames(32);
        let mut space = machine.space();
        let frame = machine.frame();
        space
            .protect(VirtualRange::new(va(0x50_0800), va(0x50_1800)))
            .unwrap();

        let pmm = machine.pmm.as_mut();
        assert!(space.is_protected(va(0x50_0000)));
        assert!(space.is_protected(va(0x50_1000)));
        assert_eq!(
            space.map(va(0x50_0000), frame, PageFlags::WRITABLE, pmm).unwrap_err(),
            MapError::Protected
        );
        assert_eq!(
            space.remap(va(0x50_1000), frame, PageFlags::WRITABLE, pmm).unwrap_err(),
            MapError::Protected
        );
        assert_eq!(space.unmap(va(0x50_0000), pmm).unwrap_err(), UnmapError::Protected);

        space.map(va(0x50_2000), frame, PageFlags::WRITABLE, pmm).unwrap().ignore();
        assert_eq!(
            space.protect(VirtualRange::new(va(0x1000), va(usize::MAX))),
            Err(MapError::InvalidAddress)
        );
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let mut machine = TestMachine::with_frames(16);
        let mut space = machine.space();
        let frame = machine.frame();
        let pmm = machine.pmm.as_mut();

        assert_eq!(
            space.map(va(0x1001), frame, PageFlags::empty(), pmm).unwrap_err(),
            MapError::InvalidAddress
        );
        assert_eq!(
            space.map(va(0x1000), frame.offset(8), PageFlags::empty(), pmm).unwrap_err(),
            MapError::InvalidAddress
        );
        assert_eq!(
            space
                .map(va(0x0000_8000_0000_0000), frame, PageFlags::empty(), pmm)
                .unwrap_err(),
            MapError::InvalidAddress
        );
        assert_eq!(space.unmap(va(0x5000), pmm).unwrap_err(), UnmapError::NotMapped);
        assert_eq!(
            space.translate(va(0x0000_8000_0000_0000)).unwrap_err(),
            TranslateError::InvalidAddress
        );
    }

    #[test]
    fn out_of_frames_propagates_and_leaks_nothing() {
        // Root, PDPT and PD fit; the PT allocation fails.
        let mut machine = TestMachine::with_frames(3);
        let mut space = machine.space();
        let baseline = machine.pmm.free_frames();

        let err = space
            .map(va(0x4000_0000), PhysicalAddress::new(0x8000_0000), PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap_err();
        assert_eq!(err, MapError::NoPhysicalMemory);
        assert_eq!(machine.pmm.free_frames(), baseline);
    }

    #[test]
    fn huge_pages_translate_and_block_small_mappings() {
        let mut machine = TestMachine::with_frames(16);
        let mut space = machine.space();
        let frame = machine.frame();
        space
            .map(va(0x4000_0000), frame, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap()
            .ignore();

        // Install a 2 MiB leaf in the PD next to the one we just populated.
        let pml4 = space.table(space.root());
        let pdpt = space.table(unsafe { (&*pml4)[0].addr() }.into());
        let pd = space.table(unsafe { (&*pdpt)[1].addr() }.into());
        unsafe {
            (&mut *pd)[1].set_addr(
                x86_64::PhysAddr::new(0x8000_0000),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE,
            );
        }

        let translation = space.translate(va(0x4020_1234)).unwrap();
        assert_eq!(translation.size, PageSize::Size2MiB);
        assert_eq!(translation.frame.as_usize(), 0x8000_0000);
        assert_eq!(translation.address.as_usize(), 0x8000_1234);

        assert_eq!(
            space.map(va(0x4020_3000), frame, PageFlags::empty(), machine.pmm.as_mut()).unwrap_err(),
            MapError::HugePageConflict
        );
        assert_eq!(
            space.unmap(va(0x4020_0000), machine.pmm.as_mut()).unwrap_err(),
            UnmapError::HugePage
        );
    }

    #[test]
    fn demand_regions_resolve_not_present_faults() {
        let mut machine = TestMachine::with_frames(16);
        let mut space = machine.space();
        let region = VirtualRange::from_size(va(0x7000_0000), 4 * PAGE_SIZE);
        space.add_demand_region(region, PageFlags::WRITABLE).unwrap();

        let flush = space
            .handle_page_fault(
                va(0x7000_2010),
                PageFaultErrorCode::CAUSED_BY_WRITE,
                machine.pmm.as_mut(),
            )
            .unwrap();
        assert_eq!(flush.page(), va(0x7000_2000));
        flush.ignore();

        let frame = space.translate(va(0x7000_2010)).unwrap().frame;
        assert!(machine.bytes(frame).iter().all(|&b| b == 0));

        assert_eq!(
            space
                .handle_page_fault(va(0x7000_4000), PageFaultErrorCode::empty(), machine.pmm.as_mut())
                .unwrap_err(),
            FaultError::NotDemandPaged
        );
        assert_eq!(
            space
                .handle_page_fault(
                    va(0x7000_2010),
                    PageFaultErrorCode::PROTECTION_VIOLATION | PageFaultErrorCode::CAUSED_BY_WRITE,
                    machine.pmm.as_mut()
                )
                .unwrap_err(),
            FaultError::ProtectionViolation
        );
        assert_eq!(
            space
                .handle_page_fault(va(0x7000_0000), PageFaultErrorCode::USER_MODE, machine.pmm.as_mut())
                .unwrap_err(),
            FaultError::ProtectionViolation
        );
    }

    #[test]
    fn faults_on_already_mapped_demand_pages_resolve() {
        let mut machine = TestMachine::with_frames(16);
        let mut space = machine.space();
        let region = VirtualRange::from_size(va(0x7000_0000), 2 * PAGE_SIZE);
        space.add_demand_region(region, PageFlags::WRITABLE).unwrap();

        space
            .handle_page_fault(va(0x7000_1000), PageFaultErrorCode::empty(), machine.pmm.as_mut())
            .unwrap()
            .ignore();
        let frame = space.translate_addr(va(0x7000_1000)).unwrap();
        let free = machine.pmm.free_frames();

        // A second CPU or a stale TLB entry faults on the same page again.
        let flush = space
            .handle_page_fault(
                va(0x7000_1008),
                PageFaultErrorCode::CAUSED_BY_WRITE,
                machine.pmm.as_mut(),
            )
            .unwrap();
        assert_eq!(flush.page(), va(0x7000_1000));
        flush.ignore();

        assert_eq!(space.translate_addr(va(0x7000_1000)), Ok(frame));
        assert_eq!(machine.pmm.free_frames(), free);
    }

    #[test]
    fn demand_regions_may_not_cover_protected_memory() {
        let mut machine = TestMachine::with_frames(4);
        let mut space = machine.space();
        space
            .protect(VirtualRange::from_size(va(0x40_0000), PAGE_SIZE))
            .unwrap();

        assert_eq!(
            space.add_demand_region(VirtualRange::from_size(va(0x3f_f000), 2 * PAGE_SIZE), PageFlags::WRITABLE),
            Err(MapError::Protected)
        );
    }

    #[test]
    fn anonymous_mapping_rolls_back_on_exhaustion() {
        let mut machine = TestMachine::with_frames(8);
        let mut space = machine.space();
        let baseline = machine.pmm.free_frames();

        // 3 tables + 8 pages does not fit into 7 free frames.
        let range = VirtualRange::from_size(va(0x1000_0000), 8 * PAGE_SIZE);
        let err = space
            .map_anonymous(range, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap_err();
        assert_eq!(err, MapError::NoPhysicalMemory);
        assert_eq!(machine.pmm.free_frames(), baseline);
        assert_eq!(space.translate_addr(range.start), Err(TranslateError::NotMapped));

        let small = VirtualRange::from_size(va(0x1000_0000), 2 * PAGE_SIZE);
        space
            .map_anonymous(small, PageFlags::WRITABLE, machine.pmm.as_mut())
            .unwrap()
            .ignore();
        assert_eq!(machine.pmm.free_frames(), baseline - 5);
        space.unmap_anonymous(small, machine.pmm.as_mut()).ignore();
        assert_eq!(machine.pmm.free_frames(), baseline);
    }

    #[test]
    fn map_range_is_contiguous() {
        let mut machine = TestMachine::with_frames(16);
        let mut space = machine.space();

        space
            .map_range(
                va(0xffff_9000_0000_0000),
                PhysicalAddress::new(0xfd00_0000),
                3 * PAGE_SIZE,
                PageFlags::WRITABLE | PageFlags::NO_CACHE,
                machine.pmm.as_mut(),
            )
            .unwrap()
            .ignore();

        for i in 0..3 {
            assert_eq!(
                space.translate_addr(va(0xffff_9000_0000_0000 + i * PAGE_SIZE + 4)),
                Ok(PhysicalAddress::new(0xfd00_0000 + i * PAGE_SIZE + 4))
            );
        }
        assert!(space.translate(va(0xffff_9000_0000_3000)).is_err());
    }

    #[test]
    fn many_mappings_round_trip_without_leaking_frames() {
        let mut machine = TestMachine::with_frames(128);
        let mut space = machine.space();
        let baseline = machine.pmm.free_frames();

        let pages: std::vec::Vec<_> = (0..40)
            .map(|i| va(((i * 0x9e37_79b9_usize) & 0x7fff_ffff_f000) | 0x1000))
            .collect();
        let mut mapped = std::vec::Vec::new();
        for (i, &page) in pages.iter().enumerate() {
            let frame = PhysicalAddress::new(0x1_0000_0000 + i * PAGE_SIZE);
            match space.map(page, frame, PageFlags::WRITABLE, machine.pmm.as_mut()) {
                Ok(flush) => {
                    flush.ignore();
                    mapped.push((page, frame));
                }
                Err(MapError::AlreadyMapped) => {}
                Err(e) => panic!("map failed: {e}"),
            }
        }

        for &(page, frame) in &mapped {
            assert_eq!(space.translate_addr(page), Ok(frame));
        }
        for &(page, frame) in &mapped {
            let (got, flush) = space.unmap(page, machine.pmm.as_mut()).unwrap();
            flush.ignore();
            assert_eq!(got, frame);
            assert_eq!(space.translate_addr(page), Err(TranslateError::NotMapped));
        }
        assert_eq!(machine.pmm.free_frames(), baseline);
    }
}
