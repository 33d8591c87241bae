//! Boot handoff contract.
//!
//! The bootloader protocol is an external collaborator; the kernel translates
//! whatever the loader hands over into a [`BootHandoff`] and nothing past the entry
//! point looks at loader-specific structures.

use core::ops::Range;

use crate::memory::{
    address::{align_down, align_up, PhysicalAddress, VirtualAddress, VirtualRange},
    PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    /// Loader structures still in use at entry: page tables, boot stack, handoff data.
    BootloaderReclaimable,
    KernelImage,
    Framebuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub length: usize,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub const fn new(start: usize, length: usize, kind: MemoryRegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            length,
            kind,
        }
    }

    pub const fn usable(start: usize, length: usize) -> Self {
        Self::new(start, length, MemoryRegionKind::Usable)
    }

    pub const fn end(&self) -> PhysicalAddress {
        self.start.offset(self.length)
    }

    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }

    /// Indices of the frames lying entirely inside the region.
    pub const fn frames(&self) -> Range<usize> {
        let start = align_up(self.start.as_usize(), PAGE_SIZE) / PAGE_SIZE;
        let end = align_down(self.end().as_usize(), PAGE_SIZE) / PAGE_SIZE;
        if end > start {
            start..end
        } else {
            start..start
        }
    }
}

/// Where the loader placed the kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    pub physical_base: PhysicalAddress,
    pub virtual_base: VirtualAddress,
    pub size: usize,
}

impl KernelImage {
    pub const fn virtual_range(&self) -> VirtualRange {
        VirtualRange::from_size(self.virtual_base, self.size)
    }

    pub const fn physical_end(&self) -> PhysicalAddress {
        self.physical_base.offset(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub address: VirtualAddress,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct BootHandoff<'a> {
    pub memory_map: &'a [MemoryRegion],
    /// Offset of the higher-half direct map of all physical memory.
    pub hhdm_offset: u64,
    pub kernel_image: KernelImage,
    pub framebuffer: Option<FramebufferInfo>,
    pub cmdline: &'a str,
}

impl BootHandoff<'_> {
    /// One past the highest physical address the memory map mentions.
    pub fn physical_memory_end(&self) -> PhysicalAddress {
        self.memory_map
            .iter()
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(PhysicalAddress::new(0))
    }

    pub fn usable_bytes(&self) -> usize {
        self.memory_map
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.frames().len() * PAGE_SIZE)
            .sum()
    }

    /// Virtual window through which the loader mapped physical memory.
    pub fn hhdm_range(&self) -> VirtualRange {
        VirtualRange::from_size(
            VirtualAddress::new(self.hhdm_offset as usize),
            align_up(self.physical_memory_end().as_usize(), PAGE_SIZE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_are_not_counted() {
        let region = MemoryRegion::usable(0x1800, 0x3000);
        assert_eq!(region.frames(), 2..4);

        let tiny = MemoryRegion::usable(0x1100, 0x200);
        assert!(tiny.frames().is_empty());
    }

    #[test]
    fn handoff_summaries() {
        let map = [
            MemoryRegion::new(0, 0x1000, MemoryRegionKind::Reserved),
            MemoryRegion::usable(0x10_0000, 0x1_0000),
            MemoryRegion::new(0x20_0000, 0x4000, MemoryRegionKind::KernelImage),
        ];
        let handoff = BootHandoff {
            memory_map: &map,
            hhdm_offset: 0xffff_8000_0000_0000,
            kernel_image: KernelImage {
                physical_base: PhysicalAddress::new(0x20_0000),
                virtual_base: VirtualAddress::new(0xffff_ffff_8000_0000),
                size: 0x4000,
            },
            framebuffer: None,
            cmdline: "",
        };

        assert_eq!(handoff.usable_bytes(), 0x1_0000);
        assert_eq!(handoff.physical_memory_end().as_usize(), 0x20_4000);
        assert_eq!(handoff.hhdm_range().size(), 0x20_4000);
        assert!(handoff
            .kernel_image
            .virtual_range()
            .contains(VirtualAddress::new(0xffff_ffff_8000_3fff)));
    }
}
