//! Limine requests and their translation into [`BootHandoff`].

use heapless::Vec;
use libkestrel::{
    boot::{BootHandoff, FramebufferInfo, KernelImage, MemoryRegion, MemoryRegionKind},
    memory::address::{PhysicalAddress, VirtualAddress},
};
use limine::{
    memory_map::EntryType,
    request::{
        FramebufferRequest, HhdmRequest, KernelAddressRequest, KernelFileRequest,
        MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
    },
    BaseRevision,
};
use log::{debug, warn};

pub const MAX_REGIONS: usize = 128;

/// Sets the base revision to the latest revision supported by the crate.
/// Be sure to mark all limine requests with #[used], otherwise they may be removed by the compiler.
#[used]
// The .requests section allows limine to find the requests faster and more safely.
#[link_section = ".requests"]
pub static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_FILE_REQUEST: KernelFileRequest = KernelFileRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();
#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

extern "C" {
    /// Exported by the linker script right after the last kernel section.
    static __kernel_end: u8;
}

/// Copies the loader's memory map into the kernel's own representation.
pub fn memory_map() -> Vec<MemoryRegion, MAX_REGIONS> {
    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Failed to fetch memory map from bootloader")
        .entries();
    debug!("Bootloader reported {} memory map entries", entries.len());
    let kernel = kernel_image();

    let mut regions = Vec::new();
    for entry in entries.iter() {
        let start = entry.base as usize;
        let kind = match entry.entry_type {
            EntryType::USABLE => MemoryRegionKind::Usable,
            EntryType::ACPI_RECLAIMABLE => MemoryRegionKind::AcpiReclaimable,
            EntryType::ACPI_NVS => MemoryRegionKind::AcpiNvs,
            EntryType::BAD_MEMORY => MemoryRegionKind::BadMemory,
            EntryType::BOOTLOADER_RECLAIMABLE => MemoryRegionKind::BootloaderReclaimable,
            EntryType::FRAMEBUFFER => MemoryRegionKind::Framebuffer,
            _ if (start..start + entry.length as usize)
                .contains(&kernel.physical_base.as_usize()) =>
            {
                MemoryRegionKind::KernelImage
            }
            _ => MemoryRegionKind::Reserved,
        };

        let region = MemoryRegion::new(start, entry.length as usize, kind);
        if regions.push(region).is_err() {
            warn!("Memory map has more than {} entries, ignoring the rest", MAX_REGIONS);
            break;
        }
    }

    regions
}

pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("Failed to fetch HHDM response from bootloader")
        .offset()
}

pub fn kernel_image() -> KernelImage {
    let response = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Failed to fetch kernel address from bootloader");
    let virtual_base = response.virtual_base() as usize;
    let end = unsafe { core::ptr::addr_of!(__kernel_end) } as usize;

    KernelImage {
        physical_base: PhysicalAddress::new(response.physical_base() as usize),
        virtual_base: VirtualAddress::new(virtual_base),
        size: end.saturating_sub(virtual_base),
    }
}

fn framebuffer() -> Option<FramebufferInfo> {
    let framebuffer = FRAMEBUFFER_REQUEST.get_response()?.framebuffers().next()?;

    Some(FramebufferInfo {
        address: VirtualAddress::from_ptr(framebuffer.addr()),
        width: framebuffer.width(),
        height: framebuffer.height(),
        pitch: framebuffer.pitch(),
        bpp: framebuffer.bpp(),
    })
}

fn cmdline() -> &'static str {
    KERNEL_FILE_REQUEST
        .get_response()
        .and_then(|response| core::str::from_utf8(response.file().cmdline()).ok())
        .unwrap_or("")
}

pub fn handoff(memory_map: &[MemoryRegion]) -> BootHandoff<'_> {
    BootHandoff {
        memory_map,
        hhdm_offset: hhdm_offset(),
        kernel_image: kernel_image(),
        framebuffer: framebuffer(),
        cmdline: cmdline(),
    }
}
