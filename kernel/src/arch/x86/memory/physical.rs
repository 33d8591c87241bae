use bitmap_allocator::BitAlloc16M;
use libkestrel::{
    boot::BootHandoff,
    memory::{
        address::PhysicalAddress,
        physical::{BitmapFrameAllocator, FrameAllocationError, FrameFreeError, PhysicalMemoryManager},
        PAGE_SIZE,
    },
};
use log::{debug, info};
use spinning_top::Spinlock;
use x86_64::instructions::interrupts::without_interrupts;

/// Tracks up to 64 GiB of physical memory.
pub type FrameAllocator = BitmapFrameAllocator<BitAlloc16M>;

pub static PMM: Spinlock<FrameAllocator> = Spinlock::new(BitmapFrameAllocator::new());

pub fn init(handoff: &BootHandoff) {
    let mut pmm = PMM.lock();
    let tracked = pmm.initialize(handoff.memory_map);

    // Real-mode IVT and BIOS data live in frame 0; nothing should ever get it.
    pmm.reserve_frame_range(PhysicalAddress::new(0), PhysicalAddress::new(PAGE_SIZE))
        .expect("Reservation table holds frame 0");
    let image = handoff.kernel_image;
    pmm.reserve_frame_range(image.physical_base.page_align(), image.physical_end().align_up())
        .expect("Reservation table holds the kernel image");
    debug!(
        "Kernel image occupies {:#x}..{:#x}",
        image.physical_base,
        image.physical_end()
    );

    info!(
        "PMM tracking {} frames ({} MiB free)",
        tracked,
        pmm.available_memory() / (1024 * 1024)
    );
}

pub fn allocate_frame() -> Result<PhysicalAddress, FrameAllocationError> {
    without_interrupts(|| PMM.lock().allocate_frame())
}

pub fn free_frame(frame: PhysicalAddress) -> Result<(), FrameFreeError> {
    without_interrupts(|| PMM.lock().free_frame(frame))
}
