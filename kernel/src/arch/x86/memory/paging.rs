use libkestrel::{
    boot::BootHandoff,
    interrupts::{HandlerResult, InterruptContext},
    memory::{
        address::{PhysicalAddress, VirtualAddress},
        paging::{
            AddressSpace, FaultError, MapError, OffsetMapper, PageFlags, PhysicalMapper,
            Translation, TranslateError, UnmapError, VirtualMemoryManager,
        },
    },
};
use log::{debug, error};
use spinning_top::Spinlock;
use x86_64::{
    instructions::interrupts::without_interrupts, registers::control::Cr3,
    structures::idt::PageFaultErrorCode,
};

use super::physical::PMM;

pub type KernelAddressSpace = AddressSpace<OffsetMapper>;

pub static VMM: Spinlock<Option<KernelAddressSpace>> = Spinlock::new(None);

/// Adopts the page tables the bootloader left in CR3.
pub fn init(handoff: &BootHandoff) {
    let (root_frame, _) = Cr3::read();
    let root = PhysicalAddress::from(root_frame.start_address());
    let mapper = OffsetMapper::new(handoff.hhdm_offset as usize);
    let mut space = unsafe { AddressSpace::from_root(root, mapper) };

    space
        .protect(handoff.kernel_image.virtual_range())
        .expect("Protected range table holds the kernel image");
    space
        .protect(handoff.hhdm_range())
        .expect("Protected range table holds the HHDM");
    debug!("Kernel address space rooted at {:#x}", root);

    *VMM.lock() = Some(space);
}

pub fn phys_to_virt(addr: PhysicalAddress) -> VirtualAddress {
    match VMM.lock().as_ref() {
        Some(space) => space.mapper().phys_to_virt(addr),
        None => panic!("Paging used before initialization"),
    }
}

pub fn map(virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) -> Result<(), MapError> {
    without_interrupts(|| {
        let mut vmm = VMM.lock();
        let space = vmm.as_mut().ok_or(MapError::InvalidAddress)?;
        space.map(virt, phys, flags, &mut *PMM.lock()).map(|flush| flush.flush())
    })
}

pub fn unmap(virt: VirtualAddress) -> Result<PhysicalAddress, UnmapError> {
    without_interrupts(|| {
        let mut vmm = VMM.lock();
        let space = vmm.as_mut().ok_or(UnmapError::NotMapped)?;
        let (frame, flush) = space.unmap(virt, &mut *PMM.lock())?;
        flush.flush();
        Ok(frame)
    })
}

pub fn translate(virt: VirtualAddress) -> Result<Translation, TranslateError> {
    without_interrupts(|| {
        VMM.lock()
            .as_ref()
            .ok_or(TranslateError::NotMapped)?
            .translate(virt)
    })
}

/// Default page-fault handler: resolve demand-paged addresses, escalate the rest.
pub fn page_fault_handler(context: &mut InterruptContext) -> HandlerResult {
    let (Some(address), Some(code)) = (context.fault_address, context.error_code) else {
        return HandlerResult::Escalate;
    };
    let error_code = PageFaultErrorCode::from_bits_truncate(code);

    // A fault taken while the tables are being edited cannot be resolved here.
    let Some(mut vmm) = VMM.try_lock() else {
        return HandlerResult::Escalate;
    };
    let Some(space) = vmm.as_mut() else {
        return HandlerResult::Escalate;
    };
    let Some(mut pmm) = PMM.try_lock() else {
        return HandlerResult::Escalate;
    };

    match space.handle_page_fault(address, error_code, &mut *pmm) {
        Ok(flush) => {
            flush.flush();
            HandlerResult::Handled
        }
        Err(FaultError::NotDemandPaged) => HandlerResult::Escalate,
        Err(e) => {
            error!("Page fault at {:#x} not resolved: {}", address, e);
            HandlerResult::Escalate
        }
    }
}
