use core::ptr::addr_of;

use lazy_static::lazy_static;
use libkestrel::cpu::gdt::{self as layout, Selectors, STACK_SIZE};
use log::debug;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{gdt::GlobalDescriptorTable, tss::TaskStateSegment},
    VirtAddr,
};

pub use libkestrel::cpu::gdt::DOUBLE_FAULT_IST_INDEX;

static mut DOUBLE_FAULT_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
static mut KERNEL_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let double_fault = VirtAddr::from_ptr(unsafe { addr_of!(DOUBLE_FAULT_STACK) });
        let kernel = VirtAddr::from_ptr(unsafe { addr_of!(KERNEL_STACK) });
        layout::task_state_segment(double_fault + STACK_SIZE as u64, kernel + STACK_SIZE as u64)
    };
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = layout::build(&TSS);
}

pub fn init() {
    let (gdt, selectors) = &*GDT;
    gdt.load();

    unsafe {
        CS::set_reg(selectors.kernel_code_selector);
        DS::set_reg(selectors.kernel_data_selector);
        ES::set_reg(selectors.kernel_data_selector);
        SS::set_reg(selectors.kernel_data_selector);
        load_tss(selectors.tss_selector);
    }

    debug!("GDT loaded");
}
