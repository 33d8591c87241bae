use core::sync::atomic::{AtomicU64, Ordering};

use libkestrel::{
    boot::BootHandoff,
    config::BootConfig,
    interrupts::{HandlerResult, InterruptContext, PAGE_FAULT_VECTOR, TIMER_LINE},
};
use log::{info, warn};
use x86_64::instructions::{hlt, interrupts};

pub mod gdt;
pub mod idt;
pub mod memory;
pub mod pic;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Brings the core up in dependency order and enables interrupts last.
pub fn init(handoff: &BootHandoff, config: &BootConfig) {
    gdt::init();
    idt::init();
    pic::init(config.pic_master_offset, config.pic_slave_offset);
    memory::init(handoff, config);

    idt::register_handler(PAGE_FAULT_VECTOR as usize, memory::paging::page_fault_handler)
        .expect("Page fault vector is free at boot");

    match pic::vector_for_line(TIMER_LINE) {
        Ok(vector) => {
            idt::register_handler(vector as usize, timer_handler)
                .expect("Timer vector is free at boot");
            if let Err(e) = pic::enable_irq(TIMER_LINE) {
                warn!("Timer not enabled: {}", e);
            }
        }
        Err(e) => warn!("Timer not enabled: {}", e),
    }

    interrupts::enable();
    info!("Interrupts enabled");
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

fn timer_handler(_context: &mut InterruptContext) -> HandlerResult {
    TICKS.fetch_add(1, Ordering::Relaxed);
    HandlerResult::Handled
}

pub fn idle() -> ! {
    loop {
        hlt();
    }
}
