#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

mod arch;
mod boot;
mod output;

use core::{
    arch::asm,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloc::{boxed::Box, vec::Vec};
use libkestrel::{
    config::BootConfig,
    interrupts::{HandlerResult, InterruptContext, BREAKPOINT_VECTOR},
    memory::{address::VirtualAddress, paging::PageFlags},
};
use log::{debug, error, info, warn, LevelFilter};
use output::logger;

#[no_mangle]
unsafe extern "C" fn kmain() -> ! {
    assert!(boot::BASE_REVISION.is_supported());
    logger::init(LevelFilter::Info).unwrap();

    let regions = boot::memory_map();
    let handoff = boot::handoff(&regions);
    let config = BootConfig::parse(handoff.cmdline).unwrap_or_else(|e| {
        warn!("Ignoring command line: {}", e);
        BootConfig::default()
    });
    logger::set_level(config.log_level);
    debug!("{:?}", config);

    info!(
        "Booting Kestrel: {} MiB usable, HHDM at {:#x}",
        handoff.usable_bytes() / (1024 * 1024),
        handoff.hhdm_offset
    );
    if let Some(fb) = handoff.framebuffer {
        debug!("Framebuffer {}x{} ({} bpp) at {:#x}", fb.width, fb.height, fb.bpp, fb.address);
    }
    arch::init(&handoff, &config);

    self_check();
    info!("Kernel core up");
    arch::x86::idle();
}

/// Scratch page for the boot self-check, well away from the heap.
const SCRATCH_PAGE: usize = 0x_5555_5555_0000;

static BREAKPOINTS: AtomicUsize = AtomicUsize::new(0);

fn count_breakpoint(_context: &mut InterruptContext) -> HandlerResult {
    BREAKPOINTS.fetch_add(1, Ordering::SeqCst);
    HandlerResult::Handled
}

/// Exercises every layer once before the kernel goes idle.
fn self_check() {
    use arch::x86::{
        idt,
        memory::{allocator::GLOBAL_ALLOC, paging, physical},
    };

    let frame = physical::allocate_frame().expect("Self-check needs one frame");
    let page = VirtualAddress::new(SCRATCH_PAGE);
    paging::map(page, frame, PageFlags::KERNEL_DATA).expect("Scratch page is free");
    let translation = paging::translate(page).expect("Scratch page was just mapped");
    assert_eq!(translation.address, frame);

    // The same frame must be visible through the HHDM.
    unsafe {
        page.as_mut_ptr::<u64>().write_volatile(0x4b);
        assert_eq!(paging::phys_to_virt(frame).as_ptr::<u64>().read_volatile(), 0x4b);
    }

    let unmapped = paging::unmap(page).expect("Scratch page was just mapped");
    physical::free_frame(unmapped).expect("Scratch frame came from the PMM");

    let boxed = Box::new(0x4b_u64);
    let values: Vec<usize> = (0..1024).collect();
    assert_eq!(*boxed, 0x4b);
    assert_eq!(values.iter().sum::<usize>(), 1023 * 1024 / 2);

    let block = GLOBAL_ALLOC.allocate(256, 64).expect("Heap has room for a block");
    assert_eq!(block.as_ptr() as usize % 64, 0);
    GLOBAL_ALLOC.free(block).expect("Block was just allocated");

    let previous = idt::replace_handler(BREAKPOINT_VECTOR as usize, count_breakpoint)
        .expect("Breakpoint vector is not reserved");
    x86_64::instructions::interrupts::int3();
    assert_eq!(BREAKPOINTS.load(Ordering::SeqCst), 1);
    if previous.is_none() {
        if let Err(e) = idt::unregister_handler(BREAKPOINT_VECTOR as usize) {
            warn!("Could not remove the self-test breakpoint handler: {}", e);
        }
    }

    let (used, total, live) = GLOBAL_ALLOC.stats();
    debug!("Heap: {} of {} bytes used, {} live allocations", used, total, live);
    debug!("Timer ticks so far: {}", arch::x86::ticks());
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    // The panic may have interrupted a print.
    unsafe { output::serial::force_unlock() };
    error!("{}", info);
    arch::x86::pic::silence();
    hcf();
}

pub fn hcf() -> ! {
    loop {
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("hlt");
        }
    }
}
