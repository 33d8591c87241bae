use libkestrel::{boot::BootHandoff, config::BootConfig};
use log::debug;

pub mod allocator;
pub mod paging;
pub mod physical;

pub use paging::VMM;
pub use physical::PMM;

/// Frame allocator, then the live page tables, then the heap on top of both.
pub fn init(handoff: &BootHandoff, config: &BootConfig) {
    physical::init(handoff);
    paging::init(handoff);
    allocator::GLOBAL_ALLOC
        .init(config)
        .expect("Failed to map the initial heap");
    debug!("Memory management initialized");
}
