use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use libkestrel::{
    config::BootConfig,
    memory::{
        address::{VirtualAddress, VirtualRange},
        heap::{HeapBacking, HeapError, KernelHeap},
        paging::{MapError, PageFlags},
    },
};
use log::{info, warn};
use spinning_top::Spinlock;
use x86_64::instructions::interrupts::without_interrupts;

use super::{paging::VMM, physical::PMM};

pub const HEAP_START: usize = 0x_4444_4444_0000;

#[global_allocator]
pub static GLOBAL_ALLOC: KernelAllocator = KernelAllocator::new();

pub struct KernelAllocator {
    heap: Spinlock<KernelHeap<32>>,
}

/// Grows the heap by mapping fresh frames right after its current end.
struct PagingBacking;

impl HeapBacking for PagingBacking {
    fn extend(&mut self, start: VirtualAddress, size: usize) -> Result<(), HeapError> {
        let mut vmm = VMM.lock();
        let space = vmm.as_mut().ok_or(HeapError::OutOfMemory)?;
        let range = VirtualRange::from_size(start, size);

        match space.map_anonymous(range, PageFlags::KERNEL_DATA, &mut *PMM.lock()) {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapError::NoPhysicalMemory) => Err(HeapError::OutOfMemory),
            Err(e) => {
                warn!("Cannot extend heap at {:#x}: {}", start, e);
                Err(HeapError::OutOfMemory)
            }
        }
    }
}

impl KernelAllocator {
    pub const fn new() -> Self {
        Self {
            heap: Spinlock::new(KernelHeap::new()),
        }
    }

    /// Maps the initial heap and hands it to the allocator.
    pub fn init(&self, config: &BootConfig) -> Result<(), HeapError> {
        let start = VirtualAddress::new(HEAP_START);
        without_interrupts(|| {
            PagingBacking.extend(start, config.heap_size)?;
            unsafe {
                self.heap
                    .lock()
                    .initialize(start, config.heap_size, config.heap_max)
            };
            Ok::<(), HeapError>(())
        })?;

        info!(
            "Heap ready: {} KiB mapped, up to {} KiB",
            config.heap_size / 1024,
            config.heap_max / 1024
        );
        Ok(())
    }

    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        without_interrupts(|| self.heap.lock().allocate(size, align, &mut PagingBacking))
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        without_interrupts(|| self.heap.lock().free(ptr))
    }

    /// `(used, total, live allocations)`
    pub fn stats(&self) -> (usize, usize, usize) {
        without_interrupts(|| {
            let heap = self.heap.lock();
            (heap.used_bytes(), heap.total_bytes(), heap.live_allocations())
        })
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        without_interrupts(|| {
            self.heap
                .lock()
                .alloc_layout(layout, &mut PagingBacking)
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            without_interrupts(|| self.heap.lock().dealloc_layout(ptr, layout));
        }
    }
}
