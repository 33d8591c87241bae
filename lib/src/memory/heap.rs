//! Kernel heap arena.
//!
//! A buddy allocator over a virtually contiguous window that starts small and grows
//! page by page through a [`HeapBacking`]. Blocks handed out by [`KernelHeap::allocate`]
//! carry a header so that [`KernelHeap::free`] needs nothing but the pointer.

use buddy_system_allocator::Heap;
use core::{
    alloc::Layout,
    error::Error,
    fmt::{Display, Formatter},
    mem::{align_of, size_of},
    ptr::NonNull,
};
use log::{debug, trace};

use super::{
    address::{checked_align_up, VirtualAddress},
    PAGE_SIZE,
};

/// Smallest amount the arena grows by at once.
pub const MIN_GROWTH: usize = 16 * PAGE_SIZE;

const LIVE: u64 = 0x6b65_7374_7265_6c21;
const FREED: u64 = 0x6465_6164_6465_6164;

/// Supplies memory when the arena runs dry.
pub trait HeapBacking {
    /// Makes `[start, start + size)` readable and writable.
    fn extend(&mut self, start: VirtualAddress, size: usize) -> Result<(), HeapError>;
}

/// Sits right before every block returned by `allocate`.
#[repr(C)]
struct BlockHeader {
    // The buddy allocator threads its free list through the first word of a block.
    _link: usize,
    magic: u64,
    size: usize,
    align: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    InvalidLayout,
    UnknownPointer,
    DoubleFree,
}

pub struct KernelHeap<const ORDER: usize> {
    heap: Heap<ORDER>,
    start: usize,
    end: usize,
    limit: usize,
    live: usize,
}

impl<const ORDER: usize> KernelHeap<ORDER> {
    pub const fn new() -> Self {
        Self {
            heap: Heap::new(),
            start: 0,
            end: 0,
            limit: 0,
            live: 0,
        }
    }

    /// # Safety
    /// `[start, start + size)` must be mapped, writable and unused by anything else, and
    /// the window up to `start + limit` must be free for the heap to grow into.
    pub unsafe fn initialize(&mut self, start: VirtualAddress, size: usize, limit: usize) {
        self.start = start.as_usize();
        // The window may not run past the top of the address space.
        self.limit = limit.min(usize::MAX - self.start);
        let size = size.min(self.limit);
        self.end = self.start + size;
        if size > 0 {
            self.heap.init(self.start, size);
        }
        debug!(
            "Heap at {:#x}, {} KiB mapped, {} KiB limit",
            start,
            size / 1024,
            limit / 1024
        );
    }

    pub fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    /// End of the currently mapped part of the arena.
    pub fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.end)
    }

    pub fn used_bytes(&self) -> usize {
        self.heap.stats_alloc_actual()
    }

    pub fn total_bytes(&self) -> usize {
        self.heap.stats_total_bytes()
    }

    pub fn live_allocations(&self) -> usize {
        self.live
    }

    /// Allocates `size` bytes aligned to `align`, growing the arena when needed.
    pub fn allocate<B: HeapBacking + ?Sized>(
        &mut self,
        size: usize,
        align: usize,
        backing: &mut B,
    ) -> Result<NonNull<u8>, HeapError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(HeapError::InvalidLayout);
        }

        let block_align = align.max(align_of::<BlockHeader>());
        let header_space =
            checked_align_up(HEADER_SIZE, block_align).ok_or(HeapError::InvalidLayout)?;
        let layout = header_space
            .checked_add(size)
            .and_then(|total| Layout::from_size_align(total, block_align).ok())
            .ok_or(HeapError::InvalidLayout)?;

        let base = self.alloc_layout(layout, backing)?;
        let ptr = unsafe { base.as_ptr().add(header_space) };
        unsafe {
            ptr.sub(HEADER_SIZE).cast::<BlockHeader>().write(BlockHeader {
                _link: 0,
                magic: LIVE,
                size,
                align,
            });
        }

        NonNull::new(ptr).ok_or(HeapError::OutOfMemory)
    }

    /// Releases a block returned by [`allocate`](Self::allocate).
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        if addr < self.start + HEADER_SIZE
            || addr >= self.end
            || addr % align_of::<BlockHeader>() != 0
        {
            return Err(HeapError::UnknownPointer);
        }

        let header = unsafe { &mut *((addr - HEADER_SIZE) as *mut BlockHeader) };
        match header.magic {
            LIVE => {}
            FREED => return Err(HeapError::DoubleFree),
            _ => return Err(HeapError::UnknownPointer),
        }

        if !header.align.is_power_of_two() {
            return Err(HeapError::UnknownPointer);
        }
        let block_align = header.align.max(align_of::<BlockHeader>());
        let header_space =
            checked_align_up(HEADER_SIZE, block_align).ok_or(HeapError::UnknownPointer)?;
        if addr - self.start < header_space {
            return Err(HeapError::UnknownPointer);
        }
        let layout = header_space
            .checked_add(header.size)
            .and_then(|total| Layout::from_size_align(total, block_align).ok())
            .ok_or(HeapError::UnknownPointer)?;
        header.magic = FREED;

        let base = unsafe { NonNull::new_unchecked((addr - header_space) as *mut u8) };
        unsafe { self.dealloc_layout(base, layout) };

        Ok(())
    }

    /// Header-less allocation for the global allocator.
    pub fn alloc_layout<B: HeapBacking + ?Sized>(
        &mut self,
        layout: Layout,
        backing: &mut B,
    ) -> Result<NonNull<u8>, HeapError> {
        if layout.size() == 0 {
            return Err(HeapError::InvalidLayout);
        }

        loop {
            if let Ok(ptr) = self.heap.alloc(layout) {
                self.live += 1;
                return Ok(ptr);
            }
            self.grow(layout, backing)?;
        }
    }

    /// # Safety
    /// `ptr` must come from [`alloc_layout`](Self::alloc_layout) on this heap with the
    /// same `layout`, and must not be used afterwards.
    pub unsafe fn dealloc_layout(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.heap.dealloc(ptr, layout);
        self.live = self.live.saturating_sub(1);
    }

    fn grow<B: HeapBacking + ?Sized>(
        &mut self,
        layout: Layout,
        backing: &mut B,
    ) -> Result<(), HeapError> {
        let remaining = self.limit - (self.end - self.start);
        if remaining == 0 {
            return Err(HeapError::OutOfMemory);
        }

        // Twice the buddy block guarantees an aligned block of that size fits.
        let wanted = layout
            .size()
            .checked_next_power_of_two()
            .map(|block| block.max(layout.align()).max(size_of::<usize>()))
            .and_then(|block| block.checked_mul(2))
            .and_then(|twice| checked_align_up(twice, PAGE_SIZE))
            .ok_or(HeapError::OutOfMemory)?;
        let size = wanted.max(MIN_GROWTH).min(remaining);

        backing.extend(VirtualAddress::new(self.end), size)?;
        unsafe { self.heap.add_to_heap(self.end, self.end + size) };
        self.end += size;
        trace!("Heap grew by {} KiB to {:#x}", size / 1024, self.end);

        Ok(())
    }
}

impl<const ORDER: usize> Default for KernelHeap<ORDER> {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HeapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use HeapError::*;
        let message = match self {
            OutOfMemory => "out of memory",
            InvalidLayout => "invalid layout",
            UnknownPointer => "pointer was not allocated by this heap",
            DoubleFree => "block already freed",
        };

        write!(f, "{}", message)
    }
}

impl Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc};

    const ARENA: usize = 1024 * 1024;

    /// Host memory standing in for the heap window.
    struct Arena {
        base: *mut u8,
    }

    impl Arena {
        fn new() -> Self {
            let base = unsafe { alloc_zeroed(Self::layout()) };
            assert!(!base.is_null());
            Self { base }
        }

        fn layout() -> Layout {
            Layout::from_size_align(ARENA, PAGE_SIZE).unwrap()
        }

        fn heap(&self, initial: usize, limit: usize) -> KernelHeap<32> {
            let mut heap = KernelHeap::new();
            unsafe { heap.initialize(VirtualAddress::from_ptr(self.base), initial, limit) };
            heap
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, Self::layout()) };
        }
    }

    /// Hands out up to `budget` bytes and remembers every request.
    struct Backing {
        budget: usize,
        grants: Vec<(usize, usize)>,
    }

    impl Backing {
        fn with_budget(budget: usize) -> Self {
            Self {
                budget,
                grants: Vec::new(),
            }
        }
    }

    impl HeapBacking for Backing {
        fn extend(&mut self, start: VirtualAddress, size: usize) -> Result<(), HeapError> {
            if size > self.budget {
                return Err(HeapError::OutOfMemory);
            }
            self.budget -= size;
            self.grants.push((start.as_usize(), size));
            Ok(())
        }
    }

    #[test]
    fn live_blocks_never_overlap() {
        let arena = Arena::new();
        let mut heap = arena.heap(ARENA, ARENA);
        let mut backing = Backing::with_budget(0);
        let baseline = heap.used_bytes();

        let mut blocks = Vec::new();
        for i in 0..64 {
            let size = 1 + (i * 37) % 700;
            let align = 1 << (i % 7);
            let ptr = heap.allocate(size, align, &mut backing).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            unsafe { ptr.as_ptr().write_bytes(i as u8, size) };
            blocks.push((ptr, size, i as u8));
        }
        assert_eq!(heap.live_allocations(), 64);

        let mut spans: Vec<_> = blocks
            .iter()
            .map(|(p, s, _)| (p.as_ptr() as usize, p.as_ptr() as usize + s))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "blocks overlap: {:x?}", pair);
        }

        for (ptr, size, fill) in blocks {
            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == fill));
            heap.free(ptr).unwrap();
        }
        assert_eq!(heap.used_bytes(), baseline);
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn grows_through_the_backing() {
        let arena = Arena::new();
        let mut heap = arena.heap(MIN_GROWTH, ARENA);
        let mut backing = Backing::with_budget(ARENA);
        let before = heap.total_bytes();

        let ptr = heap.allocate(100 * 1024, 8, &mut backing).unwrap();
        assert!(!backing.grants.is_empty());
        assert_eq!(backing.grants[0].0, arena.base as usize + MIN_GROWTH);
        assert!(heap.total_bytes() > before);
        assert!((ptr.as_ptr() as usize) < heap.end().as_usize());
        heap.free(ptr).unwrap();
    }

    #[test]
    fn growth_stops_at_the_limit() {
        let arena = Arena::new();
        let mut heap = arena.heap(MIN_GROWTH, 2 * MIN_GROWTH);
        let mut backing = Backing::with_budget(ARENA);

        assert_eq!(
            heap.allocate(4 * MIN_GROWTH, 8, &mut backing),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(heap.end().as_usize(), arena.base as usize + 2 * MIN_GROWTH);

        // What did fit is still usable.
        let ptr = heap.allocate(1024, 8, &mut backing).unwrap();
        heap.free(ptr).unwrap();
    }

    #[test]
    fn refused_backing_is_out_of_memory() {
        let arena = Arena::new();
        let mut heap = arena.heap(PAGE_SIZE, ARENA);
        let mut backing = Backing::with_budget(0);

        assert_eq!(
            heap.allocate(2 * PAGE_SIZE, 8, &mut backing),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn free_misuse_is_reported() {
        let arena = Arena::new();
        let mut heap = arena.heap(ARENA, ARENA);
        let mut backing = Backing::with_budget(0);

        let ptr = heap.allocate(64, 16, &mut backing).unwrap();
        let keep = heap.allocate(64, 16, &mut backing).unwrap();
        heap.free(ptr).unwrap();
        assert_eq!(heap.free(ptr), Err(HeapError::DoubleFree));

        let mut outside = 0u64;
        assert_eq!(
            heap.free(NonNull::from(&mut outside).cast()),
            Err(HeapError::UnknownPointer)
        );

        let untouched = unsafe { NonNull::new_unchecked(arena.base.add(ARENA - 256)) };
        assert_eq!(heap.free(untouched), Err(HeapError::UnknownPointer));

        heap.free(keep).unwrap();
    }

    #[test]
    fn misaligned_and_interior_pointers_are_unknown() {
        let arena = Arena::new();
        let mut heap = arena.heap(ARENA, ARENA);
        let mut backing = Backing::with_budget(0);

        let ptr = heap.allocate(64, 8, &mut backing).unwrap();
        let skewed = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(3)) };
        assert_eq!(heap.free(skewed), Err(HeapError::UnknownPointer));
        let interior = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(8)) };
        assert_eq!(heap.free(interior), Err(HeapError::UnknownPointer));

        assert_eq!(heap.live_allocations(), 1);
        heap.free(ptr).unwrap();
    }

    #[test]
    fn huge_requests_are_out_of_memory() {
        let arena = Arena::new();
        let mut heap = arena.heap(MIN_GROWTH, ARENA);
        let mut backing = Backing::with_budget(ARENA);

        assert_eq!(
            heap.allocate((1 << 62) + 1, 8, &mut backing),
            Err(HeapError::OutOfMemory)
        );
        let layout = Layout::from_size_align((1 << 62) + 1, 8).unwrap();
        assert_eq!(
            heap.alloc_layout(layout, &mut backing),
            Err(HeapError::OutOfMemory)
        );

        // An unbounded limit is clamped to the address space.
        let mut unbounded = arena.heap(MIN_GROWTH, usize::MAX);
        assert_eq!(
            unbounded.allocate((1 << 62) + 1, 8, &mut Backing::with_budget(0)),
            Err(HeapError::OutOfMemory)
        );
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        let arena = Arena::new();
        let mut heap = arena.heap(MIN_GROWTH, MIN_GROWTH);
        let mut backing = Backing::with_budget(0);

        assert_eq!(heap.allocate(0, 8, &mut backing), Err(HeapError::InvalidLayout));
        assert_eq!(heap.allocate(16, 3, &mut backing), Err(HeapError::InvalidLayout));
        assert_eq!(
            heap.alloc_layout(Layout::from_size_align(0, 1).unwrap(), &mut backing),
            Err(HeapError::InvalidLayout)
        );
    }

    #[test]
    fn layout_path_returns_to_baseline() {
        let arena = Arena::new();
        let mut heap = arena.heap(MIN_GROWTH, ARENA);
        let mut backing = Backing::with_budget(ARENA);
        let baseline = heap.used_bytes();

        let layouts = [
            Layout::new::<u64>(),
            Layout::from_size_align(3000, 64).unwrap(),
            Layout::from_size_align(MIN_GROWTH, PAGE_SIZE).unwrap(),
        ];
        let ptrs: Vec<_> = layouts
            .iter()
            .map(|&l| heap.alloc_layout(l, &mut backing).unwrap())
            .collect();
        for (ptr, layout) in ptrs.iter().zip(&layouts) {
            assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        }

        for (ptr, layout) in ptrs.into_iter().zip(layouts) {
            unsafe { heap.dealloc_layout(ptr, layout) };
        }
        assert_eq!(heap.used_bytes(), baseline);
    }
}
