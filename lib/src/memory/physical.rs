use core::{error::Error, fmt::Display, ops::Range};

use bitmap_allocator::BitAlloc;
use heapless::Vec;
use log::{debug, warn};

use crate::boot::MemoryRegion;

use super::{address::PhysicalAddress, PAGE_SIZE};

/// Upper bound on distinct usable regions tracked by a frame allocator.
pub const MAX_USABLE_REGIONS: usize = 64;
pub const MAX_RESERVED_RANGES: usize = 16;

pub trait PhysicalMemoryManager {
    /// Allocate a single physical frame
    fn allocate_frame(&mut self) -> Result<PhysicalAddress, FrameAllocationError>;

    /// Allocate a block of contiguous frames returning the address of the start of the block
    fn allocate_contiguous(&mut self, count: usize)
        -> Result<PhysicalAddress, FrameAllocationError>;

    /// Free a previously allocated physical frame
    fn free_frame(&mut self, frame: PhysicalAddress) -> Result<(), FrameFreeError>;

    /// Check if a specific frame is available
    fn is_frame_free(&self, frame: PhysicalAddress) -> bool;

    /// Whether the frame is tracked by this manager and currently handed out
    fn owns_frame(&self, frame: PhysicalAddress) -> bool;

    /// Get total physical memory
    fn total_memory(&self) -> usize;

    /// Get available physical memory
    fn available_memory(&self) -> usize;

    /// Reserve a specific frame range (for kernel, hardware, etc.), returning how many
    /// tracked frames it took away
    fn reserve_frame_range(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
    ) -> Result<usize, FrameReserveError>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameAllocationError {
    OutOfMemory,
    InvalidCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFreeError {
    Unaligned(PhysicalAddress),
    OutOfRange(PhysicalAddress),
    DoubleFree(PhysicalAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReserveError {
    /// No room to remember another disjoint reservation
    TableFull,
}

/// Frame allocator backed by a hierarchical bitmap.
///
/// A set bit means the frame is free. Only frames inside usable regions of the boot
/// memory map are ever set; everything else stays permanently allocated, so a frame
/// outside the tracked ranges can never be handed out.
pub struct BitmapFrameAllocator<B: BitAlloc> {
    bitmap: B,
    usable: Vec<Range<usize>, MAX_USABLE_REGIONS>,
    reserved: Vec<Range<usize>, MAX_RESERVED_RANGES>,
    total_frames: usize,
    free_frames: usize,
}

impl<B: BitAlloc> BitmapFrameAllocator<B> {
    pub const fn new() -> Self {
        Self {
            bitmap: B::DEFAULT,
            usable: Vec::new(),
            reserved: Vec::new(),
            total_frames: 0,
            free_frames: 0,
        }
    }

    /// Builds free-frame tracking from the boot memory map.
    ///
    /// Returns the number of frames that became available.
    pub fn initialize(&mut self, memory_map: &[MemoryRegion]) -> usize {
        for region in memory_map.iter().filter(|r| r.is_usable()) {
            let mut frames = region.frames();
            if frames.end > B::CAP {
                warn!(
                    "Region {:#x}..{:#x} exceeds bitmap capacity, clipping",
                    region.start.as_usize(),
                    region.end().as_usize()
                );
                frames.end = B::CAP;
            }
            if frames.is_empty() {
                continue;
            }
            if self.usable.push(frames.clone()).is_err() {
                warn!(
                    "Too many usable regions, ignoring {:#x}..{:#x}",
                    region.start.as_usize(),
                    region.end().as_usize()
                );
                continue;
            }

            self.bitmap.insert(frames.clone());
            self.total_frames += frames.len();
            self.free_frames += frames.len();
            debug!(
                "Tracking {} frames at {:#x}",
                frames.len(),
                frames.start * PAGE_SIZE
            );
        }

        debug!("Physical memory: {} usable frames", self.total_frames);
        self.free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    fn is_tracked(&self, index: usize) -> bool {
        self.usable.iter().any(|r| r.contains(&index))
            && !self.reserved.iter().any(|r| r.contains(&index))
    }
}

impl<B: BitAlloc> Default for BitmapFrameAllocator<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BitAlloc> PhysicalMemoryManager for BitmapFrameAllocator<B> {
    fn allocate_frame(&mut self) -> Result<PhysicalAddress, FrameAllocationError> {
        match self.bitmap.alloc() {
            Some(index) => {
                self.free_frames -= 1;
                Ok(PhysicalAddress::from_frame_index(index))
            }
            None => {
                debug!("Failed to allocate new frame");
                Err(FrameAllocationError::OutOfMemory)
            }
        }
    }

    fn allocate_contiguous(
        &mut self,
        count: usize,
    ) -> Result<PhysicalAddress, FrameAllocationError> {
        if count == 0 {
            return Err(FrameAllocationError::InvalidCount);
        }

        for region in self.usable.iter() {
            let mut run_start = region.start;
            for index in region.clone() {
                if !self.bitmap.test(index) {
                    run_start = index + 1;
                } else if index + 1 - run_start == count {
                    let run = run_start..index + 1;
                    self.bitmap.remove(run.clone());
                    self.free_frames -= count;
                    debug!(
                        "Allocated {} contiguous frames at {:#x}",
                        count,
                        run.start * PAGE_SIZE
                    );
                    return Ok(PhysicalAddress::from_frame_index(run.start));
                }
            }
        }

        Err(FrameAllocationError::OutOfMemory)
    }

    fn free_frame(&mut self, frame: PhysicalAddress) -> Result<(), FrameFreeError> {
        if !frame.is_page_aligned() {
            return Err(FrameFreeError::Unaligned(frame));
        }
        let index = frame.frame_index();
        if !self.is_tracked(index) {
            return Err(FrameFreeError::OutOfRange(frame));
        }
        if self.bitmap.test(index) {
            return Err(FrameFreeError::DoubleFree(frame));
        }

        self.bitmap.insert(index..index + 1);
        self.free_frames += 1;
        Ok(())
    }

    fn is_frame_free(&self, frame: PhysicalAddress) -> bool {
        let index = frame.frame_index();
        self.is_tracked(index) && self.bitmap.test(index)
    }

    fn owns_frame(&self, frame: PhysicalAddress) -> bool {
        let index = frame.frame_index();
        self.is_tracked(index) && !self.bitmap.test(index)
    }

    fn total_memory(&self) -> usize {
        self.total_frames * PAGE_SIZE
    }

    fn available_memory(&self) -> usize {
        self.free_frames * PAGE_SIZE
    }

    fn reserve_frame_range(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
    ) -> Result<usize, FrameReserveError> {
        let range = start.frame_index()..end.align_up().frame_index().min(B::CAP);
        let tracked: usize = range.clone().filter(|&i| self.is_tracked(i)).count();
        if tracked == 0 {
            return Ok(0);
        }

        // Touching reservations share a slot; a new slot is claimed before any frame moves.
        let touching = self
            .reserved
            .iter()
            .position(|r| r.start <= range.end && range.start <= r.end);
        let slot = match touching {
            Some(slot) => slot,
            None => {
                self.reserved
                    .push(range.start..range.start)
                    .map_err(|_| FrameReserveError::TableFull)?;
                self.reserved.len() - 1
            }
        };

        for index in range.clone() {
            if !self.is_tracked(index) {
                continue;
            }
            if self.bitmap.test(index) {
                self.bitmap.remove(index..index + 1);
                self.free_frames -= 1;
            }
            self.total_frames -= 1;
        }

        // Untracked from here on, so a later free of these frames is rejected.
        let merged = &mut self.reserved[slot];
        if merged.is_empty() {
            *merged = range;
        } else {
            *merged = merged.start.min(range.start)..merged.end.max(range.end);
        }
        debug!(
            "Reserved {} frames in {:#x}..{:#x}",
            tracked,
            start.as_usize(),
            end.as_usize()
        );

        Ok(tracked)
    }
}

impl Display for FrameAllocationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use FrameAllocationError::*;

        let message = match self {
            OutOfMemory => "out of memory",
            InvalidCount => "invalid frame count",
        };

        write!(f, "{message}")
    }
}

impl Display for FrameFreeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use FrameFreeError::*;

        match self {
            Unaligned(frame) => write!(f, "frame {:#x} is not page aligned", frame),
            OutOfRange(frame) => write!(f, "frame {:#x} is not tracked", frame),
            DoubleFree(frame) => write!(f, "frame {:#x} is already free", frame),
        }
    }
}

impl Display for FrameReserveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameReserveError::TableFull => write!(f, "reservation table is full"),
        }
    }
}

impl Error for FrameAllocationError {}
impl Error for FrameFreeError {}
impl Error for FrameReserveError {}
