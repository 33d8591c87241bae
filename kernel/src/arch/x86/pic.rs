use libkestrel::interrupts::{
    pic::{self, IrqMasks, PicError, PicLayout, CASCADE_LINE, OCW3_READ_ISR},
    PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET,
};
use log::{debug, warn};
use pic8259::ChainedPics;
use spinning_top::Spinlock;
use x86_64::instructions::{interrupts::without_interrupts, port::Port};

use super::idt::INTERRUPT_HANDLERS;

pub struct Pics {
    chips: ChainedPics,
    layout: PicLayout,
}

pub static PICS: Spinlock<Pics> = Spinlock::new(Pics {
    chips: unsafe { ChainedPics::new(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET) },
    layout: PicLayout::DEFAULT,
});

impl Pics {
    fn masks(&mut self) -> IrqMasks {
        let [master, slave] = unsafe { self.chips.read_masks() };
        IrqMasks::from_registers(master, slave)
    }

    fn set_masks(&mut self, masks: IrqMasks) {
        let (master, slave) = masks.registers();
        unsafe { self.chips.write_masks(master, slave) };
    }

    fn update_masks(
        &mut self,
        change: impl FnOnce(IrqMasks) -> Result<IrqMasks, PicError>,
    ) -> Result<(), PicError> {
        let masks = change(self.masks())?;
        self.set_masks(masks);
        Ok(())
    }
}

/// Reads the in-service register of the chip behind `line`, if it can be spurious.
/// `pic8259` has no accessor for it.
fn in_service_says_spurious(line: u8) -> bool {
    let Some(command) = pic::spurious_candidate(line) else {
        return false;
    };
    let mut port = Port::<u8>::new(command);
    let in_service = unsafe {
        port.write(OCW3_READ_ISR);
        port.read()
    };
    pic::is_spurious(line, in_service)
}

/// Remaps the PICs with every line masked.
pub fn init(master_offset: u8, slave_offset: u8) {
    let layout = PicLayout::new(master_offset, slave_offset).unwrap_or_else(|e| {
        warn!("Cannot remap PIC to {}/{}: {}", master_offset, slave_offset, e);
        PicLayout::DEFAULT
    });
    let (master, slave) = layout.offsets();

    without_interrupts(|| {
        let mut pics = PICS.lock();
        pics.chips = unsafe { ChainedPics::new(master, slave) };
        pics.layout = layout;
        unsafe { pics.chips.initialize() };
        pics.set_masks(IrqMasks::ALL);
    });
    debug!("PIC remapped to {:#x}/{:#x}, all lines masked", master, slave);
}

/// Unmasks a line, provided something is registered for its vector.
pub fn enable_irq(line: u8) -> Result<(), PicError> {
    without_interrupts(|| {
        let mut pics = PICS.lock();
        let vector = pics.layout.vector_for_line(line)?;
        if !INTERRUPT_HANDLERS.lock().is_registered(vector as usize) {
            return Err(PicError::NoHandler(line));
        }
        pics.update_masks(|masks| masks.unmask(line))
    })?;
    debug!("IRQ {} enabled", line);

    Ok(())
}

/// Translates a vector to an IRQ line if the PICs own it.
pub fn line_for_vector(vector: u8) -> Option<u8> {
    without_interrupts(|| PICS.lock().layout.line_for_vector(vector))
}

pub fn vector_for_line(line: u8) -> Result<u8, PicError> {
    without_interrupts(|| PICS.lock().layout.vector_for_line(line))
}

/// Returns whether the interrupt was spurious, acknowledging it if needed.
pub fn filter_spurious(line: u8) -> bool {
    let mut pics = PICS.lock();
    if !in_service_says_spurious(line) {
        return false;
    }

    // A spurious IRQ 15 still took the master's cascade line.
    if line == 15 {
        if let Ok(cascade) = pics.layout.vector_for_line(CASCADE_LINE) {
            unsafe { pics.chips.notify_end_of_interrupt(cascade) };
        }
    }
    true
}

pub fn end_of_interrupt(line: u8) {
    let mut pics = PICS.lock();
    match pics.layout.vector_for_line(line) {
        Ok(vector) => unsafe { pics.chips.notify_end_of_interrupt(vector) },
        Err(e) => warn!("EOI for line {} failed: {}", line, e),
    }
}

/// Masks everything without waiting on a lock that may never be released.
pub fn silence() {
    if let Some(mut pics) = PICS.try_lock() {
        pics.set_masks(IrqMasks::ALL);
    }
}
