//! Chained 8259 programmable interrupt controllers.
//!
//! The kernel drives the chips through `pic8259`. What lives here is the part that
//! does not touch ports: where the lines land in the vector space, the mask
//! register arithmetic and the spurious-interrupt test.

use core::{
    error::Error,
    fmt::{Display, Formatter},
};

/// Master line the slave is wired to.
pub const CASCADE_LINE: u8 = 2;
pub const LINES: u8 = 16;

/// Command port of each chip, where OCW3 selects the in-service register.
pub const MASTER_COMMAND: u16 = 0x20;
pub const SLAVE_COMMAND: u16 = 0xA0;
pub const OCW3_READ_ISR: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicError {
    InvalidLine(u8),
    InvalidOffset(u8),
    OverlappingOffsets,
    /// Line would be unmasked with nothing registered for its vector
    NoHandler(u8),
}

/// Where the sixteen lines land in the vector space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicLayout {
    master_offset: u8,
    slave_offset: u8,
}

impl PicLayout {
    /// Lines right after the exception vectors.
    pub const DEFAULT: Self = Self {
        master_offset: super::PIC_MASTER_OFFSET,
        slave_offset: super::PIC_SLAVE_OFFSET,
    };

    /// Offsets must be multiples of 8 above the exception vectors and may not share a block.
    pub fn new(master_offset: u8, slave_offset: u8) -> Result<Self, PicError> {
        for offset in [master_offset, slave_offset] {
            if offset % 8 != 0 || offset < 32 {
                return Err(PicError::InvalidOffset(offset));
            }
        }
        if master_offset == slave_offset {
            return Err(PicError::OverlappingOffsets);
        }

        Ok(Self {
            master_offset,
            slave_offset,
        })
    }

    pub fn offsets(&self) -> (u8, u8) {
        (self.master_offset, self.slave_offset)
    }

    pub fn vector_for_line(&self, line: u8) -> Result<u8, PicError> {
        check_line(line)?;
        Ok(match line {
            0..=7 => self.master_offset + line,
            _ => self.slave_offset + line - 8,
        })
    }

    pub fn line_for_vector(&self, vector: u8) -> Option<u8> {
        let within = |offset: u8| vector.checked_sub(offset).filter(|&line| line < 8);
        within(self.master_offset).or_else(|| within(self.slave_offset).map(|line| line + 8))
    }
}

/// Both interrupt mask registers, master in the low byte. A set bit masks the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqMasks(u16);

impl IrqMasks {
    pub const ALL: Self = Self(0xFFFF);

    pub const fn from_registers(master: u8, slave: u8) -> Self {
        Self(master as u16 | ((slave as u16) << 8))
    }

    /// `(master, slave)` register values.
    pub const fn registers(&self) -> (u8, u8) {
        (self.0 as u8, (self.0 >> 8) as u8)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub fn mask(self, line: u8) -> Result<Self, PicError> {
        check_line(line)?;
        Ok(Self(self.0 | (1 << line)))
    }

    /// Unmasking a slave line also opens the cascade on the master.
    pub fn unmask(self, line: u8) -> Result<Self, PicError> {
        check_line(line)?;
        let mut bits = self.0 & !(1 << line);
        if line >= 8 {
            bits &= !(1 << CASCADE_LINE);
        }
        Ok(Self(bits))
    }

    pub fn is_masked(&self, line: u8) -> Result<bool, PicError> {
        check_line(line)?;
        Ok(self.0 & (1 << line) != 0)
    }

    /// Whether a request on `line` reaches the CPU.
    pub fn delivers(&self, line: u8) -> Result<bool, PicError> {
        if self.is_masked(line)? {
            return Ok(false);
        }
        Ok(line < 8 || !self.is_masked(CASCADE_LINE)?)
    }
}

/// Command port to read the in-service register from when `line` may be spurious.
pub fn spurious_candidate(line: u8) -> Option<u16> {
    match line {
        7 => Some(MASTER_COMMAND),
        15 => Some(SLAVE_COMMAND),
        _ => None,
    }
}

/// A line 7 or 15 request with no matching in-service bit was never really raised.
pub fn is_spurious(line: u8, in_service: u8) -> bool {
    spurious_candidate(line).is_some() && in_service & 0x80 == 0
}

fn check_line(line: u8) -> Result<(), PicError> {
    if line < LINES {
        Ok(())
    } else {
        Err(PicError::InvalidLine(line))
    }
}

impl Display for PicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            PicError::InvalidLine(line) => write!(f, "IRQ line {} does not exist", line),
            PicError::InvalidOffset(offset) => write!(f, "invalid vector offset {:#x}", offset),
            PicError::OverlappingOffsets => write!(f, "master and slave vectors overlap"),
            PicError::NoHandler(line) => write!(f, "IRQ line {} has no handler", line),
        }
    }
}

impl Error for PicError {}
