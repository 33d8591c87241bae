//! Boot configuration read from the kernel command line.
//!
//! The line is a whitespace-separated list of `key=value` tokens:
//!
//! ```text
//! log=debug heap=2M heap_max=64M pic=32
//! ```

use core::{
    error::Error,
    fmt::{Display, Formatter},
};
use log::{warn, LevelFilter};

use crate::{
    interrupts::PIC_MASTER_OFFSET,
    memory::{address::align_up, PAGE_SIZE},
};

pub const DEFAULT_HEAP_SIZE: usize = 1024 * 1024;
pub const DEFAULT_HEAP_MAX: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub log_level: LevelFilter,
    /// Bytes mapped for the heap at boot
    pub heap_size: usize,
    /// Bytes the heap may grow to
    pub heap_max: usize,
    pub pic_master_offset: u8,
    pub pic_slave_offset: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    MissingValue,
    InvalidLogLevel,
    InvalidSize,
    InvalidOffset,
    /// Initial heap larger than its limit
    HeapExceedsLimit,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            heap_size: DEFAULT_HEAP_SIZE,
            heap_max: DEFAULT_HEAP_MAX,
            pic_master_offset: PIC_MASTER_OFFSET,
            pic_slave_offset: PIC_MASTER_OFFSET + 8,
        }
    }
}

impl BootConfig {
    pub fn parse(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                warn!("Ignoring command line token {:?}", token);
                continue;
            };
            if value.is_empty() {
                return Err(ConfigError::MissingValue);
            }

            match key {
                "log" => config.log_level = parse_level(value)?,
                "heap" => config.heap_size = parse_size(value)?,
                "heap_max" => config.heap_max = parse_size(value)?,
                "pic" => {
                    let offset = value.parse::<u8>().map_err(|_| ConfigError::InvalidOffset)?;
                    if offset % 8 != 0 || offset < 32 || offset > 240 {
                        return Err(ConfigError::InvalidOffset);
                    }
                    config.pic_master_offset = offset;
                    config.pic_slave_offset = offset + 8;
                }
                _ => warn!("Unknown command line option {:?}", key),
            }
        }

        if config.heap_size > config.heap_max {
            return Err(ConfigError::HeapExceedsLimit);
        }

        Ok(config)
    }
}

fn parse_level(value: &str) -> Result<LevelFilter, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidLogLevel)
}

/// Bytes with an optional `K` or `M` suffix, rounded up to whole pages.
fn parse_size(value: &str) -> Result<usize, ConfigError> {
    let (digits, unit) = match value.as_bytes().last() {
        Some(b'K' | b'k') => (&value[..value.len() - 1], 1024),
        Some(b'M' | b'm') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };

    let size = digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .filter(|&n| n > 0 && n <= usize::MAX - PAGE_SIZE)
        .ok_or(ConfigError::InvalidSize)?;

    Ok(align_up(size, PAGE_SIZE))
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        use ConfigError::*;
        let message = match self {
            MissingValue => "option without a value",
            InvalidLogLevel => "unknown log level",
            InvalidSize => "invalid size",
            InvalidOffset => "PIC offset must be a multiple of 8 between 32 and 240",
            HeapExceedsLimit => "initial heap is larger than heap_max",
        };

        write!(f, "{}", message)
    }
}

impl Error for ConfigError {}
