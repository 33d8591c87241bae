//! Hardware-independent core of the Kestrel kernel.
//!
//! Everything in here can be exercised on the host: the kernel binary wires these
//! types to the real CPU (port I/O, control registers, descriptor-table loads) and
//! to the limine boot protocol.
#![cfg_attr(not(test), no_std)]

pub mod boot;
pub mod config;
pub mod cpu;
pub mod interrupts;
pub mod memory;

pub use memory::PAGE_SIZE;
