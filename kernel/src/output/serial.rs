use core::fmt::Write;

use lazy_static::lazy_static;
use spinning_top::Spinlock;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

pub const COM1: u16 = 0x3F8;

lazy_static! {
    pub static ref SERIAL_PORT: Spinlock<SerialPort> = unsafe {
        let mut s = SerialPort::new(COM1);
        s.init();
        Spinlock::new(s)
    };
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::output::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    // Interrupt handlers log too, so the port must never be held across one.
    without_interrupts(|| {
        let _ = SERIAL_PORT.lock().write_fmt(args);
    });
}

/// Releases the port if the panicking code was in the middle of printing.
///
/// # Safety
/// Only for the panic path, once nothing else will run.
pub unsafe fn force_unlock() {
    SERIAL_PORT.force_unlock();
}
