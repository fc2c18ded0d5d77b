//! Serial port interface for UART 16550 communication.
//! Provides thread-safe access to write formatted text to a serial port.
//!
//! Hosted builds have no UART, so the same macros append to an in-memory
//! buffer that can be drained with [`take_output`].

use lazy_static::lazy_static;
use spin::Mutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use uart_16550::SerialPort;

/// COM1 base I/O port.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use alloc::string::String;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static! {
    /// Thread-safe wrapper around the first serial port (COM1).
    /// Initializes the port on first access.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(COM1) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
lazy_static! {
    /// Stand-in for COM1 when running on a host.
    pub static ref SERIAL1: Mutex<String> = Mutex::new(String::new());
}

/// Removes and returns everything printed so far.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn take_output() -> String {
    core::mem::take(&mut *SERIAL1.lock())
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Nowhere to report a failed diagnostic write.
    let _ = SERIAL1.lock().write_fmt(args);
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```
/// vmcore::serial_print!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
///
/// # Examples
/// ```
/// vmcore::serial_println!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
