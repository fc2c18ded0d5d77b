//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log` crate.
//! Log levels are configured based on build configuration (debug/release).
//!
//! Subsystems tag their records with a target: `pagemap` for address space
//! and frame pool activity, `process` for the process lifecycle.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    /// Determines if a log message should be processed based on its level
    ///
    /// Returns true if the message level is less than or equal to the maximum configured level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Processes and outputs a log record
    ///
    /// Formats messages as "[LEVEL target] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    /// Flush buffered logs (no-op in this implementation)
    fn flush(&self) {}
}

/// Initializes the logging system
///
/// Calling it again after a logger is installed has no effect.
///
/// # Notes
/// * Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init() {
    let installed = log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        )
    });
    if installed.is_err() {
        log::trace!("logger already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::take_output;

    #[test]
    fn test_records_carry_level_and_target() {
        init();
        init();
        log::info!(target: "pagemap", "allocated frame {:#x}", 0x101000);

        let output = take_output();
        assert!(output.contains("[INFO pagemap] allocated frame 0x101000"));
    }
}
