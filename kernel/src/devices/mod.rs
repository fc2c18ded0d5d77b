//! Character devices the kernel writes diagnostics and process output to.
//!
//! - Serial port (COM1) for logging, captured in memory on hosted builds
//! - Console file handed to processes as their standard descriptors

pub mod console;
pub mod serial;
