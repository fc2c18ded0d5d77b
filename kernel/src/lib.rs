#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod arch;
pub mod config;
pub mod constants;
pub mod devices;
pub mod error;
pub mod filesys;
pub mod interrupts;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;

pub use devices::serial;

pub use error::{KernelError, Result};
