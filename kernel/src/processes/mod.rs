pub mod elf;
pub mod launch;
pub mod loader;
pub mod process;

pub use launch::{LaunchFrame, Launcher, StartStrategy};
pub use process::{FileRef, Pid, Process, ProcessState, ProcessTable};
