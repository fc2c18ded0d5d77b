//! Exception reporting from the trap path into the process manager.

use crate::constants::idt::{DOUBLE_FAULT_VECTOR, PAGE_FAULT_VECTOR};
use core::fmt;
use x86_64::VirtAddr;

/// What the trap stub captured about an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
    pub error_code: Option<u32>,
    pub instruction_pointer: VirtAddr,
    /// Faulting address for page faults.
    pub address: Option<VirtAddr>,
}

impl Fault {
    pub fn new(vector: u8, instruction_pointer: VirtAddr) -> Self {
        Fault {
            vector,
            error_code: None,
            instruction_pointer,
            address: None,
        }
    }

    pub fn page_fault(error_code: u32, instruction_pointer: VirtAddr, address: VirtAddr) -> Self {
        Fault {
            vector: PAGE_FAULT_VECTOR,
            error_code: Some(error_code),
            instruction_pointer,
            address: Some(address),
        }
    }

    /// Faults that leave the kernel itself in an unknown state.
    pub fn is_fatal(&self) -> bool {
        self.vector == DOUBLE_FAULT_VECTOR
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vector {} at {:#x}",
            self.vector,
            self.instruction_pointer.as_u64()
        )?;
        if let Some(code) = self.error_code {
            write!(f, " error {:#x}", code)?;
        }
        if let Some(address) = self.address {
            write!(f, " address {:#x}", address.as_u64())?;
        }
        Ok(())
    }
}

/// How the trap path continues once the kernel has dealt with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return to whatever was interrupted.
    Resume,
    /// The running process is gone; continue in the kernel's idle path.
    Idle,
    /// Stop the machine.
    Halt,
}
