//! Processor state the memory manager drives: control registers and the
//! interrupt flag.
//!
//! Everything goes through the [`Cpu`] trait so paging setup can run against
//! real hardware on bare metal and against [`SimulatedCpu`] everywhere else.

pub mod paging;

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRegister {
    Cr0,
    Cr3,
    Cr4,
}

pub trait Cpu: Send {
    fn read(&self, reg: ControlRegister) -> u64;

    /// # Safety
    ///
    /// Writing control registers changes how every memory access is
    /// translated. The caller must make sure the new value describes
    /// mappings the running code can continue under.
    unsafe fn write(&mut self, reg: ControlRegister, value: u64);

    fn interrupts_enabled(&self) -> bool;

    fn set_interrupts_enabled(&mut self, enabled: bool);
}

/// One recorded control register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub reg: ControlRegister,
    pub value: u64,
    /// Interrupt flag at the moment of the write.
    pub interrupts_enabled: bool,
}

/// Register file kept in memory. Records every write it sees.
#[derive(Debug, Default, Clone)]
pub struct SimulatedCpu {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub interrupts: bool,
    pub writes: Vec<RegisterWrite>,
}

impl SimulatedCpu {
    /// Paging off, interrupts on: the state a freshly booted kernel runs in.
    pub fn new() -> Self {
        SimulatedCpu {
            interrupts: true,
            ..Default::default()
        }
    }
}

impl Cpu for SimulatedCpu {
    fn read(&self, reg: ControlRegister) -> u64 {
        match reg {
            ControlRegister::Cr0 => self.cr0,
            ControlRegister::Cr3 => self.cr3,
            ControlRegister::Cr4 => self.cr4,
        }
    }

    unsafe fn write(&mut self, reg: ControlRegister, value: u64) {
        match reg {
            ControlRegister::Cr0 => self.cr0 = value,
            ControlRegister::Cr3 => self.cr3 = value,
            ControlRegister::Cr4 => self.cr4 = value,
        }
        self.writes.push(RegisterWrite {
            reg,
            value,
            interrupts_enabled: self.interrupts,
        });
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.interrupts = enabled;
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use hardware::HardwareCpu;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hardware {
    use super::{ControlRegister, Cpu};
    use x86_64::{
        instructions::interrupts,
        registers::control::{Cr0, Cr3, Cr4},
        structures::paging::PhysFrame,
        PhysAddr,
    };

    /// The processor the kernel is running on.
    pub struct HardwareCpu {
        _private: (),
    }

    impl HardwareCpu {
        /// # Safety
        ///
        /// Only one `HardwareCpu` may exist per core.
        pub unsafe fn new() -> Self {
            HardwareCpu { _private: () }
        }
    }

    impl Cpu for HardwareCpu {
        fn read(&self, reg: ControlRegister) -> u64 {
            match reg {
                ControlRegister::Cr0 => Cr0::read_raw(),
                ControlRegister::Cr3 => {
                    let (frame, flags) = Cr3::read_raw();
                    frame.start_address().as_u64() | flags as u64
                }
                ControlRegister::Cr4 => Cr4::read_raw(),
            }
        }

        unsafe fn write(&mut self, reg: ControlRegister, value: u64) {
            match reg {
                ControlRegister::Cr0 => Cr0::write_raw(value),
                ControlRegister::Cr3 => {
                    let frame = PhysFrame::containing_address(PhysAddr::new(value & !0xfff));
                    Cr3::write_raw(frame, (value & 0xfff) as u16)
                }
                ControlRegister::Cr4 => Cr4::write_raw(value),
            }
        }

        fn interrupts_enabled(&self) -> bool {
            interrupts::are_enabled()
        }

        fn set_interrupts_enabled(&mut self, enabled: bool) {
            if enabled {
                interrupts::enable();
            } else {
                interrupts::disable();
            }
        }
    }
}
