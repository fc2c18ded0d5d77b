//! Turning paging on and switching page table roots.

use crate::{
    arch::{ControlRegister, Cpu},
    error::{KernelError, Result},
    memory::RawEntry,
};
use core::fmt;
use log::{debug, info};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};

const CR0_PG: u64 = Cr0Flags::PAGING.bits();
const CR4_PAE: u64 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
const CR4_PSE: u64 = Cr4Flags::PAGE_SIZE_EXTENSION.bits();

/// Translation scheme the processor is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingState {
    Disabled,
    Paging32,
    Pae,
}

impl fmt::Display for PagingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingState::Disabled => write!(f, "paging disabled"),
            PagingState::Paging32 => write!(f, "32-bit paging"),
            PagingState::Pae => write!(f, "PAE paging"),
        }
    }
}

pub fn current_mode(cpu: &dyn Cpu) -> PagingState {
    if cpu.read(ControlRegister::Cr0) & CR0_PG == 0 {
        PagingState::Disabled
    } else if cpu.read(ControlRegister::Cr4) & CR4_PAE != 0 {
        PagingState::Pae
    } else {
        PagingState::Paging32
    }
}

/// Executes a closure with interrupts disabled, restoring the previous
/// interrupt state after.
pub fn without_interrupts<F, R>(cpu: &mut dyn Cpu, f: F) -> R
where
    F: FnOnce(&mut dyn Cpu) -> R,
{
    let initially_enabled = cpu.interrupts_enabled();
    if initially_enabled {
        cpu.set_interrupts_enabled(false);
    }

    let result = f(&mut *cpu);

    if initially_enabled {
        cpu.set_interrupts_enabled(true);
    }

    result
}

/// Makes `root` the active page table root.
pub fn set_root(cpu: &mut dyn Cpu, root: RawEntry) {
    without_interrupts(cpu, |cpu| {
        debug!(target: "pagemap", "root <- {:#010x}", root);
        // SAFETY: every address space maps the kernel window the caller runs in
        unsafe { cpu.write(ControlRegister::Cr3, root as u64) };
    })
}

/// Brings the processor to 32-bit paging with `root` active.
///
/// If paging is already on in 32-bit mode only the root changes. PAE paging
/// is left alone and reported as unsupported. Otherwise PAE and large pages
/// are turned off, the root installed and paging enabled, in that order.
pub fn init_cpu_paging(cpu: &mut dyn Cpu, root: RawEntry) -> Result<()> {
    without_interrupts(cpu, |cpu| {
        match current_mode(cpu) {
            PagingState::Pae => return Err(KernelError::Unsupported),
            PagingState::Paging32 => {
                debug!(target: "pagemap", "paging already enabled, switching root");
                // SAFETY: see `set_root`
                unsafe { cpu.write(ControlRegister::Cr3, root as u64) };
                return Ok(());
            }
            PagingState::Disabled => {}
        }
        if root == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let cr4 = cpu.read(ControlRegister::Cr4) & !(CR4_PAE | CR4_PSE);
        let cr0 = cpu.read(ControlRegister::Cr0) | CR0_PG;
        // SAFETY: the root identity maps the kernel window, so execution
        // continues at the same addresses once translation starts
        unsafe {
            cpu.write(ControlRegister::Cr4, cr4);
            cpu.write(ControlRegister::Cr3, root as u64);
            cpu.write(ControlRegister::Cr0, cr0);
        }
        info!(target: "pagemap", "enabled {}", current_mode(cpu));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{RegisterWrite, SimulatedCpu};

    #[test]
    fn test_enable_from_disabled() {
        let mut cpu = SimulatedCpu::new();
        cpu.cr4 = CR4_PSE | Cr4Flags::OSFXSR.bits();

        init_cpu_paging(&mut cpu, 0x10_0000).unwrap();

        assert_eq!(current_mode(&cpu), PagingState::Paging32);
        assert_eq!(cpu.cr3, 0x10_0000);
        assert_eq!(cpu.cr4, Cr4Flags::OSFXSR.bits());
        let order: alloc::vec::Vec<_> = cpu.writes.iter().map(|w| w.reg).collect();
        assert_eq!(
            order,
            [ControlRegister::Cr4, ControlRegister::Cr3, ControlRegister::Cr0]
        );
        assert!(cpu.writes.iter().all(|w| !w.interrupts_enabled));
        assert!(cpu.interrupts);
    }

    #[test]
    fn test_zero_root_is_rejected() {
        let mut cpu = SimulatedCpu::new();
        assert_eq!(
            init_cpu_paging(&mut cpu, 0),
            Err(KernelError::InvalidArgument)
        );
        assert!(cpu.writes.is_empty());
        assert!(cpu.interrupts);
    }

    #[test]
    fn test_pae_is_unsupported() {
        let mut cpu = SimulatedCpu::new();
        cpu.cr0 = CR0_PG;
        cpu.cr4 = CR4_PAE;
        assert_eq!(
            init_cpu_paging(&mut cpu, 0x10_0000),
            Err(KernelError::Unsupported)
        );
        assert!(cpu.writes.is_empty());
    }

    #[test]
    fn test_already_paging_only_switches_root() {
        let mut cpu = SimulatedCpu::new();
        cpu.cr0 = CR0_PG;
        init_cpu_paging(&mut cpu, 0x10_2000).unwrap();
        assert_eq!(
            cpu.writes,
            [RegisterWrite {
                reg: ControlRegister::Cr3,
                value: 0x10_2000,
                interrupts_enabled: false,
            }]
        );
    }

    #[test]
    fn test_set_root_restores_interrupt_state() {
        let mut cpu = SimulatedCpu::new();
        cpu.interrupts = false;
        set_root(&mut cpu, 0x10_3000);
        assert_eq!(cpu.cr3, 0x10_3000);
        assert!(!cpu.interrupts);

        cpu.interrupts = true;
        set_root(&mut cpu, 0x10_4000);
        assert!(!cpu.writes[1].interrupts_enabled);
        assert!(cpu.interrupts);
    }

    #[test]
    fn test_describe_mode() {
        let mut cpu = SimulatedCpu::new();
        assert_eq!(alloc::format!("{}", current_mode(&cpu)), "paging disabled");
        cpu.cr0 = CR0_PG;
        assert_eq!(alloc::format!("{}", current_mode(&cpu)), "32-bit paging");
    }
}
