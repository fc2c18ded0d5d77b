//! Process records and the fixed-size table that holds them.

use crate::{
    constants::processes::{FD_MAX, NAME_MAX},
    error::{KernelError, Result},
    filesys::{basename, File},
    memory::AddressSpace,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use arrayvec::ArrayString;
use log::debug;
use spin::Mutex;
use x86_64::VirtAddr;

pub type Pid = u32;

/// Open file shared between descriptor slots (and processes).
pub type FileRef = Arc<Mutex<Box<dyn File>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot claimed, image still being read in.
    Loading,
    /// Image and stack mapped; ready to start.
    Loaded,
    Running,
    /// Finished on its own; the slot is released right after.
    Exited(i32),
    Killed,
}

pub struct Process {
    pub pid: Pid,
    pub name: ArrayString<NAME_MAX>,
    pub state: ProcessState,
    pub space: AddressSpace,
    pub entry: VirtAddr,
    pub stack_top: VirtAddr,
    /// Kept open for the life of the process.
    pub exec_file: Option<Box<dyn File>>,
    fds: [Option<FileRef>; FD_MAX],
}

impl Process {
    /// Fresh process record named after the last component of `path`.
    pub fn new(pid: Pid, path: &str) -> Self {
        let mut name = ArrayString::new();
        for c in basename(path).chars() {
            if name.try_push(c).is_err() {
                break;
            }
        }
        Process {
            pid,
            name,
            state: ProcessState::Loading,
            space: AddressSpace::new(),
            entry: VirtAddr::zero(),
            stack_top: VirtAddr::zero(),
            exec_file: None,
            fds: Default::default(),
        }
    }

    /// Puts `file` in the lowest free descriptor slot.
    pub fn install_fd(&mut self, file: FileRef) -> Result<usize> {
        let fd = self
            .fds
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::ResourceExhausted)?;
        self.fds[fd] = Some(file);
        Ok(fd)
    }

    pub fn fd(&self, fd: usize) -> Result<&FileRef> {
        self.fds
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn close_fd(&mut self, fd: usize) -> Result<()> {
        self.fds
            .get_mut(fd)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn open_fds(&self) -> usize {
        self.fds.iter().filter(|fd| fd.is_some()).count()
    }
}

/// Fixed number of process slots plus the pid counter.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    next_pid: Pid,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        ProcessTable {
            slots: (0..capacity).map(|_| None).collect(),
            next_pid: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks a free slot and the pid its next process gets. Pids are never reused.
    pub fn reserve(&mut self) -> Result<(usize, Pid)> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::ResourceExhausted)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        Ok((slot, pid))
    }

    pub fn insert(&mut self, slot: usize, process: Process) -> Result<()> {
        match self.slots.get_mut(slot) {
            Some(entry @ None) => {
                *entry = Some(process);
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.iter().find(|process| process.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|process| process.pid == pid)
    }

    /// Empties the slot holding `pid`, handing the process back.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|process| process.pid == pid))
            .and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().flatten()
    }

    pub fn log_contents(&self) {
        debug!(target: "process", "process table ({}/{} slots):", self.len(), self.capacity());
        for process in self.iter() {
            debug!(
                target: "process",
                "  pid {}: {} {:?} entry {:#x} root {:#010x}",
                process.pid,
                process.name,
                process.state,
                process.entry.as_u64(),
                process.space.root()
            );
        }
    }
}
