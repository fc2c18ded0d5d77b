//! Kernel context: the frame pool, the kernel's own address space, the
//! process table and the processor, plus the process lifecycle built on them.

use crate::{
    arch::{paging, Cpu},
    config::KernelConfig,
    constants::processes::USER_STACK_SIZE,
    error::{KernelError, Result},
    filesys::FileSystem,
    interrupts::{Disposition, Fault},
    memory::{AddressSpace, FramePool},
    processes::{
        launch, loader, FileRef, LaunchFrame, Launcher, Pid, Process, ProcessState,
        ProcessTable, StartStrategy,
    },
};
use alloc::boxed::Box;
use log::{debug, error, info};
use spin::Mutex;

/// The single kernel instance, once booted.
pub static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Runs `f` against the installed kernel, or returns `None` before boot.
pub fn with_kernel<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Kernel) -> R,
{
    let mut guard = KERNEL.lock();
    guard.as_mut().map(f)
}

pub struct Kernel {
    config: KernelConfig,
    frames: FramePool,
    kernel_space: AddressSpace,
    processes: ProcessTable,
    cpu: Box<dyn Cpu>,
    current: Option<Pid>,
    console: Option<FileRef>,
}

impl Kernel {
    pub fn new(config: KernelConfig, frames: FramePool, cpu: Box<dyn Cpu>) -> Self {
        Kernel {
            processes: ProcessTable::new(config.process_capacity),
            config,
            frames,
            kernel_space: AddressSpace::new(),
            cpu,
            current: None,
            console: None,
        }
    }

    /// Builds the kernel address space and switches the processor onto it.
    pub fn init_paging(&mut self) -> Result<()> {
        self.kernel_space
            .init(&mut self.frames, &self.config.kernel_window)?;
        paging::init_cpu_paging(&mut *self.cpu, self.kernel_space.root())?;
        info!(
            target: "pagemap",
            "kernel window {:#x}..{:#x} mapped, {} of {} frames free",
            self.config.kernel_window.start.as_u64(),
            self.config.kernel_window.end.as_u64(),
            self.frames.free_frames(),
            self.frames.capacity()
        );
        Ok(())
    }

    /// File new processes get as their first three descriptors.
    pub fn set_console(&mut self, console: FileRef) {
        self.console = Some(console);
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FramePool {
        &mut self.frames
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    pub fn cpu(&self) -> &dyn Cpu {
        &*self.cpu
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(pid)
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Loads `path` into a free process slot.
    pub fn spawn(&mut self, fs: &mut dyn FileSystem, cwd: &str, path: &str) -> Result<Pid> {
        let (slot, pid) = self.processes.reserve()?;
        let mut process = loader::load_path(pid, &mut self.frames, fs, cwd, path, &self.config)?;

        if let Err(err) = self.attach_stdio(&mut process) {
            return Err(loader::discard(process, &mut self.frames, err));
        }
        self.processes.insert(slot, process)?;
        info!(
            target: "process",
            "pid {} loaded, {} frames free",
            pid,
            self.frames.free_frames()
        );
        Ok(pid)
    }

    /// Descriptors 0, 1 and 2 all refer to the console, when there is one.
    fn attach_stdio(&self, process: &mut Process) -> Result<()> {
        if let Some(console) = &self.console {
            for _ in 0..3 {
                process.install_fd(console.clone())?;
            }
        }
        Ok(())
    }

    /// Runs a loaded process with `argv` until it returns, then tears it down.
    /// Returns the exit status.
    pub fn start(
        &mut self,
        pid: Pid,
        argv: &[&str],
        strategy: StartStrategy,
        launcher: &mut dyn Launcher,
    ) -> Result<i32> {
        let process = self.processes.get_mut(pid).ok_or(KernelError::NotFound)?;
        if process.state != ProcessState::Loaded {
            return Err(KernelError::InvalidArgument);
        }

        let stack_bottom = process.stack_top - USER_STACK_SIZE;
        let sp = launch::push_args(
            &process.space,
            &mut self.frames,
            process.stack_top,
            stack_bottom,
            argv,
        )?;
        let frame = LaunchFrame {
            entry: process.entry,
            stack_pointer: sp,
            kernel_stack: self.config.kernel_stack_top,
            argc: argv.len() as u32,
            argv: sp,
        };
        process.state = ProcessState::Running;
        let root = process.space.root();
        info!(
            target: "process",
            "starting pid {} ({}) at {:#x} via {:?}",
            pid,
            process.name,
            frame.entry.as_u64(),
            strategy
        );

        self.current = Some(pid);
        paging::set_root(&mut *self.cpu, root);
        let status = strategy.launch(launcher, &frame);

        self.exit(status)?;
        Ok(status)
    }

    /// Releases everything `pid` holds and empties its slot. If it was
    /// running the kernel's own root is reinstalled first.
    pub fn close(&mut self, pid: Pid) -> Result<()> {
        let mut process = self.processes.remove(pid).ok_or(KernelError::NotFound)?;
        if self.current == Some(pid) {
            self.current = None;
            paging::set_root(&mut *self.cpu, self.kernel_space.root());
        }

        let result = process.space.cleanup(&mut self.frames);
        debug!(
            target: "process",
            "closed pid {} ({}) {:?}, {} frames free",
            pid,
            process.name,
            process.state,
            self.frames.free_frames()
        );
        result
    }

    pub fn kill(&mut self, pid: Pid) -> Result<Disposition> {
        let process = self.processes.get_mut(pid).ok_or(KernelError::NotFound)?;
        info!(target: "process", "killing pid {} ({})", pid, process.name);
        process.state = ProcessState::Killed;

        let was_running = self.current == Some(pid);
        self.close(pid)?;
        if was_running {
            Ok(Disposition::Idle)
        } else {
            Ok(Disposition::Resume)
        }
    }

    /// Ends the running process with `status`.
    pub fn exit(&mut self, status: i32) -> Result<Disposition> {
        let pid = self.current.ok_or(KernelError::InvalidArgument)?;
        info!(target: "process", "pid {} exited with status {}", pid, status);
        if let Some(process) = self.processes.get_mut(pid) {
            process.state = ProcessState::Exited(status);
        }
        self.close(pid)?;
        Ok(Disposition::Idle)
    }

    /// Writes `buf` to descriptor `fd` of the running process.
    pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
        let pid = self.current.ok_or(KernelError::BadDescriptor)?;
        let process = self.processes.get(pid).ok_or(KernelError::NotFound)?;
        let file = process.fd(fd)?;
        let written = file.lock().write(buf)?;
        Ok(written)
    }

    /// Deals with an exception nobody else handled: the running process is
    /// killed, and with no process to blame the machine halts.
    pub fn handle_exception(&mut self, fault: &Fault) -> Disposition {
        if fault.is_fatal() {
            error!(target: "process", "fatal exception in kernel: {}", fault);
            return Disposition::Halt;
        }
        let Some(pid) = self.current else {
            error!(target: "process", "unhandled exception in kernel: {}", fault);
            return Disposition::Halt;
        };

        if let Some(process) = self.processes.get(pid) {
            error!(
                target: "process",
                "pid {} ({}): unhandled exception: {}",
                pid,
                process.name,
                fault
            );
        }
        match self.kill(pid) {
            Ok(disposition) => disposition,
            Err(err) => {
                error!(target: "process", "could not kill pid {}: {}", pid, err);
                Disposition::Halt
            }
        }
    }
}
