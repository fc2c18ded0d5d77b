//! Boot-time layout the kernel is built around.
//!
//! Everything here has a default matching the stock memory map; tests and
//! alternative boards override individual fields with the `with_*` setters.

use crate::constants::{memory, processes};
use x86_64::{PhysAddr, VirtAddr};

/// Identity-mapped range `[start, end)` shared by every address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelWindow {
    pub start: VirtAddr,
    pub end: VirtAddr,
}

impl KernelWindow {
    pub fn new(start: u64, end: u64) -> Self {
        KernelWindow {
            start: VirtAddr::new(start),
            end: VirtAddr::new(end),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `[start, start + len)` shares any byte with the window.
    pub fn overlaps(&self, start: VirtAddr, len: u64) -> bool {
        len != 0 && start < self.end && start.as_u64().saturating_add(len) > self.start.as_u64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub frame_pool_base: PhysAddr,
    pub frame_pool_capacity: usize,
    pub process_capacity: usize,
    pub kernel_window: KernelWindow,
    /// Highest address of the initial user stack; the stack page sits just below it.
    pub user_stack_top: VirtAddr,
    pub kernel_stack_top: VirtAddr,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            frame_pool_base: PhysAddr::new(memory::FRAME_POOL_BASE),
            frame_pool_capacity: memory::FRAME_POOL_CAPACITY,
            process_capacity: processes::PROCESS_CAPACITY,
            kernel_window: KernelWindow::new(
                memory::KERNEL_WINDOW_START,
                memory::KERNEL_WINDOW_END,
            ),
            user_stack_top: VirtAddr::new(processes::USER_STACK_TOP),
            kernel_stack_top: VirtAddr::new(processes::KERNEL_STACK_TOP),
        }
    }
}

impl KernelConfig {
    pub fn with_frame_pool(mut self, base: u64, capacity: usize) -> Self {
        self.frame_pool_base = PhysAddr::new(base);
        self.frame_pool_capacity = capacity;
        self
    }

    pub fn with_process_capacity(mut self, capacity: usize) -> Self {
        self.process_capacity = capacity;
        self
    }

    pub fn with_kernel_window(mut self, start: u64, end: u64) -> Self {
        self.kernel_window = KernelWindow::new(start, end);
        self
    }

    pub fn with_user_stack_top(mut self, top: u64) -> Self {
        self.user_stack_top = VirtAddr::new(top);
        self
    }
}
