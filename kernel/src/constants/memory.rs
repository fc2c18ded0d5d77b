pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const FRAME_SIZE: usize = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;

/// First physical address handed out by the frame pool.
pub const FRAME_POOL_BASE: u64 = 0x10_0000;
/// 1 MB of pool frames, all of it inside the kernel window.
pub const FRAME_POOL_CAPACITY: usize = 256;

// Identity mapped into every address space
pub const KERNEL_WINDOW_START: u64 = 0;
pub const KERNEL_WINDOW_END: u64 = 0x40_0000;
