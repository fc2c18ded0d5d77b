use crate::constants::memory::PAGE_SIZE;

pub const PROCESS_CAPACITY: usize = 8;
pub const FD_MAX: usize = 4;
pub const NAME_MAX: usize = 32;

pub const USER_STACK_TOP: u64 = 0x50_0000;
pub const USER_STACK_SIZE: u64 = PAGE_SIZE; // one page for the stack
pub const KERNEL_STACK_TOP: u64 = 0x1_0000;

// Width of a user-mode machine word on the 32-bit target
pub const STACK_WORD: u64 = 4;
