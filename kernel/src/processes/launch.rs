//! Handing control to a loaded process.

use crate::{
    constants::processes::STACK_WORD,
    error::{KernelError, Result},
    memory::{AddressSpace, FramePool},
};
use alloc::vec::Vec;
use x86_64::VirtAddr;

/// How a process gets its first instruction executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStrategy {
    /// Call the entry point as an ordinary kernel function.
    Call,
    /// Drop to user mode on the process stack.
    UserMode,
}

/// Register state a process starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchFrame {
    pub entry: VirtAddr,
    pub stack_pointer: VirtAddr,
    /// Stack the processor switches to on the next trap.
    pub kernel_stack: VirtAddr,
    pub argc: u32,
    pub argv: VirtAddr,
}

/// The machine-specific half of starting a process. Each method runs the
/// process and returns its exit status.
pub trait Launcher {
    fn call(&mut self, frame: &LaunchFrame) -> i32;

    fn enter_user(&mut self, frame: &LaunchFrame) -> i32;
}

impl StartStrategy {
    pub fn launch(self, launcher: &mut dyn Launcher, frame: &LaunchFrame) -> i32 {
        match self {
            StartStrategy::Call => launcher.call(frame),
            StartStrategy::UserMode => launcher.enter_user(frame),
        }
    }
}

/// Copies `argv` onto the stack growing down from `stack_top`, followed by a
/// null-terminated pointer array. Returns the new stack pointer, which is
/// also where the pointer array starts.
pub fn push_args(
    space: &AddressSpace,
    frames: &mut FramePool,
    stack_top: VirtAddr,
    stack_bottom: VirtAddr,
    argv: &[&str],
) -> Result<VirtAddr> {
    let mut sp = stack_top.as_u64();
    let mut pointers = Vec::with_capacity(argv.len() + 1);

    for arg in argv.iter().rev() {
        // string plus NUL, rounded up to whole stack words
        let len = arg.len() as u64 + 1;
        sp = reserve(sp, len.div_ceil(STACK_WORD) * STACK_WORD, stack_bottom)?;
        space.write_bytes(frames, VirtAddr::new(sp), arg.as_bytes())?;
        space.write_bytes(frames, VirtAddr::new(sp + len - 1), &[0])?;
        pointers.push(sp as u32);
    }
    pointers.reverse();
    pointers.push(0);

    sp = reserve(sp, pointers.len() as u64 * STACK_WORD, stack_bottom)?;
    for (i, pointer) in pointers.iter().enumerate() {
        let at = VirtAddr::new(sp + i as u64 * STACK_WORD);
        space.write_bytes(frames, at, &pointer.to_le_bytes())?;
    }
    Ok(VirtAddr::new(sp))
}

fn reserve(sp: u64, bytes: u64, stack_bottom: VirtAddr) -> Result<u64> {
    sp.checked_sub(bytes)
        .filter(|&sp| sp >= stack_bottom.as_u64())
        .ok_or(KernelError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::{structures::paging::PageTableFlags, PhysAddr};

    struct Recorder {
        calls: Vec<(StartStrategy, LaunchFrame)>,
    }

    impl Launcher for Recorder {
        fn call(&mut self, frame: &LaunchFrame) -> i32 {
            self.calls.push((StartStrategy::Call, *frame));
            0
        }

        fn enter_user(&mut self, frame: &LaunchFrame) -> i32 {
            self.calls.push((StartStrategy::UserMode, *frame));
            1
        }
    }

    #[test]
    fn test_strategies_dispatch() {
        let mut launcher = Recorder { calls: Vec::new() };
        let frame = LaunchFrame {
            entry: VirtAddr::new(0x80_0000),
            stack_pointer: VirtAddr::new(0x4f_fff0),
            kernel_stack: VirtAddr::new(0x1_0000),
            argc: 0,
            argv: VirtAddr::new(0x4f_fff0),
        };
        assert_eq!(StartStrategy::Call.launch(&mut launcher, &frame), 0);
        assert_eq!(StartStrategy::UserMode.launch(&mut launcher, &frame), 1);
        assert_eq!(launcher.calls[0], (StartStrategy::Call, frame));
        assert_eq!(launcher.calls[1].0, StartStrategy::UserMode);
    }

    #[test]
    fn test_push_args_layout() {
        let mut frames = FramePool::new(PhysAddr::new(0x10_0000), 4).unwrap();
        let mut space = AddressSpace::new();
        let top = VirtAddr::new(0x50_0000);
        let bottom = VirtAddr::new(0x4f_f000);
        space
            .map_anonymous(
                &mut frames,
                bottom,
                0x1000,
                PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE,
            )
            .unwrap();

        let sp = push_args(&space, &mut frames, top, bottom, &["init", "-v"]).unwrap();
        // "init\0" takes two words, "-v\0" one, then three pointers
        assert_eq!(sp.as_u64(), 0x50_0000 - 8 - 4 - 12);

        let mut table = [0u8; 12];
        space.read_bytes(&mut frames, sp, &mut table).unwrap();
        let first = u32::from_le_bytes([table[0], table[1], table[2], table[3]]);
        let second = u32::from_le_bytes([table[4], table[5], table[6], table[7]]);
        assert_eq!(first, 0x50_0000 - 12);
        assert_eq!(second, 0x50_0000 - 4);
        assert_eq!(&table[8..12], &[0, 0, 0, 0]);

        let mut arg = [0u8; 5];
        space
            .read_bytes(&mut frames, VirtAddr::new(first as u64), &mut arg)
            .unwrap();
        assert_eq!(&arg, b"init\0");
    }

    #[test]
    fn test_push_args_overflow() {
        let mut frames = FramePool::new(PhysAddr::new(0x10_0000), 4).unwrap();
        let mut space = AddressSpace::new();
        let bottom = VirtAddr::new(0x4f_f000);
        space
            .map_anonymous(&mut frames, bottom, 0x1000, PageTableFlags::WRITABLE)
            .unwrap();

        let huge = "a".repeat(0x1000);
        assert_eq!(
            push_args(&space, &mut frames, VirtAddr::new(0x50_0000), bottom, &[huge.as_str()]),
            Err(KernelError::InvalidArgument)
        );
    }
}
