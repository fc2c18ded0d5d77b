//! Builds a process image from an ELF executable on a filesystem.

use crate::{
    config::KernelConfig,
    constants::{memory::PAGE_SIZE, processes::USER_STACK_SIZE},
    error::{KernelError, Result},
    filesys::{File, FileSystem},
    memory::FramePool,
    processes::{
        elf::{self, ProgramHeader},
        process::{Pid, Process, ProcessState},
    },
};
use alloc::vec::Vec;
use log::{debug, error, info, warn};
use x86_64::structures::paging::PageTableFlags;

/// Loads `path` into a new process with the given pid.
///
/// On failure everything the load had mapped goes back to `frames`, the
/// executable is closed, and no process is returned.
pub fn load_path(
    pid: Pid,
    frames: &mut FramePool,
    fs: &mut dyn FileSystem,
    cwd: &str,
    path: &str,
    config: &KernelConfig,
) -> Result<Process> {
    let mut process = Process::new(pid, path);
    info!(target: "process", "loading {} as pid {}", path, pid);

    match load_image(&mut process, frames, fs, cwd, path, config) {
        Ok(()) => {
            process.state = ProcessState::Loaded;
            Ok(process)
        }
        Err(err) => {
            warn!(target: "process", "failed to load {}: {}", path, err);
            Err(discard(process, frames, err))
        }
    }
}

/// Tears down a process that never made it into the table and hands back
/// `err`, the failure that stopped it, even if the teardown fails too.
pub(crate) fn discard(
    mut process: Process,
    frames: &mut FramePool,
    err: KernelError,
) -> KernelError {
    if let Err(teardown) = process.space.cleanup(frames) {
        error!(
            target: "process",
            "teardown of pid {} failed: {}",
            process.pid,
            teardown
        );
    }
    err
}

fn load_image(
    process: &mut Process,
    frames: &mut FramePool,
    fs: &mut dyn FileSystem,
    cwd: &str,
    path: &str,
    config: &KernelConfig,
) -> Result<()> {
    process.space.init(frames, &config.kernel_window)?;

    let stack_bottom = config.user_stack_top - USER_STACK_SIZE;
    process.space.map_anonymous(
        frames,
        stack_bottom,
        USER_STACK_SIZE,
        PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE,
    )?;
    process.stack_top = config.user_stack_top;

    let mut file = fs.open(cwd, path)?;
    let header = elf::read_header(&mut *file)?;
    process.entry = header.entry;

    // Check every segment before touching memory for any of them.
    let mut segments = Vec::new();
    for index in 0..header.phnum {
        let segment = elf::read_program_header(&mut *file, &header, index)?;
        if !segment.is_load() {
            continue;
        }
        check_segment(&segment, config)?;
        segments.push(segment);
    }

    for segment in &segments {
        load_segment(process, frames, &mut *file, segment)?;
    }

    process.exec_file = Some(file);
    Ok(())
}

fn check_segment(segment: &ProgramHeader, config: &KernelConfig) -> Result<()> {
    let mem_size = segment.mem_size as u64;
    if segment.file_size > segment.mem_size {
        return Err(KernelError::InvalidLayout);
    }
    if segment.vaddr.as_u64() + mem_size > 1 << 32 {
        return Err(KernelError::InvalidLayout);
    }
    if config.kernel_window.overlaps(segment.vaddr, mem_size) {
        debug!(
            target: "process",
            "segment {:#x}+{:#x} replaces part of the kernel window",
            segment.vaddr.as_u64(),
            mem_size
        );
    }
    Ok(())
}

fn load_segment(
    process: &mut Process,
    frames: &mut FramePool,
    file: &mut dyn File,
    segment: &ProgramHeader,
) -> Result<()> {
    if segment.mem_size == 0 {
        return Ok(());
    }
    debug!(
        target: "process",
        "segment {:#x}+{:#x} from file offset {:#x} ({:#x} bytes)",
        segment.vaddr.as_u64(),
        segment.mem_size,
        segment.offset,
        segment.file_size
    );

    let mut flags = PageTableFlags::USER_ACCESSIBLE;
    if segment.is_writable() {
        flags |= PageTableFlags::WRITABLE;
    }
    let space = &mut process.space;
    space.map_anonymous(frames, segment.vaddr, segment.mem_size as u64, flags)?;

    // Read straight into the backing frames, one page at a time.
    let file_size = segment.file_size as u64;
    let mut done = 0u64;
    while done < file_size {
        let at = segment.vaddr + done;
        let off = (at.as_u64() % PAGE_SIZE) as usize;
        let chunk = (PAGE_SIZE - off as u64).min(file_size - done) as usize;
        let offset = segment.offset as u64 + done;

        let read = space.with_page(frames, at, |page| {
            file.pread(&mut page[off..off + chunk], offset)
        })??;
        if read != chunk {
            return Err(KernelError::IoError);
        }
        done += chunk as u64;
    }

    space.fill(
        frames,
        segment.vaddr + file_size,
        segment.mem_size as u64 - file_size,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filesys::{FsError, MemoryFileSystem},
        memory::paging_mode::{entry_flags, entry_paddr, RawEntry},
        processes::elf::{
            image::{build, Segment},
            PF_R, PF_W, PF_X,
        },
    };
    use alloc::boxed::Box;
    use x86_64::{PhysAddr, VirtAddr};

    fn config() -> KernelConfig {
        // keep low addresses free for user segments
        KernelConfig::default().with_kernel_window(0x8000_0000, 0x8040_0000)
    }

    fn pool() -> FramePool {
        FramePool::new(PhysAddr::new(0x10_0000), 32).unwrap()
    }

    #[test]
    fn test_load_copies_and_zero_fills() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let image = build(0x1000, &[Segment::load(0x1000, b"\x01\x02\x03\x04", 0x2000, PF_R | PF_X)]);
        fs.insert("/bin/prog", &image).unwrap();

        let process = load_path(7, &mut frames, &mut fs, "/bin", "prog", &config()).unwrap();
        assert_eq!(process.pid, 7);
        assert_eq!(process.name.as_str(), "prog");
        assert_eq!(process.state, ProcessState::Loaded);
        assert_eq!(process.entry, VirtAddr::new(0x1000));
        assert!(process.exec_file.is_some());

        let mut head = [0xffu8; 8];
        process
            .space
            .read_bytes(&mut frames, VirtAddr::new(0x1000), &mut head)
            .unwrap();
        assert_eq!(head, [1, 2, 3, 4, 0, 0, 0, 0]);

        let mut tail = [0xffu8; 16];
        process
            .space
            .read_bytes(&mut frames, VirtAddr::new(0x2ff0), &mut tail)
            .unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_loaded_page_matches_file_then_zeroes() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let pattern: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(7) | 1).collect();
        let image = build(0x1000, &[Segment::load(0x1000, &pattern, 4096, PF_R | PF_X)]);
        fs.insert("/prog", &image).unwrap();

        let config = KernelConfig::default();
        let process = load_path(1, &mut frames, &mut fs, "/", "prog", &config).unwrap();
        assert_eq!(process.entry, VirtAddr::new(0x1000));
        let mut page = alloc::vec![0xaau8; 4096];
        process
            .space
            .read_bytes(&mut frames, VirtAddr::new(0x1000), &mut page)
            .unwrap();
        assert_eq!(&page[..100], &pattern[..]);
        assert!(page[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_segment_and_stack_permissions() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let image = build(
            0x1000,
            &[
                Segment::load(0x1000, b"code", 0x10, PF_R | PF_X),
                Segment::load(0x3000, b"data", 0x10, PF_R | PF_W),
            ],
        );
        fs.insert("/prog", &image).unwrap();
        let config = config();
        let process = load_path(1, &mut frames, &mut fs, "/", "prog", &config).unwrap();

        let flags_at = |frames: &mut FramePool, addr: u64| {
            entry_flags(
                process
                    .space
                    .entry(frames, VirtAddr::new(addr))
                    .unwrap()
                    .unwrap(),
            )
        };
        let code = flags_at(&mut frames, 0x1000);
        assert!(code.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(!code.contains(PageTableFlags::WRITABLE));
        assert!(flags_at(&mut frames, 0x3000).contains(PageTableFlags::WRITABLE));

        let stack = flags_at(&mut frames, config.user_stack_top.as_u64() - 1);
        assert!(stack.contains(PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE));
        assert_eq!(process.stack_top, config.user_stack_top);

        // the kernel window is present in every process
        assert_eq!(
            process
                .space
                .translate(&mut frames, VirtAddr::new(0x8000_1000))
                .unwrap(),
            Some(PhysAddr::new(0x8000_1000))
        );
    }

    #[test]
    fn test_non_load_segments_are_skipped() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let note = Segment {
            kind: 4,
            vaddr: 0x9000,
            data: alloc::vec![9; 8],
            mem_size: 8,
            flags: PF_R,
        };
        let image = build(0x1000, &[note, Segment::load(0x1000, b"x", 1, PF_R)]);
        fs.insert("/prog", &image).unwrap();

        let process = load_path(1, &mut frames, &mut fs, "/", "prog", &config()).unwrap();
        assert!(process
            .space
            .translate(&mut frames, VirtAddr::new(0x9000))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_file_larger_than_memory_is_rejected_untouched() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let image = build(
            0x1000,
            &[
                Segment::load(0x1000, b"fine", 0x10, PF_R),
                Segment::load(0x5000, b"too long", 4, PF_R),
            ],
        );
        fs.insert("/prog", &image).unwrap();

        let result = load_path(1, &mut frames, &mut fs, "/", "prog", &config());
        assert!(matches!(result, Err(KernelError::InvalidLayout)));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn test_segment_inside_kernel_window_gets_its_own_frames() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let image = build(0x1000, &[Segment::load(0x1000, b"x", 1, PF_R)]);
        fs.insert("/prog", &image).unwrap();

        let mut process =
            load_path(1, &mut frames, &mut fs, "/", "prog", &KernelConfig::default()).unwrap();
        let backing = process
            .space
            .translate(&mut frames, VirtAddr::new(0x1000))
            .unwrap()
            .unwrap();
        assert!(frames.is_allocated(frames.find(backing).unwrap()));
        // the rest of the window is still identity mapped
        assert_eq!(
            process
                .space
                .translate(&mut frames, VirtAddr::new(0x2000))
                .unwrap(),
            Some(PhysAddr::new(0x2000))
        );

        process.space.cleanup(&mut frames).unwrap();
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn test_segment_past_4gib_is_rejected() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let image = build(0x1000, &[Segment::load(0xffff_f000, b"x", 0x2000, PF_R)]);
        fs.insert("/prog", &image).unwrap();

        let result = load_path(1, &mut frames, &mut fs, "/", "prog", &config());
        assert!(matches!(result, Err(KernelError::InvalidLayout)));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn test_failed_teardown_keeps_first_error() {
        let mut frames = pool();
        let mut process = Process::new(1, "prog");
        process
            .space
            .map_anonymous(
                &mut frames,
                VirtAddr::new(0x1000),
                0x1000,
                PageTableFlags::USER_ACCESSIBLE,
            )
            .unwrap();

        // second directory entry names a table the pool does not own
        let dir = frames.find(entry_paddr(process.space.root())).unwrap();
        let bogus = 0x9000_0000 | PageTableFlags::PRESENT.bits() as RawEntry;
        frames.access(dir).unwrap().set_entry(1, bogus);

        assert_eq!(
            discard(process, &mut frames, KernelError::IoError),
            KernelError::IoError
        );
    }

    /// Claims to hold more than it will hand out.
    struct Truncated {
        inner: Box<dyn File>,
        limit: u64,
    }

    impl File for Truncated {
        fn pread(&mut self, buf: &mut [u8], offset: u64) -> core::result::Result<usize, FsError> {
            let allowed = self.limit.saturating_sub(offset).min(buf.len() as u64) as usize;
            self.inner.pread(&mut buf[..allowed], offset)
        }

        fn write(&mut self, _buf: &[u8]) -> core::result::Result<usize, FsError> {
            Err(FsError::NotSupported)
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }
    }

    struct TruncatingFs(MemoryFileSystem, u64);

    impl FileSystem for TruncatingFs {
        fn open(&mut self, cwd: &str, path: &str) -> core::result::Result<Box<dyn File>, FsError> {
            let inner = self.0.open(cwd, path)?;
            Ok(Box::new(Truncated {
                inner,
                limit: self.1,
            }))
        }
    }

    #[test]
    fn test_short_read_is_io_error() {
        let mut frames = pool();
        let mut inner = MemoryFileSystem::new();
        let image = build(0x1000, &[Segment::load(0x1000, &[7u8; 64], 0x100, PF_R)]);
        let headers_end = image.len() as u64 - 32;
        inner.insert("/prog", &image).unwrap();
        let mut fs = TruncatingFs(inner, headers_end);

        let result = load_path(1, &mut frames, &mut fs, "/", "prog", &config());
        assert!(matches!(result, Err(KernelError::IoError)));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn test_missing_file() {
        let mut frames = pool();
        let mut fs = MemoryFileSystem::new();
        let result = load_path(1, &mut frames, &mut fs, "/", "nope", &config());
        assert!(matches!(result, Err(KernelError::NotFound)));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn test_pool_exhaustion_during_load() {
        let mut frames = FramePool::new(PhysAddr::new(0x10_0000), 6).unwrap();
        let mut fs = MemoryFileSystem::new();
        let image = build(0x1000, &[Segment::load(0x1000, b"x", 0x8000, PF_R)]);
        fs.insert("/prog", &image).unwrap();

        let result = load_path(1, &mut frames, &mut fs, "/", "prog", &config());
        assert!(matches!(result, Err(KernelError::OutOfMemory)));
        assert_eq!(frames.used_frames(), 0);
    }
}
