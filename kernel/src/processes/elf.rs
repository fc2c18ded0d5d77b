//! ELF32 little-endian executable headers, read straight from an open file.
//!
//! - File header: 52 bytes
//! - Program header: 32 bytes each

use crate::{
    error::{KernelError, Result},
    filesys::File,
};
use x86_64::VirtAddr;

/// ELF Magic Number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;

/// Program Header Type: Loadable segment
pub const PT_LOAD: u32 = 1;

/// Segment Flags
pub const PF_X: u32 = 1; // Execute
pub const PF_W: u32 = 2; // Write
pub const PF_R: u32 = 4; // Read

const HEADER_SIZE: usize = 52;
const PROGRAM_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: VirtAddr,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub offset: u32,
    pub vaddr: VirtAddr,
    pub file_size: u32,
    pub mem_size: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Fills `buf` from `offset`; anything short of that is a truncated executable.
fn read_exact(file: &mut dyn File, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = file.pread(buf, offset)?;
    if n != buf.len() {
        return Err(KernelError::BadExecutable);
    }
    Ok(())
}

pub fn read_header(file: &mut dyn File) -> Result<ElfHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    read_exact(file, &mut buf, 0)?;

    if buf[0..4] != ELF_MAGIC || buf[4] != ELFCLASS32 || buf[5] != ELFDATA2LSB {
        return Err(KernelError::BadExecutable);
    }
    let header = ElfHeader {
        entry: VirtAddr::new(le_u32(&buf, 24) as u64),
        phoff: le_u32(&buf, 28),
        phentsize: le_u16(&buf, 42),
        phnum: le_u16(&buf, 44),
    };
    if header.phnum > 0 && (header.phentsize as usize) < PROGRAM_HEADER_SIZE {
        return Err(KernelError::BadExecutable);
    }
    Ok(header)
}

pub fn read_program_header(
    file: &mut dyn File,
    header: &ElfHeader,
    index: u16,
) -> Result<ProgramHeader> {
    if index >= header.phnum {
        return Err(KernelError::InvalidArgument);
    }
    let offset = header.phoff as u64 + index as u64 * header.phentsize as u64;
    let mut buf = [0u8; PROGRAM_HEADER_SIZE];
    read_exact(file, &mut buf, offset)?;

    Ok(ProgramHeader {
        kind: le_u32(&buf, 0),
        offset: le_u32(&buf, 4),
        vaddr: VirtAddr::new(le_u32(&buf, 8) as u64),
        file_size: le_u32(&buf, 16),
        mem_size: le_u32(&buf, 20),
        flags: le_u32(&buf, 24),
        align: le_u32(&buf, 28),
    })
}

/// Builds small ELF32 images for tests.
#[cfg(test)]
pub(crate) mod image {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    pub struct Segment {
        pub kind: u32,
        pub vaddr: u32,
        pub data: Vec<u8>,
        pub mem_size: u32,
        pub flags: u32,
    }

    impl Segment {
        pub fn load(vaddr: u32, data: &[u8], mem_size: u32, flags: u32) -> Self {
            Segment {
                kind: PT_LOAD,
                vaddr,
                data: data.to_vec(),
                mem_size,
                flags,
            }
        }
    }

    /// Header, then program headers, then each segment's bytes in order.
    pub fn build(entry: u32, segments: &[Segment]) -> Vec<u8> {
        let phoff = HEADER_SIZE;
        let mut data_offset = phoff + segments.len() * PROGRAM_HEADER_SIZE;

        let mut image = vec![0u8; HEADER_SIZE];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[6] = 1;
        image[16..18].copy_from_slice(&2u16.to_le_bytes());
        image[18..20].copy_from_slice(&3u16.to_le_bytes());
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        image[40..42].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        image[42..44].copy_from_slice(&(PROGRAM_HEADER_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        for segment in segments {
            let mut ph = [0u8; PROGRAM_HEADER_SIZE];
            ph[0..4].copy_from_slice(&segment.kind.to_le_bytes());
            ph[4..8].copy_from_slice(&(data_offset as u32).to_le_bytes());
            ph[8..12].copy_from_slice(&segment.vaddr.to_le_bytes());
            ph[12..16].copy_from_slice(&segment.vaddr.to_le_bytes());
            ph[16..20].copy_from_slice(&(segment.data.len() as u32).to_le_bytes());
            ph[20..24].copy_from_slice(&segment.mem_size.to_le_bytes());
            ph[24..28].copy_from_slice(&segment.flags.to_le_bytes());
            ph[28..32].copy_from_slice(&0x1000u32.to_le_bytes());
            image.extend_from_slice(&ph);
            data_offset += segment.data.len();
        }
        for segment in segments {
            image.extend_from_slice(&segment.data);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::image::{build, Segment};
    use super::*;
    use crate::filesys::MemoryFile;

    #[test]
    fn test_read_headers() {
        let bytes = build(
            0x80_1000,
            &[
                Segment::load(0x80_0000, b"text", 0x10, PF_R | PF_X),
                Segment {
                    kind: 4,
                    vaddr: 0,
                    data: alloc::vec![1, 2],
                    mem_size: 2,
                    flags: PF_R,
                },
            ],
        );
        let mut file = MemoryFile::new(&bytes);

        let header = read_header(&mut file).unwrap();
        assert_eq!(header.entry, VirtAddr::new(0x80_1000));
        assert_eq!(header.phnum, 2);

        let text = read_program_header(&mut file, &header, 0).unwrap();
        assert!(text.is_load());
        assert!(!text.is_writable());
        assert_eq!(text.vaddr, VirtAddr::new(0x80_0000));
        assert_eq!(text.file_size, 4);
        assert_eq!(text.mem_size, 0x10);
        assert_eq!(text.offset, 52 + 2 * 32);

        let note = read_program_header(&mut file, &header, 1).unwrap();
        assert!(!note.is_load());
        assert_eq!(
            read_program_header(&mut file, &header, 2),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_rejects_non_elf() {
        let mut file = MemoryFile::new(&[0u8; 64]);
        assert_eq!(read_header(&mut file), Err(KernelError::BadExecutable));

        let mut short = MemoryFile::new(&ELF_MAGIC);
        assert_eq!(read_header(&mut short), Err(KernelError::BadExecutable));
    }

    #[test]
    fn test_truncated_program_header() {
        let mut bytes = build(0x1000, &[Segment::load(0x80_0000, b"", 0x10, PF_R)]);
        bytes.truncate(60);
        let mut file = MemoryFile::new(&bytes);
        let header = read_header(&mut file).unwrap();
        assert_eq!(
            read_program_header(&mut file, &header, 0),
            Err(KernelError::BadExecutable)
        );
    }
}
