//! Description of a multi-level paging scheme and its entry encoding.
//!
//! A [`PagingMode`] is an ordered list of levels. The first level is the root
//! register (it has no index bits of its own), the middle levels are page
//! tables, and the last level is the page itself, whose bits are the offset
//! within a page. The address space engine walks any mode described this way.

use crate::{
    constants::memory::{PAGE_SHIFT, PAGE_SIZE},
    error::{KernelError, Result},
};
use core::fmt;
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

/// Deepest paging mode the engine can walk.
pub const MAX_LEVELS: usize = 4;

/// In-memory form of one page table entry (and of the root register).
pub type RawEntry = u32;
pub const ENTRY_SIZE: usize = core::mem::size_of::<RawEntry>();

const FLAG_BITS: RawEntry = 0xfff;
const ADDR_MASK: RawEntry = !FLAG_BITS;

/// Marks a leaf whose frame came from the frame pool and goes back to it on unmap.
pub const OWNED: PageTableFlags = PageTableFlags::BIT_9;

/// Root register bits that survive packing.
pub const ROOT_FLAGS: PageTableFlags =
    PageTableFlags::WRITE_THROUGH.union(PageTableFlags::NO_CACHE);

/// Per-level indices of a virtual address, root first.
pub type Offsets = [usize; MAX_LEVELS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelRole {
    /// The root register. Holds exactly one entry.
    Root,
    /// A page table indexed by `index_bits` of the address.
    Table,
    /// The mapped page; its bits are the in-page offset.
    Leaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub name: &'static str,
    pub index_bits: u32,
    pub role: LevelRole,
}

impl Level {
    pub const fn new(name: &'static str, index_bits: u32, role: LevelRole) -> Self {
        Level {
            name,
            index_bits,
            role,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PagingMode {
    pub name: &'static str,
    pub levels: &'static [Level],
}

/// Two-level 32-bit x86 paging with 4 KiB pages.
pub static X86_PAGING_32: PagingMode = PagingMode {
    name: "32-bit",
    levels: &[
        Level::new("cr3", 0, LevelRole::Root),
        Level::new("pgdir", 10, LevelRole::Table),
        Level::new("pgtbl", 10, LevelRole::Table),
        Level::new("page", PAGE_SHIFT, LevelRole::Leaf),
    ],
};

impl PagingMode {
    /// Checks the level list is something the engine can walk.
    pub fn validate(&self) -> Result<()> {
        let depth = self.levels.len();
        if !(3..=MAX_LEVELS).contains(&depth) {
            return Err(KernelError::InvalidArgument);
        }
        let root = &self.levels[0];
        let leaf = &self.levels[depth - 1];
        if root.role != LevelRole::Root || root.index_bits != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if leaf.role != LevelRole::Leaf || leaf.index_bits != PAGE_SHIFT {
            return Err(KernelError::InvalidArgument);
        }
        for level in &self.levels[1..depth - 1] {
            let table_bytes = (ENTRY_SIZE as u64) << level.index_bits;
            if level.role != LevelRole::Table || level.index_bits == 0 || table_bytes > PAGE_SIZE
            {
                return Err(KernelError::InvalidArgument);
            }
        }
        if self.virtual_bits() > RawEntry::BITS {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, lvl: usize) -> &Level {
        &self.levels[lvl]
    }

    pub fn leaf_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Whether entries stored at `lvl` point straight at pages.
    pub fn entries_point_to_pages(&self, lvl: usize) -> bool {
        lvl + 1 == self.leaf_level()
    }

    /// Number of entries in a table of level `lvl`.
    pub fn entries(&self, lvl: usize) -> usize {
        1 << self.levels[lvl].index_bits
    }

    /// Width of the virtual addresses this mode translates.
    pub fn virtual_bits(&self) -> u32 {
        self.levels.iter().map(|level| level.index_bits).sum()
    }

    /// Bytes of address space one entry at `lvl` spans. For the leaf level
    /// this is one byte, for the root the whole address space.
    pub fn cover_size(&self, lvl: usize) -> u64 {
        let bits: u32 = self.levels[lvl + 1..]
            .iter()
            .map(|level| level.index_bits)
            .sum();
        1 << bits
    }

    /// Size of the whole translated address space.
    pub fn address_space_size(&self) -> u64 {
        self.cover_size(0)
    }

    /// Splits `vaddr` into one index per level. The leaf slot holds the
    /// in-page offset and the root slot is always zero.
    pub fn offsets(&self, vaddr: VirtAddr) -> Offsets {
        let mut offsets = [0; MAX_LEVELS];
        let mut addr = vaddr.as_u64();
        for lvl in (0..self.depth()).rev() {
            let bits = self.levels[lvl].index_bits;
            offsets[lvl] = (addr & ((1 << bits) - 1)) as usize;
            addr >>= bits;
        }
        offsets
    }

    /// Reassembles an address from per-level indices.
    pub fn compose(&self, offsets: &Offsets) -> VirtAddr {
        let addr = self
            .levels
            .iter()
            .zip(offsets)
            .fold(0u64, |addr, (level, &index)| {
                (addr << level.index_bits) | index as u64
            });
        VirtAddr::new(addr)
    }

    /// Bytes left in the span of the entry at `lvl` selected by `offsets`,
    /// counting from the address `offsets` describe.
    pub fn remaining_in_span(&self, lvl: usize, offsets: &Offsets) -> u64 {
        let consumed: u64 = (lvl + 1..self.depth())
            .map(|deeper| offsets[deeper] as u64 * self.cover_size(deeper))
            .sum();
        self.cover_size(lvl) - consumed
    }
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} paging (", self.name)?;
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                write!(f, " > ")?;
            }
            write!(f, "{}:{}", level.name, level.index_bits)?;
        }
        write!(f, ")")
    }
}

/// Packs an entry for a slot whose level plays `role`. Only the root's
/// caching bits survive on the root register.
pub fn pack(paddr: PhysAddr, flags: PageTableFlags, role: LevelRole) -> RawEntry {
    let flags = match role {
        LevelRole::Root => flags & ROOT_FLAGS,
        _ => flags,
    };
    (paddr.as_u64() as RawEntry & ADDR_MASK) | (flags.bits() as RawEntry & FLAG_BITS)
}

pub fn entry_paddr(entry: RawEntry) -> PhysAddr {
    PhysAddr::new((entry & ADDR_MASK) as u64)
}

pub fn entry_flags(entry: RawEntry) -> PageTableFlags {
    PageTableFlags::from_bits_truncate((entry & FLAG_BITS) as u64)
}

/// Root entries have no present bit; any nonzero root counts as present.
pub fn is_present(entry: RawEntry, role: LevelRole) -> bool {
    match role {
        LevelRole::Root => entry != 0,
        _ => entry_flags(entry).contains(PageTableFlags::PRESENT),
    }
}

/// Human readable form of an entry: physical address then flag names.
pub struct EntryDisplay(pub RawEntry);

impl fmt::Display for EntryDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", entry_paddr(self.0).as_u64())?;
        let flags = entry_flags(self.0);
        let names = [
            (PageTableFlags::PRESENT, "P"),
            (PageTableFlags::WRITABLE, "W"),
            (PageTableFlags::USER_ACCESSIBLE, "U"),
            (PageTableFlags::WRITE_THROUGH, "WT"),
            (PageTableFlags::NO_CACHE, "CD"),
            (PageTableFlags::ACCESSED, "A"),
            (PageTableFlags::DIRTY, "D"),
            (PageTableFlags::GLOBAL, "G"),
            (OWNED, "own"),
        ];
        for (flag, name) in names {
            if flags.contains(flag) {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}
