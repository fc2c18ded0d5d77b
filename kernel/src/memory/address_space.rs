//! Address space engine: builds, edits and tears down page tables.
//!
//! An [`AddressSpace`] is just its root entry plus the paging mode it follows.
//! All tables live in frames of a [`FramePool`], which every operation takes
//! explicitly. Table frames are only ever opened for a single read or write,
//! never across a recursive call, so the walk can touch any frame it needs.

use crate::{
    config::KernelWindow,
    constants::memory::PAGE_SIZE,
    error::{KernelError, Result},
    memory::{
        frame_allocator::FramePool,
        paging_mode::{
            entry_flags, entry_paddr, is_present, pack, EntryDisplay, LevelRole, Offsets,
            PagingMode, RawEntry, OWNED, X86_PAGING_32,
        },
    },
};
use log::{debug, info, trace};
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

/// Where the physical pages of a new mapping come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhysSource {
    /// Consecutive pages starting at this address.
    Fixed(PhysAddr),
    /// A fresh zeroed pool frame per page, owned by the mapping.
    Anonymous,
}

/// Location of an entry the walk reads or writes.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Root,
    Table { frame: PhysFrame, index: usize },
}

pub struct AddressSpace {
    mode: &'static PagingMode,
    root: RawEntry,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// Empty space using 32-bit x86 paging.
    pub fn new() -> Self {
        AddressSpace {
            mode: &X86_PAGING_32,
            root: 0,
        }
    }

    /// Empty space following `mode`, which must pass [`PagingMode::validate`].
    pub fn with_mode(mode: &'static PagingMode) -> Result<Self> {
        mode.validate()?;
        Ok(AddressSpace { mode, root: 0 })
    }

    pub fn mode(&self) -> &'static PagingMode {
        self.mode
    }

    /// Value to load into the root register.
    pub fn root(&self) -> RawEntry {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Identity maps the kernel window into this space.
    pub fn init(&mut self, frames: &mut FramePool, window: &KernelWindow) -> Result<()> {
        self.map(
            frames,
            window.start,
            PhysAddr::new(window.start.as_u64()),
            window.size(),
            PageTableFlags::WRITABLE,
        )
    }

    /// Maps `[vaddr, vaddr + size)` onto consecutive physical pages from `paddr`.
    ///
    /// `vaddr` and `paddr` are rounded down and `size` up to whole pages. A page
    /// that is already mapped to the same physical page keeps its frame and
    /// gains `flags`. If the walk runs out of frames, the pages before the
    /// failure stay mapped.
    pub fn map(
        &mut self,
        frames: &mut FramePool,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: u64,
        flags: PageTableFlags,
    ) -> Result<()> {
        let paddr = paddr.align_down(PAGE_SIZE);
        self.map_pages(frames, vaddr, size, PhysSource::Fixed(paddr), flags)
    }

    /// Maps every page touching `[vaddr, vaddr + size)` to its own zeroed
    /// pool frame. Pages this call (or an earlier one) already backed with a
    /// pool frame keep it, so overlapping calls never lose data.
    pub fn map_anonymous(
        &mut self,
        frames: &mut FramePool,
        vaddr: VirtAddr,
        size: u64,
        flags: PageTableFlags,
    ) -> Result<()> {
        let start = vaddr.align_down(PAGE_SIZE);
        let span = (vaddr.as_u64() - start.as_u64()).saturating_add(size);
        self.map_pages(frames, start, span, PhysSource::Anonymous, flags)
    }

    fn map_pages(
        &mut self,
        frames: &mut FramePool,
        vaddr: VirtAddr,
        size: u64,
        source: PhysSource,
        flags: PageTableFlags,
    ) -> Result<()> {
        let vaddr = vaddr.align_down(PAGE_SIZE);
        let size = align_up(size);
        if size == 0 {
            return Ok(());
        }
        let limit = self.mode.address_space_size();
        if vaddr.as_u64().checked_add(size).map_or(true, |end| end > limit) {
            return Err(KernelError::InvalidArgument);
        }
        debug!(
            target: "pagemap",
            "map {:#x}+{:#x} {:?} {:?}", vaddr.as_u64(), size, source, flags
        );

        let mut walk = Walk {
            mode: self.mode,
            frames,
            root: &mut self.root,
            offsets: self.mode.offsets(vaddr),
            remaining: size,
        };
        let mut source = source;
        walk.map(0, Slot::Root, &mut source, flags - OWNED)
    }

    /// Unmaps `[vaddr, vaddr + size)`. Pages nobody mapped are skipped, pool
    /// frames owned by removed pages go back to the pool, and tables left
    /// without a present entry are freed.
    pub fn unmap(&mut self, frames: &mut FramePool, vaddr: VirtAddr, size: u64) -> Result<()> {
        let vaddr = vaddr.align_down(PAGE_SIZE);
        let size = align_up(size).min(
            self.mode
                .address_space_size()
                .saturating_sub(vaddr.as_u64()),
        );
        if size == 0 {
            return Ok(());
        }
        debug!(target: "pagemap", "unmap {:#x}+{:#x}", vaddr.as_u64(), size);

        let mut walk = Walk {
            mode: self.mode,
            frames,
            root: &mut self.root,
            offsets: self.mode.offsets(vaddr),
            remaining: size,
        };
        walk.unmap(0, Slot::Root)
    }

    /// Unmaps everything, returning every frame the space holds to the pool.
    pub fn cleanup(&mut self, frames: &mut FramePool) -> Result<()> {
        self.unmap(frames, VirtAddr::zero(), self.mode.address_space_size())
    }

    /// Leaf entry mapping `vaddr`, if every level down to it is present.
    pub fn entry(&self, frames: &mut FramePool, vaddr: VirtAddr) -> Result<Option<RawEntry>> {
        let offsets = self.mode.offsets(vaddr);
        let mut entry = self.root;
        let mut lvl = 0;
        loop {
            if !is_present(entry, self.mode.level(lvl).role) {
                return Ok(None);
            }
            if self.mode.entries_point_to_pages(lvl) {
                return Ok(Some(entry));
            }
            let table = frames.find(entry_paddr(entry))?;
            entry = frames.access(table)?.entry(offsets[lvl + 1]);
            lvl += 1;
        }
    }

    /// Physical address `vaddr` translates to.
    pub fn translate(&self, frames: &mut FramePool, vaddr: VirtAddr) -> Result<Option<PhysAddr>> {
        let in_page = vaddr.as_u64() % PAGE_SIZE;
        Ok(self
            .entry(frames, vaddr)?
            .map(|entry| entry_paddr(entry) + in_page))
    }

    /// Runs `f` over the bytes of the pool frame backing the page at `vaddr`.
    /// Unmapped pages and pages outside the pool (the kernel window, say)
    /// are `NotFound`.
    pub fn with_page<R>(
        &self,
        frames: &mut FramePool,
        vaddr: VirtAddr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let entry = self
            .entry(frames, vaddr)?
            .ok_or(KernelError::NotFound)?;
        let frame = frames.find(entry_paddr(entry))?;
        let mut page = frames.access(frame)?;
        Ok(f(&mut page[..]))
    }

    /// Copies `data` into the space starting at `vaddr`.
    pub fn write_bytes(&self, frames: &mut FramePool, vaddr: VirtAddr, data: &[u8]) -> Result<()> {
        self.for_each_chunk(vaddr, data.len() as u64, |at, done, len| {
            self.with_page(frames, at, |page| {
                let off = (at.as_u64() % PAGE_SIZE) as usize;
                page[off..off + len].copy_from_slice(&data[done..done + len]);
            })
        })
    }

    /// Copies bytes starting at `vaddr` into `buf`.
    pub fn read_bytes(&self, frames: &mut FramePool, vaddr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        self.for_each_chunk(vaddr, buf.len() as u64, |at, done, len| {
            self.with_page(frames, at, |page| {
                let off = (at.as_u64() % PAGE_SIZE) as usize;
                buf[done..done + len].copy_from_slice(&page[off..off + len]);
            })
        })
    }

    /// Sets `len` bytes starting at `vaddr` to `value`.
    pub fn fill(&self, frames: &mut FramePool, vaddr: VirtAddr, len: u64, value: u8) -> Result<()> {
        self.for_each_chunk(vaddr, len, |at, _, chunk| {
            self.with_page(frames, at, |page| {
                let off = (at.as_u64() % PAGE_SIZE) as usize;
                page[off..off + chunk].fill(value);
            })
        })
    }

    /// Splits `[vaddr, vaddr + len)` at page boundaries, calling `f` with the
    /// chunk start, bytes handled so far and chunk length.
    fn for_each_chunk(
        &self,
        vaddr: VirtAddr,
        len: u64,
        mut f: impl FnMut(VirtAddr, usize, usize) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0u64;
        while done < len {
            let at = vaddr + done;
            let chunk = (PAGE_SIZE - at.as_u64() % PAGE_SIZE).min(len - done);
            f(at, done as usize, chunk as usize)?;
            done += chunk;
        }
        Ok(())
    }
}

fn align_up(size: u64) -> u64 {
    size.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// State of one map or unmap walk.
///
/// `offsets` always names the next page to visit; when a table is exhausted
/// its index wraps to zero and the parent's index carries.
struct Walk<'a> {
    mode: &'static PagingMode,
    frames: &'a mut FramePool,
    root: &'a mut RawEntry,
    offsets: Offsets,
    remaining: u64,
}

impl Walk<'_> {
    fn load(&mut self, slot: Slot) -> Result<RawEntry> {
        match slot {
            Slot::Root => Ok(*self.root),
            Slot::Table { frame, index } => Ok(self.frames.access(frame)?.entry(index)),
        }
    }

    fn store(&mut self, slot: Slot, entry: RawEntry) -> Result<()> {
        trace!(target: "pagemap", "{:?} <- {}", slot, EntryDisplay(entry));
        match slot {
            Slot::Root => *self.root = entry,
            Slot::Table { frame, index } => self.frames.access(frame)?.set_entry(index, entry),
        }
        Ok(())
    }

    fn role(&self, lvl: usize) -> LevelRole {
        self.mode.level(lvl).role
    }

    /// Maps pages under the entry at `slot`, which sits at level `lvl`.
    fn map(
        &mut self,
        lvl: usize,
        slot: Slot,
        source: &mut PhysSource,
        flags: PageTableFlags,
    ) -> Result<()> {
        if self.mode.entries_point_to_pages(lvl) {
            return self.map_page(lvl, slot, source, flags);
        }

        let mut entry = self.load(slot)?;
        if !is_present(entry, self.role(lvl)) {
            let frame = self.frames.alloc_zeroed()?;
            info!(
                target: "pagemap",
                "allocated frame {:#x} for {}",
                frame.start_address().as_u64(),
                self.mode.level(lvl + 1).name
            );
            entry = pack(
                frame.start_address(),
                flags | PageTableFlags::PRESENT,
                self.role(lvl),
            );
        } else {
            entry = pack(entry_paddr(entry), entry_flags(entry) | flags, self.role(lvl));
        }
        self.store(slot, entry)?;

        let table = self.frames.find(entry_paddr(entry))?;
        let child = lvl + 1;
        while self.offsets[child] < self.mode.entries(child) {
            let index = self.offsets[child];
            self.map(child, Slot::Table { frame: table, index }, source, flags)?;
            self.offsets[child] += 1;
            if self.remaining == 0 {
                return Ok(());
            }
        }
        self.offsets[child] = 0;
        Ok(())
    }

    fn map_page(
        &mut self,
        lvl: usize,
        slot: Slot,
        source: &mut PhysSource,
        flags: PageTableFlags,
    ) -> Result<()> {
        let old = self.load(slot)?;
        let present = is_present(old, self.role(lvl));
        let owned = present && entry_flags(old).contains(OWNED);

        let entry = match *source {
            PhysSource::Fixed(paddr) => {
                *source = PhysSource::Fixed(paddr + PAGE_SIZE);
                if present && entry_paddr(old) == paddr {
                    pack(paddr, entry_flags(old) | flags, self.role(lvl))
                } else {
                    if owned {
                        let stale = self.frames.find(entry_paddr(old))?;
                        self.frames.free(stale)?;
                    }
                    pack(paddr, flags | PageTableFlags::PRESENT, self.role(lvl))
                }
            }
            PhysSource::Anonymous if owned => {
                pack(entry_paddr(old), entry_flags(old) | flags, self.role(lvl))
            }
            PhysSource::Anonymous => {
                let frame = self.frames.alloc_zeroed()?;
                pack(
                    frame.start_address(),
                    flags | PageTableFlags::PRESENT | OWNED,
                    self.role(lvl),
                )
            }
        };
        self.store(slot, entry)?;
        self.remaining = self.remaining.saturating_sub(PAGE_SIZE);
        Ok(())
    }

    /// Unmaps pages under the entry at `slot`, which sits at level `lvl`.
    fn unmap(&mut self, lvl: usize, slot: Slot) -> Result<()> {
        let entry = self.load(slot)?;
        let role = self.role(lvl);

        if !is_present(entry, role) {
            // Nothing mapped below: skip what is left of this entry's span.
            let skip = self.mode.remaining_in_span(lvl, &self.offsets);
            self.remaining = self.remaining.saturating_sub(skip);
            for deeper in lvl + 1..self.mode.depth() {
                self.offsets[deeper] = 0;
            }
            return Ok(());
        }

        if self.mode.entries_point_to_pages(lvl) {
            if entry_flags(entry).contains(OWNED) {
                let frame = self.frames.find(entry_paddr(entry))?;
                self.frames.free(frame)?;
            }
            let cleared = entry_flags(entry) - PageTableFlags::PRESENT - OWNED;
            self.store(slot, pack(entry_paddr(entry), cleared, role))?;
            self.remaining = self.remaining.saturating_sub(PAGE_SIZE);
            return Ok(());
        }

        let table = self.frames.find(entry_paddr(entry))?;
        let child = lvl + 1;
        let mut result = Ok(());
        while self.offsets[child] < self.mode.entries(child) {
            let index = self.offsets[child];
            result = self.unmap(child, Slot::Table { frame: table, index });
            if result.is_err() {
                break;
            }
            self.offsets[child] += 1;
            if self.remaining == 0 {
                break;
            }
        }
        if self.offsets[child] == self.mode.entries(child) {
            self.offsets[child] = 0;
        }

        if self.table_is_empty(table, child)? {
            info!(
                target: "pagemap",
                "freeing {} frame {:#x}",
                self.mode.level(child).name,
                table.start_address().as_u64()
            );
            self.frames.free(table)?;
            let cleared = match role {
                LevelRole::Root => 0,
                _ => entry & !(PageTableFlags::PRESENT.bits() as RawEntry),
            };
            self.store(slot, cleared)?;
        }
        result
    }

    fn table_is_empty(&mut self, table: PhysFrame, lvl: usize) -> Result<bool> {
        let entries = self.mode.entries(lvl);
        let role = self.role(lvl);
        let mut page = self.frames.access(table)?;
        Ok((0..entries).all(|index| !is_present(page.entry(index), role)))
    }
}

/// Logs every present leaf of `space`, one line per page.
pub fn dump(space: &AddressSpace, frames: &mut FramePool, vaddr: VirtAddr, size: u64) -> Result<()> {
    let start = vaddr.align_down(PAGE_SIZE);
    let mut at = 0;
    while at < align_up(size) {
        let page = start + at;
        if let Some(entry) = space.entry(frames, page)? {
            debug!(target: "pagemap", "{:#010x} -> {}", page.as_u64(), EntryDisplay(entry));
        }
        at += PAGE_SIZE;
    }
    Ok(())
}
