//! Physical frame pool backing page tables and anonymous pages.
//!
//! The pool owns a contiguous run of page-aligned frames starting at a base
//! physical address. Allocation state lives in a bitmap; frame contents are
//! reached through a [`FrameStore`], which is either real physical memory
//! (identity mapped) or a heap arena standing in for it on hosted builds.

use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, PAGE_SIZE},
    error::{KernelError, Result},
    memory::paging_mode::{RawEntry, ENTRY_SIZE},
};
use alloc::{boxed::Box, vec, vec::Vec};
use core::ops::{Deref, DerefMut};
use x86_64::{structures::paging::PhysFrame, PhysAddr};

#[repr(C, align(4096))]
struct PageBuf([u8; FRAME_SIZE]);

/// Frames kept in a kernel heap allocation, addressed by pool index.
pub struct HeapFrames {
    arena: Box<[PageBuf]>,
}

impl HeapFrames {
    pub fn new(capacity: usize) -> Self {
        let arena: Vec<PageBuf> = (0..capacity).map(|_| PageBuf([0; FRAME_SIZE])).collect();
        HeapFrames {
            arena: arena.into_boxed_slice(),
        }
    }

    fn page(&mut self, index: usize) -> &mut [u8] {
        &mut self.arena[index].0
    }
}

/// Frames reached directly at their physical address.
pub struct IdentityFrames {
    _private: (),
}

impl IdentityFrames {
    /// # Safety
    ///
    /// Every pool frame must be identity mapped, writable, and used by nothing
    /// but the pool for as long as the pool lives.
    pub unsafe fn new() -> Self {
        IdentityFrames { _private: () }
    }

    fn page(&mut self, paddr: PhysAddr) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `IdentityFrames::new`
        unsafe { core::slice::from_raw_parts_mut(paddr.as_u64() as *mut u8, FRAME_SIZE) }
    }
}

/// Enum of supported frame backings
pub enum FrameStore {
    Heap(HeapFrames),
    Identity(IdentityFrames),
}

impl FrameStore {
    fn page(&mut self, index: usize, paddr: PhysAddr) -> &mut [u8] {
        match self {
            FrameStore::Heap(ref mut heap) => heap.page(index),
            FrameStore::Identity(ref mut identity) => identity.page(paddr),
        }
    }
}

pub struct FramePool {
    base: PhysAddr,
    total_frames: usize,
    free_frames: usize,
    to_allocate: usize,
    bitmap: Box<[u64]>,
    /// Index of the frame currently open through a [`FrameAccess`].
    accessed: Option<usize>,
    store: FrameStore,
}

impl FramePool {
    /// Pool of `capacity` frames at `base`, backed by a heap arena.
    pub fn new(base: PhysAddr, capacity: usize) -> Result<Self> {
        Self::with_store(base, capacity, FrameStore::Heap(HeapFrames::new(capacity)))
    }

    pub fn with_store(base: PhysAddr, capacity: usize, store: FrameStore) -> Result<Self> {
        if !base.is_aligned(PAGE_SIZE) || capacity == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let bitmap_size = capacity.div_ceil(BITMAP_ENTRY_SIZE);

        Ok(FramePool {
            base,
            total_frames: capacity,
            free_frames: capacity,
            to_allocate: 0,
            bitmap: vec![0; bitmap_size].into_boxed_slice(),
            accessed: None,
            store,
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// Allocates an unused frame. Contents are whatever the last owner left.
    pub fn alloc(&mut self) -> Result<PhysFrame> {
        if self.free_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }
        loop {
            if !self.is_bit_set(self.to_allocate) {
                self.set_bit(self.to_allocate);
                let frame = self.frame_at(self.to_allocate);
                self.to_allocate = (self.to_allocate + 1) % self.total_frames;
                return Ok(frame);
            }

            self.to_allocate = (self.to_allocate + 1) % self.total_frames;
        }
    }

    /// Allocates a frame and clears it.
    pub fn alloc_zeroed(&mut self) -> Result<PhysFrame> {
        let frame = self.alloc()?;
        self.access(frame)?.fill(0);
        Ok(frame)
    }

    /// Returns `frame` to the pool. Freeing an already free frame does nothing.
    pub fn free(&mut self, frame: PhysFrame) -> Result<()> {
        let index = self.index_of(frame.start_address())?;
        if self.is_bit_set(index) {
            self.clear_bit(index);
        }
        Ok(())
    }

    /// Finds the pool frame containing `paddr`.
    pub fn find(&self, paddr: PhysAddr) -> Result<PhysFrame> {
        let index = self.index_of(paddr)?;
        Ok(self.frame_at(index))
    }

    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        self.index_of(frame.start_address())
            .map(|index| self.is_bit_set(index))
            .unwrap_or(false)
    }

    /// Opens the contents of an allocated frame. The frame is marked accessed
    /// until the returned guard is dropped.
    pub fn access(&mut self, frame: PhysFrame) -> Result<FrameAccess<'_>> {
        let index = self.index_of(frame.start_address())?;
        if !self.is_bit_set(index) {
            return Err(KernelError::NotFound);
        }
        self.accessed = Some(index);
        Ok(FrameAccess {
            pool: self,
            index,
            frame,
        })
    }

    pub fn is_accessed(&self, frame: PhysFrame) -> bool {
        self.index_of(frame.start_address())
            .is_ok_and(|index| self.accessed == Some(index))
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(self.base + (index * FRAME_SIZE) as u64)
    }

    fn index_of(&self, paddr: PhysAddr) -> Result<usize> {
        if paddr < self.base {
            return Err(KernelError::NotFound);
        }
        let index = ((paddr - self.base) / PAGE_SIZE) as usize;
        if index >= self.total_frames {
            return Err(KernelError::NotFound);
        }
        Ok(index)
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        let (word, mask) = Self::bit(frame_index);
        self.bitmap[word] |= mask;
        self.free_frames -= 1;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        let (word, mask) = Self::bit(frame_index);
        self.bitmap[word] &= !mask;
        self.free_frames += 1;
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let (word, mask) = Self::bit(frame_index);
        (self.bitmap[word] & mask) != 0
    }

    fn bit(frame_index: usize) -> (usize, u64) {
        (
            frame_index / BITMAP_ENTRY_SIZE,
            1 << (frame_index % BITMAP_ENTRY_SIZE),
        )
    }
}

/// Open view of one frame's bytes. Closing happens on drop.
pub struct FrameAccess<'a> {
    pool: &'a mut FramePool,
    index: usize,
    frame: PhysFrame,
}

impl FrameAccess<'_> {
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Reads the page table entry at `index` of this frame.
    pub fn entry(&mut self, index: usize) -> RawEntry {
        let at = index * ENTRY_SIZE;
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes.copy_from_slice(&self[at..at + ENTRY_SIZE]);
        RawEntry::from_le_bytes(bytes)
    }

    pub fn set_entry(&mut self, index: usize, entry: RawEntry) {
        let at = index * ENTRY_SIZE;
        self[at..at + ENTRY_SIZE].copy_from_slice(&entry.to_le_bytes());
    }

    pub fn close(self) {}
}

impl Deref for FrameAccess<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.pool.store {
            FrameStore::Heap(heap) => &heap.arena[self.index].0,
            // SAFETY: see `IdentityFrames::new`
            FrameStore::Identity(_) => unsafe {
                core::slice::from_raw_parts(
                    self.frame.start_address().as_u64() as *const u8,
                    FRAME_SIZE,
                )
            },
        }
    }
}

impl DerefMut for FrameAccess<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.pool
            .store
            .page(self.index, self.frame.start_address())
    }
}

impl Drop for FrameAccess<'_> {
    fn drop(&mut self) {
        self.pool.accessed = None;
    }
}
