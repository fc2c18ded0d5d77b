//! Physical frames and the page tables built from them.

pub mod address_space;
pub mod frame_allocator;
pub mod paging_mode;

pub use address_space::AddressSpace;
pub use frame_allocator::FramePool;
pub use paging_mode::{PagingMode, RawEntry, X86_PAGING_32};
