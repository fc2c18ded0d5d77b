//! Exception vector numbers the kernel treats specially.

pub const PAGE_FAULT_VECTOR: u8 = 14;
/// A double fault means kernel state can no longer be trusted.
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
