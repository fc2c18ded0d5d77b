//! Kernel-wide error kinds.

use crate::filesys::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The frame pool has no free frame left.
    OutOfMemory,
    /// A fixed-size table (processes, descriptors) is full.
    ResourceExhausted,
    /// An executable segment or requested mapping is not loadable as described.
    InvalidLayout,
    /// A read or write against a file came up short or failed.
    IoError,
    InvalidArgument,
    Unsupported,
    NotFound,
    BadExecutable,
    BadDescriptor,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of physical frames"),
            KernelError::ResourceExhausted => write!(f, "Resource table is full"),
            KernelError::InvalidLayout => write!(f, "Invalid segment layout"),
            KernelError::IoError => write!(f, "I/O error"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::Unsupported => write!(f, "Operation not supported"),
            KernelError::NotFound => write!(f, "Not found"),
            KernelError::BadExecutable => write!(f, "Not a loadable executable"),
            KernelError::BadDescriptor => write!(f, "Bad file descriptor"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => KernelError::NotFound,
            FsError::InvalidName => KernelError::InvalidArgument,
            FsError::NotSupported => KernelError::Unsupported,
            FsError::AlreadyExists | FsError::IOError => KernelError::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_fs_errors_map_to_kernel_errors() {
        assert_eq!(KernelError::from(FsError::NotFound), KernelError::NotFound);
        assert_eq!(KernelError::from(FsError::IOError), KernelError::IoError);
        assert_eq!(
            KernelError::from(FsError::NotSupported),
            KernelError::Unsupported
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelError::OutOfMemory.to_string(), "Out of physical frames");
        assert_eq!(KernelError::BadDescriptor.to_string(), "Bad file descriptor");
    }
}
