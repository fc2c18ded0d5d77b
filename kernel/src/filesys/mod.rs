use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::result::Result;

pub mod memory;

pub use memory::{MemoryFile, MemoryFileSystem};

// Define error types for the filesystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidName,
    IOError,
    NotSupported,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "File not found"),
            FsError::AlreadyExists => write!(f, "File already exists"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::IOError => write!(f, "I/O error"),
            FsError::NotSupported => write!(f, "Operation not supported"),
        }
    }
}

// Core traits for filesystem abstraction

/// Represents an open file
pub trait File: Send {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many were read.
    /// A short count means the end of the file was reached.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FsError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;
    fn size(&self) -> u64;
}

/// The filesystem interface the process loader opens executables through
pub trait FileSystem {
    /// Opens `path`, resolved against `cwd` when relative.
    fn open(&mut self, cwd: &str, path: &str) -> Result<Box<dyn File>, FsError>;
}

/// Joins `path` onto `cwd` and collapses `.` and `..` components.
pub fn resolve(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for part in base.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    let mut resolved = String::from("/");
    resolved.push_str(&parts.join("/"));
    resolved
}

/// Final component of `path`, ignoring trailing slashes.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute() {
        assert_eq!(resolve("/bin", "init"), "/bin/init");
        assert_eq!(resolve("/bin", "/sbin/init"), "/sbin/init");
        assert_eq!(resolve("/usr/bin", "../lib/./ld"), "/usr/lib/ld");
        assert_eq!(resolve("/", ".."), "/");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/bin/init"), "init");
        assert_eq!(basename("init"), "init");
        assert_eq!(basename("/bin/sh/"), "sh");
    }
}
