//! Filesystem held entirely in memory

use crate::filesys::{resolve, File, FileSystem, FsError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::result::Result;

/// Flat map from absolute path to file contents
#[derive(Default)]
pub struct MemoryFileSystem {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file at `path` holding `contents`
    pub fn insert(&mut self, path: &str, contents: &[u8]) -> Result<(), FsError> {
        let path = resolve("/", path);
        if path == "/" {
            return Err(FsError::InvalidName);
        }
        if self.files.contains_key(&path) {
            return Err(FsError::AlreadyExists);
        }
        self.files.insert(path, Arc::from(contents));
        Ok(())
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&mut self, cwd: &str, path: &str) -> Result<Box<dyn File>, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidName);
        }
        let contents = self
            .files
            .get(&resolve(cwd, path))
            .ok_or(FsError::NotFound)?;
        Ok(Box::new(MemoryFile {
            contents: Arc::clone(contents),
        }))
    }
}

/// Read-only handle onto a [`MemoryFileSystem`] entry
#[derive(Clone)]
pub struct MemoryFile {
    contents: Arc<[u8]>,
}

impl MemoryFile {
    pub fn new(contents: &[u8]) -> Self {
        MemoryFile {
            contents: Arc::from(contents),
        }
    }
}

impl File for MemoryFile {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let len = self.contents.len();
        let start = (offset as usize).min(len);
        let count = buf.len().min(len - start);
        buf[..count].copy_from_slice(&self.contents[start..start + count]);
        Ok(count)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    fn size(&self) -> u64 {
        self.contents.len() as u64
    }
}
