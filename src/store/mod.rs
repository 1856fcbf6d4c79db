//! Flat namespace of immutable files
//!
//! A file becomes visible once its output is closed and is never modified
//! afterwards. Renames replace the destination atomically, which is what
//! commit publication relies on.

pub mod fault;
pub mod fs;
pub mod ram;

use bytes::Bytes;
use std::fmt;

use crate::error::Result;

pub use fault::{FaultInjector, FaultOp};
pub use fs::FsDirectory;
pub use ram::RamDirectory;

/// Name of the lock file guarding a single writer per directory
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Sequential writer for a single new file
pub trait IndexOutput: Send {
    fn name(&self) -> &str;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Bytes written so far
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish the file. Nothing is visible before this returns.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Exclusive lock held for as long as the value lives
pub trait Lock: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
}

/// Storage abstraction for index files
pub trait Directory: Send + Sync + fmt::Debug {
    /// All file names, sorted
    fn list_all(&self) -> Result<Vec<String>>;

    fn file_exists(&self, name: &str) -> bool;

    fn file_length(&self, name: &str) -> Result<u64>;

    /// Start a new file. Fails if the name already exists.
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>>;

    /// Whole-file random access view
    fn open_input(&self, name: &str) -> Result<Bytes>;

    fn delete_file(&self, name: &str) -> Result<()>;

    /// Atomically rename, replacing `dest` if present
    fn rename(&self, source: &str, dest: &str) -> Result<()>;

    /// Make the named files durable
    fn sync(&self, names: &[String]) -> Result<()>;

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>>;

    /// Copy `src` from another directory into this one as `dest`
    fn copy_from(&self, from: &dyn Directory, src: &str, dest: &str) -> Result<()> {
        let data = from.open_input(src)?;
        let mut out = self.create_output(dest)?;
        out.write_bytes(&data)?;
        out.close()
    }

    /// Write a whole file in one go
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut out = self.create_output(name)?;
        out.write_bytes(data)?;
        out.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_between_directories() {
        let source = RamDirectory::new();
        source.write_file("_0.cfs", b"segment bytes").unwrap();

        let dest = RamDirectory::new();
        dest.copy_from(&source, "_0.cfs", "_0.cfs").unwrap();
        assert_eq!(&dest.open_input("_0.cfs").unwrap()[..], b"segment bytes");
    }
}
