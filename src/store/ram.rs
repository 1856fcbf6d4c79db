use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;

use super::fault::{FaultInjector, FaultOp};
use super::{Directory, IndexOutput, Lock};
use crate::error::{IndexError, Result};

#[derive(Debug, Default)]
struct RamInner {
    files: RwLock<BTreeMap<String, Bytes>>,
    locks: Mutex<HashSet<String>>,
    faults: Option<Arc<FaultInjector>>,
    /// Files the most recent `sync` calls covered
    synced: Mutex<HashSet<String>>,
}

impl RamInner {
    fn check(&self, op: FaultOp, name: &str) -> Result<()> {
        match &self.faults {
            Some(faults) => faults.check(op, name),
            None => Ok(()),
        }
    }
}

fn not_found(name: &str) -> IndexError {
    IndexError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("file not found: {}", name),
    ))
}

/// In-memory directory. Clones share the same files.
#[derive(Clone, Debug, Default)]
pub struct RamDirectory {
    inner: Arc<RamInner>,
}

impl RamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose operations consult `faults` first
    pub fn with_faults(faults: Arc<FaultInjector>) -> Self {
        Self {
            inner: Arc::new(RamInner {
                faults: Some(faults),
                ..Default::default()
            }),
        }
    }

    /// Total bytes held
    pub fn size_in_bytes(&self) -> u64 {
        self.inner
            .files
            .read()
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }

    pub fn is_synced(&self, name: &str) -> bool {
        self.inner.synced.lock().contains(name)
    }
}

impl Directory for RamDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.inner.files.read().keys().cloned().collect())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.files.read().contains_key(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner
            .files
            .read()
            .get(name)
            .map(|b| b.len() as u64)
            .ok_or_else(|| not_found(name))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.inner.check(FaultOp::Create, name)?;
        if self.file_exists(name) {
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", name),
            )));
        }
        Ok(Box::new(RamOutput {
            name: name.to_string(),
            buf: Vec::new(),
            dir: self.inner.clone(),
        }))
    }

    fn open_input(&self, name: &str) -> Result<Bytes> {
        self.inner.check(FaultOp::Open, name)?;
        self.inner
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.check(FaultOp::Delete, name)?;
        self.inner.synced.lock().remove(name);
        match self.inner.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(name)),
        }
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        self.inner.check(FaultOp::Rename, source)?;
        let mut files = self.inner.files.write();
        let data = files.remove(source).ok_or_else(|| not_found(source))?;
        files.insert(dest.to_string(), data);
        let mut synced = self.inner.synced.lock();
        if synced.remove(source) {
            synced.insert(dest.to_string());
        }
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.inner.check(FaultOp::Sync, name)?;
            if !self.file_exists(name) {
                return Err(not_found(name));
            }
        }
        self.inner.synced.lock().extend(names.iter().cloned());
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        let mut locks = self.inner.locks.lock();
        if !locks.insert(name.to_string()) {
            return Err(IndexError::LockObtainFailed(format!(
                "lock held by another writer: {}",
                name
            )));
        }
        Ok(Box::new(RamLock {
            name: name.to_string(),
            dir: self.inner.clone(),
        }))
    }
}

struct RamOutput {
    name: String,
    buf: Vec<u8>,
    dir: Arc<RamInner>,
}

impl IndexOutput for RamOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.dir.check(FaultOp::Write, &self.name)?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn close(self: Box<Self>) -> Result<()> {
        let RamOutput { name, buf, dir } = *self;
        let mut files = dir.files.write();
        if files.contains_key(&name) {
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", name),
            )));
        }
        files.insert(name, Bytes::from(buf));
        Ok(())
    }
}

#[derive(Debug)]
struct RamLock {
    name: String,
    dir: Arc<RamInner>,
}

impl Lock for RamLock {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RamLock {
    fn drop(&mut self) {
        self.dir.locks.lock().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let dir = RamDirectory::new();
        let mut out = dir.create_output("_0.fdt").unwrap();
        out.write_bytes(b"hello ").unwrap();
        out.write_bytes(b"world").unwrap();
        assert!(!dir.file_exists("_0.fdt"));
        out.close().unwrap();

        assert_eq!(&dir.open_input("_0.fdt").unwrap()[..], b"hello world");
        assert_eq!(dir.file_length("_0.fdt").unwrap(), 11);
        assert!(dir.create_output("_0.fdt").is_err());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let dir = RamDirectory::new();
        dir.write_file("a", b"new").unwrap();
        dir.write_file("b", b"old").unwrap();
        dir.rename("a", "b").unwrap();

        assert_eq!(dir.list_all().unwrap(), vec!["b".to_string()]);
        assert_eq!(&dir.open_input("b").unwrap()[..], b"new");
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = RamDirectory::new();
        let lock = dir.obtain_lock("write.lock").unwrap();
        assert!(matches!(
            dir.obtain_lock("write.lock"),
            Err(IndexError::LockObtainFailed(_))
        ));
        drop(lock);
        assert!(dir.obtain_lock("write.lock").is_ok());
    }

    #[test]
    fn test_faults_are_applied() {
        let faults = Arc::new(FaultInjector::new());
        let dir = RamDirectory::with_faults(faults.clone());
        faults.fail_times(FaultOp::Sync, "_0", 1);
        dir.write_file("_0.cfs", b"x").unwrap();

        assert!(dir.sync(&["_0.cfs".to_string()]).is_err());
        assert!(!dir.is_synced("_0.cfs"));
        dir.sync(&["_0.cfs".to_string()]).unwrap();
        assert!(dir.is_synced("_0.cfs"));
    }
}
