use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::fault::{FaultInjector, FaultOp};
use super::{Directory, IndexOutput, Lock};
use crate::error::{IndexError, Result};

const TMP_SUFFIX: &str = ".tmp";

/// Directory backed by a filesystem path
#[derive(Debug, Clone)]
pub struct FsDirectory {
    base_dir: PathBuf,
    faults: Option<Arc<FaultInjector>>,
}

impl FsDirectory {
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            faults: None,
        })
    }

    pub fn with_faults(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn path(&self) -> &Path {
        &self.base_dir
    }

    fn check(&self, op: FaultOp, name: &str) -> Result<()> {
        match &self.faults {
            Some(faults) => faults.check(op, name),
            None => Ok(()),
        }
    }

    fn sync_dir(&self) -> io::Result<()> {
        // Directory fsync persists renames and unlinks on unix
        #[cfg(unix)]
        {
            File::open(&self.base_dir)?.sync_all()?;
        }
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // outputs still being written are not part of the namespace
            match entry.file_name().to_str() {
                Some(name) if !name.ends_with(TMP_SUFFIX) => names.push(name.to_string()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.base_dir.join(name).is_file()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.base_dir.join(name))?.len())
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.check(FaultOp::Create, name)?;
        // Written under a temporary name so readers never see a partial file
        let tmp = self.base_dir.join(format!("{}{}", name, TMP_SUFFIX));
        if self.file_exists(name) {
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", name),
            )));
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        Ok(Box::new(FsOutput {
            name: name.to_string(),
            tmp,
            dest: self.base_dir.join(name),
            writer: BufWriter::new(file),
            written: 0,
            faults: self.faults.clone(),
        }))
    }

    fn open_input(&self, name: &str) -> Result<Bytes> {
        self.check(FaultOp::Open, name)?;
        Ok(Bytes::from(fs::read(self.base_dir.join(name))?))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check(FaultOp::Delete, name)?;
        fs::remove_file(self.base_dir.join(name))?;
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        self.check(FaultOp::Rename, source)?;
        fs::rename(self.base_dir.join(source), self.base_dir.join(dest))?;
        self.sync_dir()?;
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.check(FaultOp::Sync, name)?;
            File::open(self.base_dir.join(name))?.sync_all()?;
        }
        self.sync_dir()?;
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        let path = self.base_dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Box::new(FsLock {
                    name: name.to_string(),
                    path,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(
                IndexError::LockObtainFailed(format!("lock file exists: {}", path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

struct FsOutput {
    name: String,
    tmp: PathBuf,
    dest: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    faults: Option<Arc<FaultInjector>>,
}

impl IndexOutput for FsOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(faults) = &self.faults {
            faults.check(FaultOp::Write, &self.name)?;
        }
        self.writer.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.written
    }

    fn close(self: Box<Self>) -> Result<()> {
        let FsOutput {
            tmp, dest, writer, ..
        } = *self;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        drop(file);
        if dest.exists() {
            let _ = fs::remove_file(&tmp);
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", dest.display()),
            )));
        }
        fs::rename(&tmp, &dest)?;
        Ok(())
    }
}

#[derive(Debug)]
struct FsLock {
    name: String,
    path: PathBuf,
}

impl Lock for FsLock {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
