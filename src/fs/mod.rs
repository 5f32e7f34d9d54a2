use anyhow::{Context, Result};
use parking_lot::FairMutex;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(test)]
pub(crate) fn test_path() -> String {
    use uuid::Uuid;

    let id = Uuid::new_v4();
    format!("data/test/test_{}/", id)
}

/// A directory-rooted file store. One fair lock serialises all file
/// traffic, standing in for the single filesystem lock the syscall
/// layer owns.
#[derive(Debug)]
pub struct FileSystem {
    root: PathBuf,
    lock: Arc<FairMutex<()>>,
}

impl FileSystem {
    pub fn new(root: &str) -> Result<Self> {
        let root = Path::new(root);
        std::fs::create_dir_all(root)?;

        Ok(Self {
            root: root.to_path_buf(),
            lock: Arc::new(FairMutex::new(())),
        })
    }

    pub fn create(&self, name: &str, contents: &[u8]) -> Result<()> {
        let _fs = self.lock.lock();
        std::fs::write(self.root.join(name), contents)?;
        Ok(())
    }

    pub fn open(&self, name: &str) -> Result<DiskFile> {
        let _fs = self.lock.lock();
        let path = self.root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context("file opened")?;

        Ok(DiskFile {
            path,
            file,
            lock: self.lock.clone(),
        })
    }
}

/// An open file with positionless read/write. `reopen` yields an
/// independent handle onto the same file, which memory mappings use so
/// a later `close` of the descriptor cannot pull the backing store out
/// from under them.
#[derive(Debug)]
pub struct DiskFile {
    path: PathBuf,
    file: std::fs::File,
    lock: Arc<FairMutex<()>>,
}

impl DiskFile {
    pub fn reopen(&self) -> Result<DiskFile> {
        let _fs = self.lock.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .context("file reopened")?;

        Ok(DiskFile {
            path: self.path.clone(),
            file,
            lock: self.lock.clone(),
        })
    }

    pub fn length(&self) -> Result<u64> {
        let _fs = self.lock.lock();
        Ok(self.file.metadata()?.len())
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes actually read, which is smaller only at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let _fs = self.lock.lock();
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let _fs = self.lock.lock();
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}
