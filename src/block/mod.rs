use crate::vaddr::SECTOR_SIZE;
use anyhow::{ensure, Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A device addressed in [`SECTOR_SIZE`] units. The swap allocator is
/// written against this seam so the real driver stays out of the core.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    fn read(&self, sector: usize, buf: &mut [u8]) -> Result<()>;
    fn write(&self, sector: usize, buf: &[u8]) -> Result<()>;
}

/// A block device backed by a fixed-size file. Sectors that were never
/// written read back as zeros.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    sectors: usize,
}

impl FileBlockDevice {
    pub fn create(path: &str, sectors: usize) -> Result<Self> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context("device file opened")?;
        file.set_len((sectors * SECTOR_SIZE) as u64)?;

        Ok(Self { file, sectors })
    }
}

impl BlockDevice for FileBlockDevice {
    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn read(&self, sector: usize, buf: &mut [u8]) -> Result<()> {
        ensure!(sector < self.sectors, "sector {sector} out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        self.file
            .read_exact_at(buf, (sector * SECTOR_SIZE) as u64)
            .context("sector read")?;
        Ok(())
    }

    fn write(&self, sector: usize, buf: &[u8]) -> Result<()> {
        ensure!(sector < self.sectors, "sector {sector} out of range");
        assert_eq!(buf.len(), SECTOR_SIZE);
        self.file
            .write_all_at(buf, (sector * SECTOR_SIZE) as u64)
            .context("sector write")?;
        Ok(())
    }
}
