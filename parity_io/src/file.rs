use crate::{Result, SplitBackend};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single parity split backed by an ordinary file, opened once and
/// kept open for the lifetime of the handle.
pub struct FileSplit {
    path: PathBuf,
    file: File,
}

impl FileSplit {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SplitBackend for FileSplit {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut split = FileSplit::open(dir.path().join("parity.bin")).unwrap();
        split.resize(128).unwrap();
        split.write_at(0, &[1u8; 64]).unwrap();
        split.write_at(64, &[2u8; 64]).unwrap();
        let mut buf = [0u8; 64];
        split.read_at(64, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 64]);
        assert_eq!(split.size().unwrap(), 128);
    }

    #[test]
    fn resize_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut split = FileSplit::open(dir.path().join("parity.bin")).unwrap();
        split.resize(128).unwrap();
        split.resize(32).unwrap();
        assert_eq!(split.size().unwrap(), 32);
    }
}
