//! [`BlockSource`] adapters wiring real files and parity splits into the
//! scheduler, shared by the sync/scrub/fix engines.

use crate::engine::scheduler::BlockSource;
use parity_io::{FileSplit, ParityHandle, ParityIoError};
use std::collections::HashMap;
use std::fs::File as StdFile;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Which file (if any) backs a given parity position on one disk, for
/// the column range a sync/scrub/fix run covers. Precomputed from the
/// extent map before workers are spawned, since `BlockSource` values
/// must be `'static + Send` and an extent map snapshot is far simpler
/// to hand a worker thread than a shared, lock-guarded map (a per-disk
/// mutex on the live map would also work; this engine instead freezes
/// a read-only view for the duration of one run).
pub struct DiskLookup {
    pub blockstart: u32,
    /// Indexed by `parity_pos - blockstart`.
    pub entries: Vec<Option<(PathBuf, u32)>>,
}

pub struct DataDiskSource {
    pub block_size: usize,
    pub lookup: DiskLookup,
    open: Option<(PathBuf, StdFile)>,
}

impl DataDiskSource {
    pub fn new(block_size: usize, lookup: DiskLookup) -> Self {
        Self {
            block_size,
            lookup,
            open: None,
        }
    }

    fn file_for(&mut self, path: &PathBuf) -> io::Result<&mut StdFile> {
        if self.open.as_ref().map(|(p, _)| p) != Some(path) {
            let f = StdFile::open(path)?;
            self.open = Some((path.clone(), f));
        }
        Ok(&mut self.open.as_mut().unwrap().1)
    }
}

impl BlockSource for DataDiskSource {
    fn read_block(&mut self, parity_pos: u32, buf: &mut [u8]) -> io::Result<usize> {
        let idx = (parity_pos - self.lookup.blockstart) as usize;
        let entry = self.lookup.entries.get(idx).cloned().flatten();
        let Some((path, file_pos)) = entry else {
            buf.fill(0);
            return Ok(0);
        };
        let block_size = self.block_size;
        let file = self.file_for(&path)?;
        file.seek(SeekFrom::Start(file_pos as u64 * block_size as u64))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        for b in buf[total..].iter_mut() {
            *b = 0;
        }
        Ok(total)
    }
}

/// A read channel onto a parity level's handle, shared with the main
/// thread (which performs writes after a column has been processed) via
/// a mutex. Read-only scrub runs never contend with a writer at all;
/// sync/fix briefly hold the lock once per column to append parity.
pub struct ParitySource {
    pub handle: Arc<Mutex<ParityHandle<FileSplit>>>,
}

impl BlockSource for ParitySource {
    fn read_block(&mut self, parity_pos: u32, buf: &mut [u8]) -> io::Result<usize> {
        let mut handle = self.handle.lock().unwrap();
        match handle.read_block(parity_pos as u64, buf) {
            Ok(()) => Ok(buf.len()),
            Err(ParityIoError::ReadPastValid { .. }) => {
                buf.fill(0);
                Ok(0)
            }
            Err(ParityIoError::Io(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other)),
        }
    }
}

/// Write a recovered block back to its target file, creating parent
/// directories and the file itself, and extending it to the right
/// length if this is the file's last (possibly short) block.
pub fn write_data_block(
    path: &std::path::Path,
    file_pos: u32,
    block_size: u32,
    data: &[u8],
) -> io::Result<()> {
    use std::io::Write as _;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)?;
    f.seek(SeekFrom::Start(file_pos as u64 * block_size as u64))?;
    f.write_all(data)?;
    Ok(())
}

/// Build a per-disk parity-position -> (path, file_pos) lookup table for
/// `[blockstart, blockmax)`, from the live extent map, for handoff to a
/// worker thread.
pub fn build_lookup(
    disk: &crate::engine::disk::Disk,
    blockstart: u32,
    blockmax: u32,
) -> DiskLookup {
    let mut entries = vec![None; (blockmax - blockstart) as usize];
    let mut path_cache: HashMap<crate::engine::disk::FileId, PathBuf> = HashMap::new();
    for extent in disk.extents.iter_by_parity() {
        for offset in 0..extent.count {
            let pos = extent.parity_pos + offset;
            if pos < blockstart || pos >= blockmax {
                continue;
            }
            let path = path_cache
                .entry(extent.file)
                .or_insert_with(|| {
                    disk.file(extent.file)
                        .map(|f| disk.mount_point.join(&f.path))
                        .unwrap_or_default()
                })
                .clone();
            entries[(pos - blockstart) as usize] = Some((path, extent.file_pos + offset));
        }
    }
    DiskLookup { blockstart, entries }
}
