//! Parity handle: a logical, block-aligned byte stream backed by one or
//! more ordinary files ("splits").
//!
//! Only the last non-empty split may grow; reads past the last split's
//! `valid_size` fail; writes past a split's `size` extend it.

use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileSplit;
pub use memory::MemorySplit;

#[derive(Debug, Error)]
pub enum ParityIoError {
    #[error("read past valid_size: offset {offset} + len {len} > valid_size {valid_size}")]
    ReadPastValid {
        offset: u64,
        len: usize,
        valid_size: u64,
    },
    #[error("split {index} is not the last split but was asked to grow")]
    GrowNonLastSplit { index: usize },
    #[error("offset {offset} is not block-aligned to block_size {block_size}")]
    Unaligned { offset: u64, block_size: u32 },
    #[error("split {index} size mismatch: on-disk {on_disk}, recorded {recorded}")]
    SizeMismatch {
        index: usize,
        on_disk: u64,
        recorded: u64,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ParityIoError>;

/// One backing store for a contiguous run of a parity split's bytes.
///
/// Implemented by [`FileSplit`] for production use and [`MemorySplit`]
/// for tests; `ParityHandle` is generic over this trait the same way a
/// filesystem driver is generic over its disk backend.
pub trait SplitBackend {
    /// Size on the backing store right now (the allocation ceiling).
    fn size(&self) -> Result<u64>;
    /// Grow or shrink the backing store to exactly `size` bytes.
    fn resize(&mut self, size: u64) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Bookkeeping for one split file: its backend, configured ceiling, and
/// the high-water mark of bytes ever safely committed.
pub struct Split<B: SplitBackend> {
    pub backend: B,
    pub size: u64,
    pub valid_size: u64,
}

impl<B: SplitBackend> Split<B> {
    pub fn new(backend: B, size: u64, valid_size: u64) -> Self {
        Self {
            backend,
            size,
            valid_size,
        }
    }
}

/// A logical parity stream spread across an ordered list of [`Split`]s.
///
/// Reads and writes are expressed in block-aligned logical offsets; the
/// handle translates them to `(split_index, local_offset)` and never lets
/// a caller read beyond the last split's `valid_size` or grow anything
/// but the final split.
pub struct ParityHandle<B: SplitBackend> {
    pub splits: Vec<Split<B>>,
    pub block_size: u32,
}

impl<B: SplitBackend> ParityHandle<B> {
    pub fn new(splits: Vec<Split<B>>, block_size: u32) -> Self {
        Self { splits, block_size }
    }

    /// Total logical size: sum of all split ceilings.
    pub fn size(&self) -> u64 {
        self.splits.iter().map(|s| s.size).sum()
    }

    /// Total bytes ever safely committed across all splits.
    pub fn valid_size(&self) -> u64 {
        self.splits.iter().map(|s| s.valid_size).sum()
    }

    fn check_aligned(&self, offset: u64) -> Result<()> {
        if offset % self.block_size as u64 != 0 {
            return Err(ParityIoError::Unaligned {
                offset,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Locate the split and local offset containing logical `offset`.
    ///
    /// Mirrors `parity_read`/`parity_write`'s "first split with
    /// accumulated size > P" rule.
    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let mut base = 0u64;
        for (i, split) in self.splits.iter().enumerate() {
            if offset < base + split.size {
                return Some((i, offset - base));
            }
            base += split.size;
        }
        None
    }

    pub fn read_block(&mut self, parity_pos: u64, buf: &mut [u8]) -> Result<()> {
        let offset = parity_pos * self.block_size as u64;
        self.check_aligned(offset)?;
        let (idx, local) = self.locate(offset).ok_or(ParityIoError::ReadPastValid {
            offset,
            len: buf.len(),
            valid_size: self.valid_size(),
        })?;
        let split = &mut self.splits[idx];
        if local + buf.len() as u64 > split.valid_size {
            return Err(ParityIoError::ReadPastValid {
                offset,
                len: buf.len(),
                valid_size: split.valid_size,
            });
        }
        split.backend.read_at(local, buf)
    }

    pub fn write_block(&mut self, parity_pos: u64, buf: &[u8]) -> Result<()> {
        let offset = parity_pos * self.block_size as u64;
        self.check_aligned(offset)?;
        let last = self.splits.len() - 1;
        let (idx, local) = match self.locate(offset) {
            Some(hit) => hit,
            None => {
                // Beyond all configured splits: extend the final split.
                let base: u64 = self.splits[..last].iter().map(|s| s.size).sum();
                (last, offset - base)
            }
        };
        if idx != last && local + buf.len() as u64 > self.splits[idx].size {
            return Err(ParityIoError::GrowNonLastSplit { index: idx });
        }
        let split = &mut self.splits[idx];
        let end = local + buf.len() as u64;
        if end > split.size {
            split.backend.resize(end)?;
            split.size = end;
        }
        split.backend.write_at(local, buf)?;
        if end > split.valid_size {
            split.valid_size = end;
        }
        Ok(())
    }

    /// Grow or shrink the logical parity size. Shrinking truncates
    /// splits from the tail.
    pub fn chsize(&mut self, new_size: u64) -> Result<()> {
        let mut remaining = new_size;
        for split in self.splits.iter_mut() {
            if remaining == 0 {
                split.backend.resize(0)?;
                split.size = 0;
                split.valid_size = 0;
                continue;
            }
            split.backend.resize(remaining)?;
            split.size = remaining;
            split.valid_size = split.valid_size.min(remaining);
            remaining = 0;
        }
        Ok(())
    }

    /// Clamp every split to its `valid_size`, discarding any bytes
    /// written but not confirmed valid. Used after an interrupted sync.
    pub fn truncate(&mut self) -> Result<()> {
        for split in self.splits.iter_mut() {
            split.backend.resize(split.valid_size)?;
            split.size = split.valid_size;
        }
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<()> {
        for split in self.splits.iter_mut() {
            split.backend.sync()?;
        }
        Ok(())
    }

    /// Verify on-disk split sizes match the recorded sizes, unless
    /// `skip_content_check` is set.
    pub fn verify_sizes(&mut self, skip_content_check: bool) -> Result<()> {
        if skip_content_check {
            return Ok(());
        }
        for (index, split) in self.splits.iter_mut().enumerate() {
            let on_disk = split.backend.size()?;
            if on_disk != split.size {
                return Err(ParityIoError::SizeMismatch {
                    index,
                    on_disk,
                    recorded: split.size,
                });
            }
        }
        Ok(())
    }
}
