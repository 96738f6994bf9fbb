//! Disk, File, Link, Dir and tombstone records.

use crate::engine::block::Block;
use crate::engine::extent::ExtentMap;
use std::path::PathBuf;

/// Stable identity of a [`File`] within its owning [`Disk`]'s arena.
/// Extents reference a file by this id rather than holding a raw
/// back-pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub usize);

#[derive(Clone, Debug)]
pub struct File {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub inode: u64,
    pub physical_offset: Option<u64>,
    pub blocks: Vec<Block>,
}

impl File {
    pub fn block_count(block_size: u64, size: u64) -> u32 {
        if size == 0 {
            return 0;
        }
        ((size + block_size - 1) / block_size) as u32
    }

    pub fn new(
        path: PathBuf,
        size: u64,
        mtime_sec: i64,
        mtime_nsec: u32,
        inode: u64,
        block_size: u64,
    ) -> Self {
        let count = Self::block_count(block_size, size);
        Self {
            path,
            size,
            mtime_sec,
            mtime_nsec,
            inode,
            physical_offset: None,
            blocks: (0..count).map(|_| Block::empty(0)).collect(),
        }
    }

    /// Whether this file's stat info still matches what the manifest
    /// recorded, used by the sync engine's modification-during-sync
    /// check.
    pub fn matches_stat(&self, size: u64, mtime_sec: i64, mtime_nsec: u32, inode: u64) -> bool {
        self.size == size
            && self.mtime_sec == mtime_sec
            && self.mtime_nsec == mtime_nsec
            && self.inode == inode
    }
}

/// A tombstone: the last-known hashes of a file's blocks, retained until
/// parity no longer covers them.
///
/// `positions[i]` is the parity position `blocks[i]` occupied at the
/// moment of removal, captured directly rather than re-derived from the
/// (now-dead) file's extent map entries: those entries are dropped by
/// [`Disk::remove_file`] so the manifest never has to serialize an
/// extent naming a file identity that no longer exists.
#[derive(Clone, Debug)]
pub struct DeletedTombstone {
    pub path: PathBuf,
    pub blocks: Vec<Block>,
    pub positions: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Symlink,
    Hardlink,
}

#[derive(Clone, Debug)]
pub struct Link {
    pub sub: PathBuf,
    pub linkto: String,
    pub kind: LinkKind,
}

#[derive(Clone, Debug)]
pub struct Dir {
    pub sub: PathBuf,
}

/// A named data disk: mount directory, persistent UUID, its files,
/// tombstones, links, directories, and extent map.
pub struct Disk {
    pub name: String,
    pub mount_point: PathBuf,
    pub uuid: uuid::Uuid,
    files: Vec<Option<File>>,
    pub tombstones: Vec<DeletedTombstone>,
    pub links: Vec<Link>,
    pub dirs: Vec<Dir>,
    pub extents: ExtentMap,
}

impl Disk {
    pub fn new(name: impl Into<String>, mount_point: PathBuf, uuid: uuid::Uuid) -> Self {
        Self {
            name: name.into(),
            mount_point,
            uuid,
            files: Vec::new(),
            tombstones: Vec::new(),
            links: Vec::new(),
            dirs: Vec::new(),
            extents: ExtentMap::new(),
        }
    }

    /// Insert a new file, returning its stable [`FileId`].
    pub fn insert_file(&mut self, file: File) -> FileId {
        let id = FileId(self.files.len());
        self.files.push(Some(file));
        id
    }

    pub fn file(&self, id: FileId) -> Option<&File> {
        self.files.get(id.0).and_then(|f| f.as_ref())
    }

    pub fn file_mut(&mut self, id: FileId) -> Option<&mut File> {
        self.files.get_mut(id.0).and_then(|f| f.as_mut())
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &File)> {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (FileId(i), f)))
    }

    /// Remove a live file, converting its blocks into a tombstone. The
    /// parity positions the file's blocks occupied are captured onto the
    /// tombstone and the extent map's bindings for this file are
    /// deallocated immediately: the slots stay reserved (tracked by the
    /// tombstone, not the extent map) until [`Disk::reclaim_tombstones`]
    /// erases them once a sync pass has covered that range.
    pub fn remove_file(&mut self, id: FileId) {
        if let Some(file) = self.files.get_mut(id.0).and_then(|f| f.take()) {
            let mut blocks = file.blocks;
            let mut positions = Vec::with_capacity(blocks.len());
            for (file_pos, b) in blocks.iter_mut().enumerate() {
                let pos = self.extents.file2par(id, file_pos as u32);
                if let Some(pos) = pos {
                    let _ = self.extents.deallocate(pos);
                }
                positions.push(pos.unwrap_or(u32::MAX));
                if b.state == crate::engine::block::BlockState::Blk {
                    b.mark_deleted();
                }
            }
            self.tombstones.push(DeletedTombstone {
                path: file.path,
                blocks,
                positions,
            });
        }
    }

    /// Erase tombstones whose every retained position was actually
    /// committed by a sync pass (`SyncReport::synced_positions`, not
    /// merely within the range a pass was asked to cover — a column can
    /// be skipped by the one-valid/one-invalid gate or left
    /// unrecoverable). This is the DELETED -> EMPTY transition: parity
    /// no longer needs the old hash only once a pass has actually
    /// rewritten that slot. A position of `u32::MAX` (never parity-
    /// covered in the first place) is trivially satisfied.
    pub fn reclaim_tombstones(&mut self, synced_positions: &std::collections::BTreeSet<u32>) {
        self.tombstones.retain(|t| {
            !t.positions
                .iter()
                .all(|&p| p == u32::MAX || synced_positions.contains(&p))
        });
    }

    pub fn file_by_path(&self, path: &std::path::Path) -> Option<FileId> {
        self.files()
            .find(|(_, f)| f.path == path)
            .map(|(id, _)| id)
    }
}
