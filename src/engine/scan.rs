//! Filesystem scan and diff: not a full rewrite of directory-walk
//! scanning internals (pool symlinks, SMART probing, and the like stay
//! out of scope), but enough of the walk/compare/insert contract that
//! `sync` has real input to drive against.

use crate::engine::disk::{Disk, File, FileId};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffSummary {
    pub equal: u32,
    pub moved: u32,
    pub copied: u32,
    pub restored: u32,
    pub changed: u32,
    pub removed: u32,
    pub added: u32,
}

struct Stat {
    rel_path: PathBuf,
    size: u64,
    mtime_sec: i64,
    mtime_nsec: u32,
    inode: u64,
}

fn walk(root: &Path, base: &Path, out: &mut Vec<Stat>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(&path, base, out)?;
            continue;
        }
        if !meta.is_file() {
            continue;
        }
        let rel_path = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
        out.push(Stat {
            rel_path,
            size: meta.len(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec() as u32,
            inode: meta.ino(),
        });
    }
    Ok(())
}

/// Walk `disk.mount_point`, comparing what is found against the
/// manifest's record of this disk plus, for copy detection, every
/// already-fully-synced file on `other_disks`. Mutates `disk` in place:
/// inserts new/changed/moved files, converts vanished files into
/// tombstones.
pub fn scan_disk(disk: &mut Disk, other_disks: &[&Disk], block_size: u64) -> DiffSummary {
    let mut summary = DiffSummary::default();
    let mut found = Vec::new();
    if walk(&disk.mount_point, &disk.mount_point, &mut found).is_err() {
        return summary;
    }

    let known_by_path: HashMap<PathBuf, FileId> = disk
        .files()
        .map(|(id, f)| (f.path.clone(), id))
        .collect();
    let known_by_identity: HashMap<(u64, u64, i64, u32), FileId> = disk
        .files()
        .map(|(id, f)| ((f.inode, f.size, f.mtime_sec, f.mtime_nsec), id))
        .collect();

    let mut seen_paths: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();

    for stat in &found {
        seen_paths.insert(stat.rel_path.clone());
        let identity_key = (stat.inode, stat.size, stat.mtime_sec, stat.mtime_nsec);

        if let Some(&id) = known_by_path.get(&stat.rel_path) {
            let existing = disk.file(id).unwrap();
            if existing.matches_stat(stat.size, stat.mtime_sec, stat.mtime_nsec, stat.inode) {
                summary.equal += 1;
                continue;
            }
            // Same path, different content: treat as a changed file.
            let mut replacement = File::new(
                stat.rel_path.clone(),
                stat.size,
                stat.mtime_sec,
                stat.mtime_nsec,
                stat.inode,
                block_size,
            );
            for b in replacement.blocks.iter_mut() {
                b.allocate_chg();
            }
            *disk.file_mut(id).unwrap() = replacement;
            summary.changed += 1;
            continue;
        }

        if let Some(&id) = known_by_identity.get(&identity_key) {
            // Same inode/size/mtime under a new name: a rename/move.
            disk.file_mut(id).unwrap().path = stat.rel_path.clone();
            summary.moved += 1;
            continue;
        }

        if let Some(tomb_idx) = disk
            .tombstones
            .iter()
            .position(|t| t.path == stat.rel_path && t.blocks.len() as u64 == (stat.size + block_size - 1) / block_size.max(1))
        {
            let tomb = disk.tombstones.remove(tomb_idx);
            let mut replacement = File::new(
                stat.rel_path.clone(),
                stat.size,
                stat.mtime_sec,
                stat.mtime_nsec,
                stat.inode,
                block_size,
            );
            for (b, old) in replacement.blocks.iter_mut().zip(tomb.blocks.iter()) {
                b.allocate_chg();
                b.allocate_rep(old.hash);
            }
            disk.insert_file(replacement);
            summary.restored += 1;
            continue;
        }

        if let Some(source) = find_copy_source(other_disks, stat) {
            let mut replacement = File::new(
                stat.rel_path.clone(),
                stat.size,
                stat.mtime_sec,
                stat.mtime_nsec,
                stat.inode,
                block_size,
            );
            for (b, src) in replacement.blocks.iter_mut().zip(source.blocks.iter()) {
                b.allocate_chg();
                b.allocate_rep(src.hash);
            }
            disk.insert_file(replacement);
            summary.copied += 1;
            continue;
        }

        let mut fresh = File::new(
            stat.rel_path.clone(),
            stat.size,
            stat.mtime_sec,
            stat.mtime_nsec,
            stat.inode,
            block_size,
        );
        for b in fresh.blocks.iter_mut() {
            b.allocate_chg();
        }
        disk.insert_file(fresh);
        summary.added += 1;
    }

    let vanished: Vec<FileId> = disk
        .files()
        .filter(|(_, f)| !seen_paths.contains(&f.path))
        .map(|(id, _)| id)
        .collect();
    for id in vanished {
        disk.remove_file(id);
        summary.removed += 1;
    }

    summary
}

fn find_copy_source<'a>(other_disks: &[&'a Disk], stat: &Stat) -> Option<&'a File> {
    for disk in other_disks {
        for (_, f) in disk.files() {
            let name_matches = f.path.file_name() == stat.rel_path.file_name();
            let stamp_matches = f.size == stat.size
                && f.mtime_sec == stat.mtime_sec
                && f.mtime_nsec == stat.mtime_nsec;
            if name_matches && stamp_matches && f.blocks.iter().all(|b| b.state.is_file_backed()) {
                return Some(f);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_file_is_added_with_chg_blocks() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let mut disk = Disk::new("d1", dir.path().to_path_buf(), uuid::Uuid::nil());
        let summary = scan_disk(&mut disk, &[], 64 * 1024);
        assert_eq!(summary.added, 1);
        let (_, f) = disk.files().next().unwrap();
        assert!(f.blocks[0].state.is_file_backed());
    }

    #[test]
    fn unchanged_file_is_counted_equal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let mut disk = Disk::new("d1", dir.path().to_path_buf(), uuid::Uuid::nil());
        scan_disk(&mut disk, &[], 64 * 1024);
        let summary = scan_disk(&mut disk, &[], 64 * 1024);
        assert_eq!(summary.equal, 1);
        assert_eq!(summary.added, 0);
    }

    #[test]
    fn renamed_file_is_counted_moved() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let mut disk = Disk::new("d1", dir.path().to_path_buf(), uuid::Uuid::nil());
        scan_disk(&mut disk, &[], 64 * 1024);
        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let summary = scan_disk(&mut disk, &[], 64 * 1024);
        assert_eq!(summary.moved, 1);
        let (_, f) = disk.files().next().unwrap();
        assert_eq!(f.path, PathBuf::from("b.txt"));
    }

    #[test]
    fn removed_file_becomes_tombstone() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let mut disk = Disk::new("d1", dir.path().to_path_buf(), uuid::Uuid::nil());
        scan_disk(&mut disk, &[], 64 * 1024);
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let summary = scan_disk(&mut disk, &[], 64 * 1024);
        assert_eq!(summary.removed, 1);
        assert_eq!(disk.tombstones.len(), 1);
    }
}
