//! Parity-position allocator: the glue between scan (which allocates
//! new/changed blocks in state CHG but says nothing about which parity
//! position they land on) and the extent map (which only exposes
//! `allocate`/`deallocate` for a position the caller already chose).
//!
//! Policy: first-fit over the free parity positions on a disk, where
//! "free" means "not covered by a live extent and not reserved by a
//! tombstone". Blocks a file already has bound to an extent (unchanged
//! file_pos carried over from a previous sync, including the CHG blocks
//! of a same-size modified file, which keep their old parity slots)
//! are left alone; only newly-appeared file_pos values get a fresh
//! position. If a file shrank, the extents for its now-missing tail are
//! deallocated so their positions become available again.

use crate::engine::disk::{Disk, FileId};
use std::collections::BTreeSet;

/// Allocate parity positions for every block of every live file on
/// `disk` that does not already have one, and release positions held by
/// extents past a file's current block count.
pub fn allocate_disk(disk: &mut Disk) {
    let file_ids: Vec<FileId> = disk.files().map(|(id, _)| id).collect();

    for &fid in &file_ids {
        let block_count = disk.file(fid).unwrap().blocks.len() as u32;
        let stale: Vec<u32> = disk
            .extents
            .iter_by_file(fid)
            .flat_map(|e| (0..e.count).map(move |off| (e.file_pos + off, e.parity_pos + off)))
            .filter(|&(file_pos, _)| file_pos >= block_count)
            .map(|(_, parity_pos)| parity_pos)
            .collect();
        for pos in stale {
            let _ = disk.extents.deallocate(pos);
        }
    }

    let mut occupied: BTreeSet<u32> = disk
        .extents
        .iter_by_parity()
        .flat_map(|e| e.parity_pos..e.parity_end())
        .collect();
    for tomb in &disk.tombstones {
        occupied.extend(tomb.positions.iter().copied().filter(|&p| p != u32::MAX));
    }

    let mut cursor = 0u32;
    let mut next_free = move |occupied: &BTreeSet<u32>| -> u32 {
        while occupied.contains(&cursor) {
            cursor += 1;
        }
        cursor
    };

    for &fid in &file_ids {
        let block_count = disk.file(fid).unwrap().blocks.len() as u32;
        for file_pos in 0..block_count {
            if disk.extents.file2par(fid, file_pos).is_some() {
                continue;
            }
            let pos = next_free(&occupied);
            disk.extents
                .allocate(pos, fid, file_pos)
                .expect("cursor was verified free");
            occupied.insert(pos);
        }
    }
}
