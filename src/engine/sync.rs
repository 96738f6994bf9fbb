//! Sync engine: hash data, update parity, and commit block-state
//! transitions one column at a time.

use crate::engine::block::BlockState;
use crate::engine::disk::Disk;
use crate::engine::hash::{digest, Algorithm, Digest, Seed};
use crate::engine::io_sources::{build_lookup, DataDiskSource, ParitySource};
use crate::engine::manifest::InfoEntry;
use crate::engine::raid::{raid_gen, raid_rec};
use crate::engine::scheduler::{BlockSource, Scheduler, TaskState};
use parity_io::{FileSplit, ParityHandle};
use std::fs;
use std::sync::{Arc, Mutex};

pub type SharedParity = Arc<Mutex<ParityHandle<FileSplit>>>;

pub struct SyncOptions {
    pub block_size: u32,
    pub parity_level: usize,
    pub algorithm: Algorithm,
    pub seed: Seed,
    pub io_error_limit: u32,
    pub autosave_interval_bytes: u64,
    /// Set while an operator-requested hash algorithm migration is in
    /// progress: columns with `info[pos].rehash` set are compared
    /// against this algorithm instead of `algorithm`, then restamped
    /// under `algorithm` and have their `rehash` flag cleared.
    pub previous_algorithm: Option<Algorithm>,
}

#[derive(Default, Debug, Clone)]
pub struct SyncReport {
    pub columns_processed: u32,
    pub file_errors: u32,
    pub io_errors: u32,
    pub silent_errors: u32,
    pub unrecoverable_columns: u32,
    /// Parity positions this pass actually committed a fresh block-state
    /// and (unless skipped as unchanged) parity write for. A tombstone
    /// may only be reclaimed once every position it holds appears here —
    /// `columns_processed` alone doesn't say which positions, and a
    /// one-valid/one-invalid skip or an unrecoverable column never
    /// reaches this set.
    pub synced_positions: std::collections::BTreeSet<u32>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.file_errors == 0
            && self.io_errors == 0
            && self.silent_errors == 0
            && self.unrecoverable_columns == 0
    }
}

/// Run a sync pass over `[blockstart, blockmax)` across `disks`, writing
/// parity through `parities`. `autosave` is invoked every
/// `autosave_interval_bytes` bytes of column progress; callers typically
/// persist the manifest from it.
pub fn run(
    disks: &mut [Disk],
    parities: &[SharedParity],
    blockstart: u32,
    blockmax: u32,
    opts: &SyncOptions,
    info: &mut [InfoEntry],
    now: i64,
    mut autosave: impl FnMut(&mut [Disk], &[InfoEntry]) -> std::io::Result<()>,
) -> SyncReport {
    let mut report = SyncReport::default();
    if blockmax <= blockstart {
        return report;
    }

    let disk_count = disks.len();
    let parity_level = opts.parity_level;

    let data_sources: Vec<Box<dyn BlockSource>> = disks
        .iter()
        .map(|d| {
            let lookup = build_lookup(d, blockstart, blockmax);
            Box::new(DataDiskSource::new(opts.block_size as usize, lookup)) as Box<dyn BlockSource>
        })
        .collect();

    let parity_sources: Vec<Box<dyn BlockSource>> = parities
        .iter()
        .map(|p| Box::new(ParitySource { handle: p.clone() }) as Box<dyn BlockSource>)
        .collect();

    let mut scheduler = Scheduler::new(disk_count, parity_level, opts.block_size as usize, opts.io_error_limit);
    scheduler.io_start(blockstart, blockmax, data_sources, parity_sources, |_| true);

    let mut bytes_since_autosave: u64 = 0;

    while let Some(parity_pos) = scheduler.io_read_next() {
        let mut buffers = scheduler.current_buffers();
        let mut disk_results = vec![None; disk_count];
        while let Some((result, disk_idx)) = scheduler.io_data_read() {
            disk_results[disk_idx] = Some(result);
        }
        while scheduler.io_parity_read().is_some() {}

        // A column mid hash-algorithm migration is compared against the
        // previous algorithm (what the stored hash was computed under)
        // while the value retained for storage is always under the
        // current algorithm, finishing the migration for this column.
        let rehash_column = info
            .get(parity_pos as usize)
            .map(|e| e.rehash)
            .unwrap_or(false)
            && opts.previous_algorithm.is_some();

        // Resolve (file, file_pos, block) for each disk at this column.
        let mut blocks: Vec<Option<(usize, u32)>> = vec![None; disk_count]; // (file index slot unused placeholder)
        let mut one_valid = false;
        let mut one_invalid = rehash_column;
        for (i, disk) in disks.iter().enumerate() {
            if let Some((file_id, file_pos)) = disk.extents.par2file(parity_pos) {
                if let Some(file) = disk.file(file_id) {
                    if let Some(block) = file.blocks.get(file_pos as usize) {
                        if block.state.is_file_backed() {
                            one_valid = true;
                        }
                        if block.state != BlockState::Blk || block.bad {
                            one_invalid = true;
                        }
                        blocks[i] = Some((file_id.0, file_pos));
                    }
                }
            }
        }
        if !one_valid || !one_invalid {
            continue;
        }

        // Modification-during-sync check: re-stat the backing file.
        for (i, disk) in disks.iter().enumerate() {
            let Some((file_id, _)) = blocks[i] else { continue };
            let Some(file) = disk.file(crate::engine::disk::FileId(file_id)) else {
                continue;
            };
            let full_path = disk.mount_point.join(&file.path);
            if let Ok(meta) = fs::metadata(&full_path) {
                use std::os::unix::fs::MetadataExt;
                let matches = file.matches_stat(
                    meta.len(),
                    meta.mtime(),
                    meta.mtime_nsec() as u32,
                    meta.ino(),
                );
                if !matches {
                    report.file_errors += 1;
                }
            }
        }

        let mut silent_failed: Vec<usize> = Vec::new();
        let mut computed_hashes = vec![Digest::zero(); disk_count];
        for i in 0..disk_count {
            let Some(result) = disk_results[i] else { continue };
            if result.state == TaskState::IoError {
                report.io_errors += 1;
                silent_failed.push(i);
                continue;
            }
            let hash = digest(opts.algorithm, opts.seed, &buffers[i]);
            computed_hashes[i] = hash;
            if let Some((file_id, file_pos)) = blocks[i] {
                let disk = &disks[i];
                if let Some(file) = disk.file(crate::engine::disk::FileId(file_id)) {
                    let block = &file.blocks[file_pos as usize];
                    if matches!(block.state, BlockState::Blk | BlockState::Rep) {
                        let compare_hash = if rehash_column {
                            digest(opts.previous_algorithm.unwrap(), opts.seed, &buffers[i])
                        } else {
                            hash
                        };
                        if block.hash != compare_hash {
                            report.silent_errors += 1;
                            silent_failed.push(i);
                        }
                    }
                }
            }
        }

        let mut skip_parity_write = true;
        for i in 0..disk_count {
            if let Some((file_id, file_pos)) = blocks[i] {
                let file = disks[i].file(crate::engine::disk::FileId(file_id)).unwrap();
                let block = &file.blocks[file_pos as usize];
                if block.state != BlockState::Blk || block.bad || block.hash != computed_hashes[i] {
                    skip_parity_write = false;
                }
            }
        }

        if !silent_failed.is_empty() {
            if silent_failed.len() <= parity_level {
                let saved = buffers.clone();
                if raid_rec(&silent_failed, disk_count, parity_level, &mut buffers).is_ok() {
                    let mut recovered_ok = true;
                    for &i in &silent_failed {
                        let rehashed = digest(opts.algorithm, opts.seed, &buffers[i]);
                        if let Some((file_id, file_pos)) = blocks[i] {
                            let file = disks[i].file(crate::engine::disk::FileId(file_id)).unwrap();
                            let expected = file.blocks[file_pos as usize].hash;
                            if !expected.is_zero() && rehashed != expected {
                                recovered_ok = false;
                            }
                        }
                    }
                    if !recovered_ok {
                        buffers = saved;
                        report.unrecoverable_columns += 1;
                        for &i in &silent_failed {
                            if let Some((file_id, file_pos)) = blocks[i] {
                                if let Some(file) =
                                    disks[i].file_mut(crate::engine::disk::FileId(file_id))
                                {
                                    file.blocks[file_pos as usize].bad = true;
                                }
                            }
                        }
                        if let Some(entry) = info.get_mut(parity_pos as usize) {
                            entry.bad = true;
                        }
                        continue;
                    }
                } else {
                    report.unrecoverable_columns += 1;
                    if let Some(entry) = info.get_mut(parity_pos as usize) {
                        entry.bad = true;
                    }
                    continue;
                }
            } else {
                report.unrecoverable_columns += 1;
                if let Some(entry) = info.get_mut(parity_pos as usize) {
                    entry.bad = true;
                }
                continue;
            }
        }

        if !skip_parity_write {
            if let Err(e) = raid_gen(disk_count, parity_level, &mut buffers) {
                report.io_errors += 1;
                let _ = e;
                continue;
            }
            for (level, parity) in parities.iter().enumerate() {
                let buf = &buffers[disk_count + level];
                if parity.lock().unwrap().write_block(parity_pos as u64, buf).is_err() {
                    report.io_errors += 1;
                }
            }
        }

        for i in 0..disk_count {
            if let Some((file_id, file_pos)) = blocks[i] {
                if let Some(file) = disks[i].file_mut(crate::engine::disk::FileId(file_id)) {
                    let block = &mut file.blocks[file_pos as usize];
                    if matches!(block.state, BlockState::Chg | BlockState::Rep) {
                        block.mark_synced(computed_hashes[i]);
                    } else if rehash_column && block.state == BlockState::Blk {
                        block.hash = computed_hashes[i];
                    }
                }
            }
        }
        if let Some(entry) = info.get_mut(parity_pos as usize) {
            entry.last_scrub_time = now;
            entry.bad = false;
            entry.rehash = false;
        }

        report.columns_processed += 1;
        report.synced_positions.insert(parity_pos);
        bytes_since_autosave += opts.block_size as u64 * disk_count as u64;
        if bytes_since_autosave >= opts.autosave_interval_bytes {
            let _ = autosave(disks, info);
            bytes_since_autosave = 0;
        }

        if scheduler.check_io_error_budget().is_err() {
            break;
        }
    }

    scheduler.io_stop();
    for parity in parities {
        let _ = parity.lock().unwrap().sync_all();
    }
    let _ = autosave(disks, info);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::disk::File;
    use crate::engine::hash::Seed;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn opts() -> SyncOptions {
        SyncOptions {
            block_size: 64,
            parity_level: 1,
            algorithm: Algorithm::Murmur3_128,
            seed: Seed::default(),
            io_error_limit: 10,
            autosave_interval_bytes: 1 << 30,
            previous_algorithm: None,
        }
    }

    #[test]
    fn empty_array_sync_processes_no_columns() {
        let mut disks: Vec<Disk> = vec![];
        let parities: Vec<SharedParity> = vec![];
        let mut info: Vec<InfoEntry> = vec![];
        let report = run(&mut disks, &parities, 0, 0, &opts(), &mut info, 0, |_, _| Ok(()));
        assert_eq!(report.columns_processed, 0);
        assert!(report.is_clean());
    }

    #[test]
    fn single_block_write_syncs_and_marks_blk() {
        let dir = tempdir().unwrap();
        let disk_root = dir.path().join("disk1");
        std::fs::create_dir_all(&disk_root).unwrap();
        std::fs::write(disk_root.join("hello.txt"), b"hello\n!!!").unwrap();

        let meta = std::fs::metadata(disk_root.join("hello.txt")).unwrap();
        use std::os::unix::fs::MetadataExt;
        let mut file = File::new(
            PathBuf::from("hello.txt"),
            9,
            meta.mtime(),
            meta.mtime_nsec() as u32,
            meta.ino(),
            64,
        );
        file.blocks[0].allocate_chg();

        let mut disk = Disk::new("d1", disk_root, uuid::Uuid::nil());
        let fid = disk.insert_file(file);
        disk.extents.allocate(0, fid, 0).unwrap();

        let parity_dir = dir.path().join("parity");
        std::fs::create_dir_all(&parity_dir).unwrap();
        let split_path = parity_dir.join("p0");
        let backend = FileSplit::open(&split_path).unwrap();
        let handle = ParityHandle::new(vec![parity_io::Split::new(backend, 0, 0)], 64);

        let mut disks = vec![disk];
        let parities: Vec<SharedParity> = vec![Arc::new(Mutex::new(handle))];
        let mut info = vec![InfoEntry {
            last_scrub_time: 0,
            rehash: false,
            bad: false,
        }];
        let report = run(&mut disks, &parities, 0, 1, &opts(), &mut info, 1_700_000_000, |_, _| Ok(()));

        assert_eq!(report.columns_processed, 1);
        assert!(report.is_clean());
        let synced_file = disks[0].file(fid).unwrap();
        assert_eq!(synced_file.blocks[0].state, BlockState::Blk);
        assert_eq!(info[0].last_scrub_time, 1_700_000_000);

        let mut out = vec![0u8; 64];
        parities[0].lock().unwrap().read_block(0, &mut out).unwrap();
        assert_eq!(&out[0..9], b"hello\n!!!");
    }

    #[test]
    fn rehash_column_migrates_stored_hash_to_new_algorithm() {
        let dir = tempdir().unwrap();
        let disk_root = dir.path().join("disk1");
        std::fs::create_dir_all(&disk_root).unwrap();
        let data = b"hello\n!!!";
        std::fs::write(disk_root.join("hello.txt"), data).unwrap();

        let meta = std::fs::metadata(disk_root.join("hello.txt")).unwrap();
        use std::os::unix::fs::MetadataExt;
        let mut file = File::new(
            PathBuf::from("hello.txt"),
            data.len() as u64,
            meta.mtime(),
            meta.mtime_nsec() as u32,
            meta.ino(),
            64,
        );
        let old_hash = digest(Algorithm::Murmur3_128, Seed::default(), {
            let mut buf = vec![0u8; 64];
            buf[..data.len()].copy_from_slice(data);
            &buf
        });
        file.blocks[0].allocate_chg();
        file.blocks[0].mark_synced(old_hash);

        let mut disk = Disk::new("d1", disk_root, uuid::Uuid::nil());
        let fid = disk.insert_file(file);
        disk.extents.allocate(0, fid, 0).unwrap();

        let parity_dir = dir.path().join("parity");
        std::fs::create_dir_all(&parity_dir).unwrap();
        let backend = FileSplit::open(&parity_dir.join("p0")).unwrap();
        let mut handle = ParityHandle::new(vec![parity_io::Split::new(backend, 0, 0)], 64);
        let mut parity_buf = vec![0u8; 64];
        parity_buf[..data.len()].copy_from_slice(data);
        handle.write_block(0, &parity_buf).unwrap();

        let mut disks = vec![disk];
        let parities: Vec<SharedParity> = vec![Arc::new(Mutex::new(handle))];
        let mut info = vec![InfoEntry {
            last_scrub_time: 5,
            rehash: true,
            bad: false,
        }];
        let mut rehash_opts = opts();
        rehash_opts.algorithm = Algorithm::Metro128;
        rehash_opts.previous_algorithm = Some(Algorithm::Murmur3_128);

        let report = run(&mut disks, &parities, 0, 1, &rehash_opts, &mut info, 99, |_, _| Ok(()));

        assert!(report.is_clean());
        assert!(!info[0].rehash);
        let new_hash = disks[0].file(fid).unwrap().blocks[0].hash;
        assert_ne!(new_hash, old_hash);
        let expected = digest(Algorithm::Metro128, Seed::default(), &parity_buf);
        assert_eq!(new_hash, expected);
    }
}
