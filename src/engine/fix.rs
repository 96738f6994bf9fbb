//! Fix engine: reconstruct missing or corrupt blocks using the same
//! pipeline as sync/scrub plus the RAID codec's recovery path.

use crate::engine::disk::Disk;
use crate::engine::hash::{digest, Algorithm, Seed};
use crate::engine::io_sources::{build_lookup, write_data_block, DataDiskSource, ParitySource};
use crate::engine::raid::raid_rec;
use crate::engine::scheduler::{BlockSource, Scheduler, TaskState};
use crate::engine::sync::SharedParity;
use std::time::{Duration, SystemTime};

pub struct FixOptions {
    pub block_size: u32,
    pub parity_level: usize,
    pub algorithm: Algorithm,
    pub seed: Seed,
    pub io_error_limit: u32,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct FixReport {
    pub columns_fixed: u32,
    pub columns_unrecoverable: u32,
    pub io_errors: u32,
}

/// Reconstruct the columns in `positions` (all columns, only the ones
/// covering caller-named files, or only `bad=true` ones — the caller
/// decides which positions to pass). Missing/failed disks at read time
/// become entries in the per-column failed set; columns with more
/// failures than `parity_level` are reported unrecoverable and skipped.
pub fn run(
    disks: &mut [Disk],
    parities: &[SharedParity],
    positions: &[u32],
    opts: &FixOptions,
) -> FixReport {
    let mut report = FixReport::default();
    if positions.is_empty() {
        return report;
    }
    let blockstart = *positions.iter().min().unwrap();
    let blockmax = *positions.iter().max().unwrap() + 1;
    let position_set: std::collections::HashSet<u32> = positions.iter().copied().collect();

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
    scheduler.io_start(blockstart, blockmax, data_sources, parity_sources, |p| {
        position_set.contains(&p)
    });

    while let Some(parity_pos) = scheduler.io_read_next() {
        let mut buffers = scheduler.current_buffers();
        let mut failed: Vec<usize> = Vec::new();

        while let Some((result, disk_idx)) = scheduler.io_data_read() {
            if result.state == TaskState::IoError {
                failed.push(disk_idx);
                report.io_errors += 1;
            }
        }
        while let Some((result, parity_idx)) = scheduler.io_parity_read() {
            if result.state == TaskState::IoError {
                failed.push(disk_count + parity_idx);
                report.io_errors += 1;
            }
        }

        // A disk that read fine but no longer matches its recorded hash
        // is corrupt rather than merely unreadable; treat it the same
        // as a missing disk so raid_rec reconstructs it from parity.
        for idx in 0..disk_count {
            if failed.contains(&idx) {
                continue;
            }
            let Some((file_id, file_pos)) = disks[idx].extents.par2file(parity_pos) else {
                continue;
            };
            let Some(file) = disks[idx].file(file_id) else {
                continue;
            };
            let Some(block) = file.blocks.get(file_pos as usize) else {
                continue;
            };
            if block.hash.is_zero() {
                continue;
            }
            if digest(opts.algorithm, opts.seed, &buffers[idx]) != block.hash {
                failed.push(idx);
            }
        }

        if failed.len() > parity_level {
            report.columns_unrecoverable += 1;
            continue;
        }
        if !failed.is_empty() && raid_rec(&failed, disk_count, parity_level, &mut buffers).is_err() {
            report.columns_unrecoverable += 1;
            continue;
        }

        let mut column_ok = true;
        for &idx in &failed {
            if idx >= disk_count {
                let level = idx - disk_count;
                if let Some(parity) = parities.get(level) {
                    if parity
                        .lock()
                        .unwrap()
                        .write_block(parity_pos as u64, &buffers[idx])
                        .is_err()
                    {
                        column_ok = false;
                    }
                }
                continue;
            }
            let disk = &disks[idx];
            let Some((file_id, file_pos)) = disk.extents.par2file(parity_pos) else {
                continue;
            };
            let Some(file) = disk.file(file_id) else { continue };
            let Some(block) = file.blocks.get(file_pos as usize) else {
                continue;
            };
            let rehashed = digest(opts.algorithm, opts.seed, &buffers[idx]);
            if !block.hash.is_zero() && rehashed != block.hash {
                column_ok = false;
                continue;
            }
            let full_path = disk.mount_point.join(&file.path);
            if write_data_block(&full_path, file_pos, opts.block_size, &buffers[idx]).is_err() {
                column_ok = false;
            }
        }

        if column_ok {
            report.columns_fixed += 1;
        } else {
            report.columns_unrecoverable += 1;
        }
    }

    scheduler.io_stop();
    report
}

/// Restore a file's recorded mtime after reconstruction, covering the
/// subset the standard library can express without a platform-specific
/// permissions crate.
pub fn restore_mtime(path: &std::path::Path, mtime_sec: i64, mtime_nsec: u32) -> std::io::Result<()> {
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    let when = if mtime_sec >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(mtime_sec as u64, mtime_nsec)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new((-mtime_sec) as u64, 0)
    };
    let times = std::fs::FileTimes::new().set_modified(when);
    f.set_times(times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::disk::File;
    use parity_io::{FileSplit, ParityHandle, Split};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn opts() -> FixOptions {
        FixOptions {
            block_size: 64,
            parity_level: 1,
            algorithm: Algorithm::Murmur3_128,
            seed: Seed::default(),
            io_error_limit: 10,
        }
    }

    #[test]
    fn reconstructs_a_missing_data_file_from_parity() {
        let dir = tempdir().unwrap();
        let disk_root = dir.path().join("disk1");
        std::fs::create_dir_all(&disk_root).unwrap();
        let data_path = disk_root.join("a.bin");
        let data = vec![0xabu8; 64];
        std::fs::write(&data_path, &data).unwrap();

        let hash = digest(Algorithm::Murmur3_128, Seed::default(), &data);
        let mut file = File::new(PathBuf::from("a.bin"), 64, 0, 0, 1, 64);
        file.blocks[0].allocate_chg();
        file.blocks[0].mark_synced(hash);

        let mut disk = Disk::new("d1", disk_root.clone(), uuid::Uuid::nil());
        let fid = disk.insert_file(file);
        disk.extents.allocate(0, fid, 0).unwrap();

        let parity_path = dir.path().join("parity").join("p0");
        let backend = FileSplit::open(&parity_path).unwrap();
        let mut handle = ParityHandle::new(vec![Split::new(backend, 0, 0)], 64);
        handle.write_block(0, &data).unwrap();
        let parities: Vec<SharedParity> = vec![Arc::new(Mutex::new(handle))];

        // Simulate data loss.
        std::fs::remove_file(&data_path).unwrap();

        let mut disks = vec![disk];
        let report = run(&mut disks, &parities, &[0], &opts());
        assert_eq!(report.columns_fixed, 1);
        let restored = std::fs::read(&data_path).unwrap();
        assert_eq!(restored, data);
    }
}
