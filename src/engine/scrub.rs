//! Scrub engine: re-verify a slice of already-synced columns, oldest
//! first, without ever touching parity.

use crate::engine::disk::Disk;
use crate::engine::hash::{digest, Algorithm, Seed};
use crate::engine::io_sources::{build_lookup, DataDiskSource, ParitySource};
use crate::engine::manifest::InfoEntry;
use crate::engine::scheduler::{BlockSource, Scheduler};
use crate::engine::sync::SharedParity;

pub struct ScrubOptions {
    pub block_size: u32,
    pub parity_level: usize,
    pub algorithm: Algorithm,
    pub seed: Seed,
    pub io_error_limit: u32,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct ScrubReport {
    pub columns_scrubbed: u32,
    pub silent_errors: u32,
    pub io_errors: u32,
}

impl ScrubReport {
    pub fn is_clean(&self) -> bool {
        self.silent_errors == 0 && self.io_errors == 0
    }
}

/// Pick which parity positions a scrub pass should cover, given
/// `percentage` of the array and a minimum age of `older_than_days`.
/// Entries that have never been scrubbed (`last_scrub_time == 0`) or are
/// already flagged bad are always included first.
pub fn select_positions(
    info: &[InfoEntry],
    percentage: f64,
    older_than_days: u32,
    now: i64,
) -> Vec<u32> {
    let blockmax = info.len();
    if blockmax == 0 {
        return Vec::new();
    }

    let mut always: Vec<u32> = Vec::new();
    let mut timed: Vec<(u32, i64)> = Vec::new();
    for (i, entry) in info.iter().enumerate() {
        if entry.bad || entry.last_scrub_time == 0 {
            always.push(i as u32);
        } else {
            timed.push((i as u32, entry.last_scrub_time));
        }
    }
    timed.sort_by_key(|&(_, t)| t);

    let count_limit = ((blockmax as f64 * percentage / 100.0).max(blockmax as f64 / 12.0)) as usize;
    let cutoff_age = now - older_than_days as i64 * 86400;

    let budget = count_limit.saturating_sub(always.len());
    let mut picked: Vec<u32> = timed
        .iter()
        .take(budget)
        .filter(|&&(_, t)| t <= cutoff_age)
        .map(|&(pos, _)| pos)
        .collect();

    always.append(&mut picked);
    always.sort_unstable();
    always.dedup();
    always
}

/// Scrub exactly the columns in `positions`, comparing stored hashes to
/// freshly-read data and parity. Never writes; marks `info[pos].bad` and
/// bumps `info[pos].last_scrub_time` on success.
pub fn run(
    disks: &mut [Disk],
    parities: &[SharedParity],
    positions: &[u32],
    info: &mut [InfoEntry],
    opts: &ScrubOptions,
    now: i64,
) -> ScrubReport {
    let mut report = ScrubReport::default();
    if positions.is_empty() {
        return report;
    }
    let blockstart = *positions.iter().min().unwrap();
    let blockmax = *positions.iter().max().unwrap() + 1;
    let position_set: std::collections::HashSet<u32> = positions.iter().copied().collect();

    let disk_count = disks.len();
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

    let mut scheduler = Scheduler::new(
        disk_count,
        opts.parity_level,
        opts.block_size as usize,
        opts.io_error_limit,
    );
    scheduler.io_start(blockstart, blockmax, data_sources, parity_sources, |p| {
        position_set.contains(&p)
    });

    while let Some(parity_pos) = scheduler.io_read_next() {
        let buffers = scheduler.current_buffers();
        let mut disk_ok = vec![true; disk_count];
        while let Some((result, disk_idx)) = scheduler.io_data_read() {
            if result.state == crate::engine::scheduler::TaskState::IoError {
                disk_ok[disk_idx] = false;
                report.io_errors += 1;
            }
        }
        while scheduler.io_parity_read().is_some() {}

        let mut column_bad = false;
        for (i, disk) in disks.iter().enumerate() {
            if !disk_ok[i] {
                continue;
            }
            let Some((file_id, file_pos)) = disk.extents.par2file(parity_pos) else {
                continue;
            };
            let Some(file) = disk.file(file_id) else { continue };
            let Some(block) = file.blocks.get(file_pos as usize) else {
                continue;
            };
            if !block.state.is_file_backed() {
                continue;
            }
            let hash = digest(opts.algorithm, opts.seed, &buffers[i]);
            if block.hash != hash {
                report.silent_errors += 1;
                column_bad = true;
            }
        }

        if let Some(entry) = info.get_mut(parity_pos as usize) {
            if column_bad {
                entry.bad = true;
            } else {
                entry.bad = false;
                entry.last_scrub_time = now;
            }
        }
        report.columns_scrubbed += 1;
    }

    scheduler.io_stop();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_scrubbed_entries_are_always_selected() {
        let info = vec![
            InfoEntry {
                last_scrub_time: 0,
                rehash: false,
                bad: false,
            },
            InfoEntry {
                last_scrub_time: 100,
                rehash: false,
                bad: false,
            },
        ];
        let positions = select_positions(&info, 0.0, 0, 1000);
        assert!(positions.contains(&0));
    }

    #[test]
    fn bad_entries_are_always_selected() {
        let info = vec![
            InfoEntry {
                last_scrub_time: 900,
                rehash: false,
                bad: true,
            },
            InfoEntry {
                last_scrub_time: 950,
                rehash: false,
                bad: false,
            },
        ];
        let positions = select_positions(&info, 0.0, 0, 1000);
        assert!(positions.contains(&0));
    }

    #[test]
    fn empty_info_selects_nothing() {
        assert!(select_positions(&[], 50.0, 0, 1000).is_empty());
    }
}
