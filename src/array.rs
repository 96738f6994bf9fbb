//! The array: the orchestrator that wires a loaded [`Config`] and its
//! content [`Manifest`] to the engine's scan/sync/scrub/fix passes, and
//! is what the command-line front-end actually drives.

use crate::config::Config;
use crate::engine::disk::Disk;
use crate::engine::fix::{self, FixOptions, FixReport};
use crate::engine::manifest::{
    self, compute_parity_sign, verify_parity_sign, InfoEntry, Manifest, ManifestError,
    ManifestHeader, ParityDescriptor, SplitDescriptor,
};
use crate::engine::scan::{scan_disk, DiffSummary};
use crate::engine::scrub::{self, ScrubOptions, ScrubReport};
use crate::engine::sync::{self, SharedParity, SyncOptions, SyncReport};
use crate::error::Result;
use parity_io::{FileSplit, ParityHandle, Split};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Per-disk usage snapshot read straight from the manifest, without
/// touching any data disk. Backs the `status` subcommand.
pub struct DiskStatus {
    pub name: String,
    pub files: usize,
    pub tombstones: usize,
    pub blocks_used: u32,
}

pub struct Array {
    pub config: Config,
    pub manifest: Manifest,
}

impl Array {
    /// Load the first readable manifest among `config.content`, or
    /// initialize a fresh one if none of those paths exist yet. A
    /// manifest found but unreadable (bad CRC, unknown tag, ...) is a
    /// fatal error rather than cause to fall back to the next copy —
    /// the copies are supposed to be identical, so the others are
    /// suspect too.
    pub fn open(config: Config) -> Result<Self> {
        let mut loaded = None;
        let mut last_err = None;
        for path in &config.content {
            match manifest::read_manifest(path) {
                Ok(m) => {
                    loaded = Some(m);
                    break;
                }
                Err(ManifestError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let manifest = match loaded {
            Some(m) => {
                verify_parity_sign(&m)?;
                m
            }
            None => match last_err {
                Some(e) => return Err(e.into()),
                None => Self::fresh_manifest(&config)?,
            },
        };

        Ok(Self { config, manifest })
    }

    fn fresh_manifest(config: &Config) -> Result<Manifest> {
        let disks = config
            .disk
            .iter()
            .map(|d| Disk::new(d.name.clone(), d.mount_point.clone(), uuid::Uuid::new_v4()))
            .collect::<Vec<_>>();

        let parities = config
            .parity
            .iter()
            .map(|p| ParityDescriptor {
                level: p.level,
                uuid: uuid::Uuid::new_v4(),
                splits: p
                    .splits
                    .iter()
                    .map(|path| SplitDescriptor {
                        path: path.clone(),
                        size: 0,
                        valid_size: 0,
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        Ok(Manifest {
            algorithm: config.algorithm()?,
            seed: crate::engine::hash::Seed::default(),
            block_size: config.block_size,
            parity_sign: compute_parity_sign(&parities),
            disks,
            info: Vec::new(),
            parities,
        })
    }

    /// Persist the manifest to every configured content path.
    pub fn save(&self) -> Result<()> {
        manifest::write_manifest(&self.config.content, &self.manifest)?;
        Ok(())
    }

    /// Open every parity split named by the manifest, ready for the
    /// sync/scrub/fix engines.
    pub fn open_parities(&self) -> Result<Vec<SharedParity>> {
        let mut out = Vec::with_capacity(self.manifest.parities.len());
        for parity in &self.manifest.parities {
            let mut splits = Vec::with_capacity(parity.splits.len());
            for split in &parity.splits {
                let backend = FileSplit::open(&split.path)?;
                splits.push(Split::new(backend, split.size, split.valid_size));
            }
            let mut handle = ParityHandle::new(splits, self.manifest.block_size);
            handle.verify_sizes(false)?;
            out.push(Arc::new(Mutex::new(handle)));
        }
        Ok(out)
    }

    /// Write a parity handle's (possibly grown) split sizes back onto
    /// the manifest's descriptors, after a pass that may have extended
    /// the final split of one or more parities.
    fn record_parity_sizes(&mut self, parities: &[SharedParity]) {
        for (descriptor, handle) in self.manifest.parities.iter_mut().zip(parities) {
            let handle = handle.lock().unwrap();
            for (split_desc, split) in descriptor.splits.iter_mut().zip(handle.splits.iter()) {
                split_desc.size = split.size;
                split_desc.valid_size = split.valid_size;
            }
        }
    }

    fn parity_level(&self) -> usize {
        self.manifest.parities.len()
    }

    /// One past the highest parity position any disk's extent map
    /// currently covers — the exclusive upper bound of the range a full
    /// sync/scrub/fix pass needs to consider.
    fn blockmax(&self) -> u32 {
        self.manifest
            .disks
            .iter()
            .flat_map(|d| d.extents.iter_by_parity().map(|e| e.parity_end()))
            .max()
            .unwrap_or(0)
    }

    /// Scan every disk for filesystem changes and allocate parity
    /// positions for whatever newly-appeared blocks the scan produced.
    /// Mutates `self.manifest.disks` in place and returns the summed
    /// diff.
    pub fn scan(&mut self) -> DiffSummary {
        let mut total = DiffSummary::default();
        let disks = &mut self.manifest.disks;
        let count = disks.len();

        for i in 0..count {
            let mut current =
                std::mem::replace(&mut disks[i], Disk::new(String::new(), PathBuf::new(), uuid::Uuid::nil()));
            let others: Vec<&Disk> = disks
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, d)| d)
                .collect();
            let summary = scan_disk(&mut current, &others, self.manifest.block_size as u64);
            disks[i] = current;

            total.equal += summary.equal;
            total.moved += summary.moved;
            total.copied += summary.copied;
            total.restored += summary.restored;
            total.changed += summary.changed;
            total.removed += summary.removed;
            total.added += summary.added;
        }

        for disk in disks.iter_mut() {
            crate::engine::allocate_disk(disk);
        }
        total
    }

    /// Drive a full sync: scan, allocate, run the sync engine over the
    /// whole covered range, reclaim exhausted tombstones, and persist.
    ///
    /// If the configured hash algorithm no longer matches the one the
    /// manifest was last synced under, every already-synced position is
    /// flagged for rehash: this pass verifies each such block against
    /// its old-algorithm hash one last time while restamping it under
    /// the new algorithm, completing the migration column by column
    /// rather than requiring a dedicated one-shot rehash command.
    pub fn sync(&mut self, now: i64) -> Result<SyncReport> {
        self.scan();

        let requested_algorithm = self.config.algorithm()?;
        let previous_algorithm = if requested_algorithm != self.manifest.algorithm {
            let old = self.manifest.algorithm;
            for entry in self.manifest.info.iter_mut() {
                entry.rehash = true;
            }
            self.manifest.algorithm = requested_algorithm;
            Some(old)
        } else {
            None
        };

        let blockmax = self.blockmax();
        if self.manifest.info.len() < blockmax as usize {
            let grow = blockmax as usize;
            self.manifest.info.resize_with(grow, || InfoEntry {
                last_scrub_time: 0,
                rehash: false,
                bad: false,
            });
        }

        let parities = self.open_parities()?;
        let opts = SyncOptions {
            block_size: self.manifest.block_size,
            parity_level: self.parity_level(),
            algorithm: self.manifest.algorithm,
            seed: self.manifest.seed,
            io_error_limit: self.config.io_error_limit,
            autosave_interval_bytes: self.config.autosave_interval_bytes,
            previous_algorithm,
        };

        // Scalars copied out up front so the autosave closure below
        // doesn't need to borrow `self.manifest` as a whole (it only
        // gets `&mut [Disk]` from the sync engine) while `disks` is
        // simultaneously borrowed mutably for the `sync::run` call.
        let content_paths = self.config.content.clone();
        let algorithm = self.manifest.algorithm;
        let seed = self.manifest.seed;
        let block_size = self.manifest.block_size;
        let parity_sign = self.manifest.parity_sign;

        let report = {
            let manifest = &mut self.manifest;
            let parity_descriptors = &manifest.parities;
            sync::run(
                &mut manifest.disks,
                &parities,
                0,
                blockmax,
                &opts,
                &mut manifest.info,
                now,
                |disks, info| {
                    let header = ManifestHeader {
                        algorithm,
                        seed,
                        block_size,
                        parity_sign,
                        info,
                        parities: parity_descriptors,
                    };
                    manifest::write_manifest_parts(&content_paths, &header, disks)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
                },
            )
        };

        for disk in self.manifest.disks.iter_mut() {
            disk.reclaim_tombstones(&report.synced_positions);
        }
        self.record_parity_sizes(&parities);
        self.save()?;
        Ok(report)
    }

    /// Drive a scrub pass over `percentage`/`older_than_days`-selected
    /// columns, never writing parity.
    pub fn scrub(&mut self, percentage: f64, older_than_days: u32, now: i64) -> Result<ScrubReport> {
        let positions = scrub::select_positions(&self.manifest.info, percentage, older_than_days, now);
        if positions.is_empty() {
            return Ok(ScrubReport::default());
        }

        let parities = self.open_parities()?;
        let opts = ScrubOptions {
            block_size: self.manifest.block_size,
            parity_level: self.parity_level(),
            algorithm: self.manifest.algorithm,
            seed: self.manifest.seed,
            io_error_limit: self.config.io_error_limit,
        };
        let report = scrub::run(
            &mut self.manifest.disks,
            &parities,
            &positions,
            &mut self.manifest.info,
            &opts,
            now,
        );
        self.save()?;
        Ok(report)
    }

    /// Resolve the `fix` subcommand's position selectors: `-e` fixes
    /// every position the manifest currently tracks; otherwise `-f
    /// PATH` names specific files by their extents. `-d DISK` (if
    /// non-empty) restricts either to the named disks.
    pub fn fix_positions(&self, files: &[PathBuf], everything: bool, disk_filter: &[String]) -> Vec<u32> {
        let disk_ok = |name: &str| disk_filter.is_empty() || disk_filter.iter().any(|d| d == name);
        let mut positions = std::collections::BTreeSet::new();

        for disk in &self.manifest.disks {
            if !disk_ok(&disk.name) {
                continue;
            }
            if everything {
                positions.extend(disk.extents.iter_by_parity().flat_map(|e| e.parity_pos..e.parity_end()));
                continue;
            }
            for path in files {
                let Some(fid) = disk.file_by_path(path) else { continue };
                let Some(file) = disk.file(fid) else { continue };
                for file_pos in 0..file.blocks.len() as u32 {
                    if let Some(pos) = disk.extents.file2par(fid, file_pos) {
                        positions.insert(pos);
                    }
                }
            }
        }
        positions.into_iter().collect()
    }

    /// Reconstruct the given positions from parity and write the
    /// recovered data/parity back, then persist.
    pub fn fix(&mut self, positions: &[u32]) -> Result<FixReport> {
        if positions.is_empty() {
            return Ok(FixReport::default());
        }
        let parities = self.open_parities()?;
        let opts = FixOptions {
            block_size: self.manifest.block_size,
            parity_level: self.parity_level(),
            algorithm: self.manifest.algorithm,
            seed: self.manifest.seed,
            io_error_limit: self.config.io_error_limit,
        };
        let report = fix::run(&mut self.manifest.disks, &parities, positions, &opts);
        self.record_parity_sizes(&parities);
        self.save()?;
        Ok(report)
    }

    /// Scan without syncing and report the diff, for the `diff`
    /// subcommand. Persists the manifest since the scan mutates file
    /// identity/state even when no sync is run.
    pub fn diff(&mut self) -> Result<DiffSummary> {
        let summary = self.scan();
        self.save()?;
        Ok(summary)
    }

    /// Per-disk usage snapshot without touching any data disk.
    pub fn status(&self) -> Vec<DiskStatus> {
        self.manifest
            .disks
            .iter()
            .map(|d| DiskStatus {
                name: d.name.clone(),
                files: d.files().count(),
                tombstones: d.tombstones.len(),
                blocks_used: d.extents.iter_by_parity().map(|e| e.count).sum(),
            })
            .collect()
    }
}
