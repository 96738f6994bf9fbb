//! Per-disk extent map: two ordered indexes over the
//! same extent set, keyed by `parity_pos` and by `(file, file_pos)`.

use crate::engine::disk::FileId;
use std::cell::Cell;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtentId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub parity_pos: u32,
    pub file: FileId,
    pub file_pos: u32,
    pub count: u32,
}

impl Extent {
    pub fn parity_end(&self) -> u32 {
        self.parity_pos + self.count
    }

    pub fn file_end(&self) -> u32 {
        self.file_pos + self.count
    }

    pub fn contains_parity(&self, pos: u32) -> bool {
        pos >= self.parity_pos && pos < self.parity_end()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtentError {
    #[error("allocate at parity_pos {parity_pos} would overlap an existing extent")]
    Overlap { parity_pos: u32 },
    #[error("allocate at parity_pos {parity_pos} is not contiguous with any mergeable extent")]
    NotContiguous { parity_pos: u32 },
    #[error("deallocate at parity_pos {parity_pos}: no extent covers this position")]
    NotAllocated { parity_pos: u32 },
}

/// An ordered map of non-overlapping [`Extent`]s for one disk, indexed
/// both by starting parity position and by `(file, file_pos)`, plus a
/// one-entry cache of the last extent touched to accelerate sequential
/// scans.
#[derive(Default)]
pub struct ExtentMap {
    extents: Vec<Option<Extent>>,
    by_parity: BTreeMap<u32, ExtentId>,
    by_file: BTreeMap<(FileId, u32), ExtentId>,
    cache: Cell<Option<ExtentId>>,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: ExtentId) -> Extent {
        self.extents[id.0].expect("extent id must be live")
    }

    fn insert_extent(&mut self, e: Extent) -> ExtentId {
        let id = ExtentId(self.extents.len());
        self.extents.push(Some(e));
        self.by_parity.insert(e.parity_pos, id);
        self.by_file.insert((e.file, e.file_pos), id);
        id
    }

    fn remove_extent(&mut self, id: ExtentId) {
        let e = self.get(id);
        self.by_parity.remove(&e.parity_pos);
        self.by_file.remove(&(e.file, e.file_pos));
        self.extents[id.0] = None;
        if self.cache.get() == Some(id) {
            self.cache.set(None);
        }
    }

    fn replace_extent(&mut self, id: ExtentId, new: Extent) {
        let old = self.get(id);
        if old.parity_pos != new.parity_pos {
            self.by_parity.remove(&old.parity_pos);
            self.by_parity.insert(new.parity_pos, id);
        }
        if (old.file, old.file_pos) != (new.file, new.file_pos) {
            self.by_file.remove(&(old.file, old.file_pos));
            self.by_file.insert((new.file, new.file_pos), id);
        }
        self.extents[id.0] = Some(new);
    }

    fn find_by_parity(&self, pos: u32) -> Option<ExtentId> {
        if let Some(id) = self.cache.get() {
            if self.extents[id.0].map(|e| e.contains_parity(pos)) == Some(true) {
                return Some(id);
            }
        }
        let id = self
            .by_parity
            .range(..=pos)
            .next_back()
            .map(|(_, &id)| id)
            .filter(|&id| self.get(id).contains_parity(pos))?;
        self.cache.set(Some(id));
        Some(id)
    }

    /// `par2file(disk, parity_pos) -> (file, file_pos)`
    pub fn par2file(&self, parity_pos: u32) -> Option<(FileId, u32)> {
        let id = self.find_by_parity(parity_pos)?;
        let e = self.get(id);
        Some((e.file, e.file_pos + (parity_pos - e.parity_pos)))
    }

    /// `file2par(disk, file, file_pos) -> parity_pos`
    pub fn file2par(&self, file: FileId, file_pos: u32) -> Option<u32> {
        let id = self
            .by_file
            .range(..=(file, file_pos))
            .next_back()
            .map(|(_, &id)| id)
            .filter(|&id| {
                let e = self.get(id);
                e.file == file && file_pos < e.file_end()
            })?;
        let e = self.get(id);
        Some(e.parity_pos + (file_pos - e.file_pos))
    }

    /// Allocate `parity_pos` for `(file, file_pos)`. Extends an existing
    /// extent if it ends exactly at `(parity_pos - 1, file_pos - 1)` for
    /// the same file; otherwise inserts a new length-1 extent. Fails if
    /// the position already belongs to another extent, or if it abuts an
    /// extent in only one of the two axes.
    pub fn allocate(
        &mut self,
        parity_pos: u32,
        file: FileId,
        file_pos: u32,
    ) -> Result<(), ExtentError> {
        if self.find_by_parity(parity_pos).is_some() {
            return Err(ExtentError::Overlap { parity_pos });
        }

        if parity_pos > 0 {
            if let Some(prev_id) = self.find_by_parity(parity_pos - 1) {
                let prev = self.get(prev_id);
                let parity_adjacent = prev.parity_end() == parity_pos;
                let file_adjacent = prev.file == file && prev.file_end() == file_pos;
                if parity_adjacent && file_adjacent {
                    let extended = Extent {
                        count: prev.count + 1,
                        ..prev
                    };
                    self.replace_extent(prev_id, extended);
                    self.cache.set(Some(prev_id));
                    return Ok(());
                }
                if parity_adjacent != file_adjacent {
                    return Err(ExtentError::NotContiguous { parity_pos });
                }
            }
        }

        let id = self.insert_extent(Extent {
            parity_pos,
            file,
            file_pos,
            count: 1,
        });
        self.cache.set(Some(id));
        Ok(())
    }

    /// Deallocate `parity_pos`: shrink, split, or remove the covering
    /// extent.
    pub fn deallocate(&mut self, parity_pos: u32) -> Result<(), ExtentError> {
        let id = self
            .find_by_parity(parity_pos)
            .ok_or(ExtentError::NotAllocated { parity_pos })?;
        let e = self.get(id);

        if e.count == 1 {
            self.remove_extent(id);
            return Ok(());
        }

        if parity_pos == e.parity_pos {
            // Shrink from the front.
            let shrunk = Extent {
                parity_pos: e.parity_pos + 1,
                file: e.file,
                file_pos: e.file_pos + 1,
                count: e.count - 1,
            };
            self.replace_extent(id, shrunk);
            return Ok(());
        }

        if parity_pos == e.parity_end() - 1 {
            // Shrink from the back.
            let shrunk = Extent {
                count: e.count - 1,
                ..e
            };
            self.replace_extent(id, shrunk);
            return Ok(());
        }

        // Split into two extents around the gap at parity_pos.
        let left_count = parity_pos - e.parity_pos;
        let left = Extent {
            count: left_count,
            ..e
        };
        let right = Extent {
            parity_pos: parity_pos + 1,
            file: e.file,
            file_pos: e.file_pos + left_count + 1,
            count: e.count - left_count - 1,
        };
        self.replace_extent(id, left);
        let right_id = self.insert_extent(right);
        self.cache.set(Some(right_id));
        Ok(())
    }

    pub fn iter_by_parity(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_parity.values().map(move |&id| self.get(id))
    }

    pub fn iter_by_file(&self, file: FileId) -> impl Iterator<Item = Extent> + '_ {
        self.by_file
            .range((file, 0)..(FileId(file.0 + 1), 0))
            .map(move |(_, &id)| self.get(id))
    }

    /// Verify structural integrity: the parity-ordered
    /// walk must be strictly increasing and non-overlapping.
    pub fn check_parity_order(&self) -> Result<(), ExtentError> {
        let mut prev_end: Option<u32> = None;
        for e in self.iter_by_parity() {
            if let Some(end) = prev_end {
                if e.parity_pos < end {
                    return Err(ExtentError::Overlap {
                        parity_pos: e.parity_pos,
                    });
                }
            }
            prev_end = Some(e.parity_end());
        }
        Ok(())
    }

    /// Verify that `file`'s extents partition `[0..blockmax)`
    /// contiguously, as required for live files. Pass
    /// `is_tombstone = true` to relax the "must start at 0 / end at
    /// blockmax" edges while still rejecting overlap.
    pub fn check_file_contiguous(
        &self,
        file: FileId,
        blockmax: u32,
        is_tombstone: bool,
    ) -> Result<(), ExtentError> {
        let mut expected_start = 0u32;
        let mut first = true;
        for e in self.iter_by_file(file) {
            if first && !is_tombstone && e.file_pos != 0 {
                return Err(ExtentError::NotContiguous {
                    parity_pos: e.parity_pos,
                });
            }
            if !first && e.file_pos != expected_start {
                return Err(ExtentError::NotContiguous {
                    parity_pos: e.parity_pos,
                });
            }
            expected_start = e.file_end();
            first = false;
        }
        if !is_tombstone && !first && expected_start != blockmax {
            return Err(ExtentError::NotContiguous {
                parity_pos: expected_start,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fid(n: usize) -> FileId {
        FileId(n)
    }

    #[test]
    fn allocate_sequential_blocks_extends_one_extent() {
        let mut m = ExtentMap::new();
        m.allocate(0, fid(0), 0).unwrap();
        m.allocate(1, fid(0), 1).unwrap();
        m.allocate(2, fid(0), 2).unwrap();
        assert_eq!(m.iter_by_parity().count(), 1);
        assert_eq!(m.par2file(1), Some((fid(0), 1)));
        assert_eq!(m.file2par(fid(0), 2), Some(2));
    }

    #[test]
    fn allocate_non_contiguous_creates_separate_extents() {
        let mut m = ExtentMap::new();
        m.allocate(0, fid(0), 0).unwrap();
        m.allocate(5, fid(0), 1).unwrap();
        assert_eq!(m.iter_by_parity().count(), 2);
    }

    #[test]
    fn allocate_overlap_fails() {
        let mut m = ExtentMap::new();
        m.allocate(0, fid(0), 0).unwrap();
        assert_eq!(
            m.allocate(0, fid(1), 0),
            Err(ExtentError::Overlap { parity_pos: 0 })
        );
    }

    #[test]
    fn deallocate_single_block_extent_removes_it() {
        let mut m = ExtentMap::new();
        m.allocate(0, fid(0), 0).unwrap();
        m.deallocate(0).unwrap();
        assert_eq!(m.iter_by_parity().count(), 0);
        assert_eq!(m.par2file(0), None);
    }

    #[test]
    fn deallocate_middle_splits_extent() {
        let mut m = ExtentMap::new();
        for i in 0..5u32 {
            m.allocate(i, fid(0), i).unwrap();
        }
        m.deallocate(2).unwrap();
        assert_eq!(m.iter_by_parity().count(), 2);
        assert_eq!(m.par2file(2), None);
        assert_eq!(m.par2file(1), Some((fid(0), 1)));
        assert_eq!(m.par2file(3), Some((fid(0), 3)));
    }

    #[test]
    fn deallocate_edge_shrinks_extent() {
        let mut m = ExtentMap::new();
        for i in 0..4u32 {
            m.allocate(i, fid(0), i).unwrap();
        }
        m.deallocate(0).unwrap();
        assert_eq!(m.par2file(0), None);
        assert_eq!(m.par2file(1), Some((fid(0), 1)));
        m.deallocate(3).unwrap();
        assert_eq!(m.par2file(3), None);
        assert_eq!(m.par2file(2), Some((fid(0), 2)));
    }

    #[test]
    fn allocate_then_deallocate_is_idempotent() {
        let mut m = ExtentMap::new();
        for i in 0..3u32 {
            m.allocate(i, fid(0), i).unwrap();
        }
        let before: Vec<_> = m.iter_by_parity().collect();
        m.allocate(3, fid(0), 3).unwrap();
        m.deallocate(3).unwrap();
        let after: Vec<_> = m.iter_by_parity().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn file_contiguity_check_passes_for_full_coverage() {
        let mut m = ExtentMap::new();
        for i in 0..4u32 {
            m.allocate(i, fid(0), i).unwrap();
        }
        assert!(m.check_file_contiguous(fid(0), 4, false).is_ok());
    }

    #[test]
    fn file_contiguity_check_fails_on_gap() {
        let mut m = ExtentMap::new();
        m.allocate(0, fid(0), 0).unwrap();
        m.allocate(5, fid(0), 2).unwrap();
        assert!(m.check_file_contiguous(fid(0), 3, false).is_err());
    }

    proptest! {
        #[test]
        fn allocate_dealloc_sequences_never_overlap(
            ops in prop::collection::vec(0u32..20, 1..40)
        ) {
            let mut m = ExtentMap::new();
            let mut allocated = std::collections::HashSet::new();
            for pos in ops {
                if allocated.contains(&pos) {
                    let _ = m.deallocate(pos);
                    allocated.remove(&pos);
                } else {
                    if m.allocate(pos, fid(0), pos).is_ok() {
                        allocated.insert(pos);
                    }
                }
                prop_assert!(m.check_parity_order().is_ok());
            }
        }
    }
}
