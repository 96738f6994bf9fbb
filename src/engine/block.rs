//! Per-block lifecycle: the EMPTY/CHG/REP/BLK/DELETED state machine.

use crate::engine::hash::Digest;

/// A block's two-bit state plus the three additional states the engine
/// actually needs (`EMPTY`, `CHG`, `REP`, `BLK`, `DELETED`): five values,
/// tracked here as a plain enum rather than packed bits since nothing in
/// this engine needs the literal two-bit-field layout the name implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Never used.
    Empty,
    /// Tentative: allocated by scan, hash not yet confirmed by sync.
    Chg,
    /// Hash copied from a known-identical source file by copy detection;
    /// parity has not been updated to cover it yet.
    Rep,
    /// Hash matches current parity.
    Blk,
    /// Tombstone: file removed, but the parity slot is still occupied.
    Deleted,
}

impl BlockState {
    /// Whether this state still has a file backing the block's data
    /// (used by the sync/scrub engines' "one_valid" check).
    pub fn is_file_backed(self) -> bool {
        matches!(self, BlockState::Chg | BlockState::Rep | BlockState::Blk)
    }
}

/// One block entry: state, hash, and which parity position it occupies.
///
/// Invariants:
/// - `Blk`: `hash` matches both the on-disk data and the current parity.
/// - `Chg`: `hash` is tentative; parity may not reflect it yet.
/// - `Rep`: `hash` is the expected new data's hash; parity not updated.
/// - `Deleted`: `hash` is the last-known hash before removal.
#[derive(Clone, Copy, Debug)]
pub struct Block {
    pub state: BlockState,
    pub hash: Digest,
    pub parity_pos: u32,
    /// Set by sync/scrub when a hash mismatch is observed with no I/O
    /// error.
    pub bad: bool,
}

impl Block {
    pub fn empty(parity_pos: u32) -> Self {
        Self {
            state: BlockState::Empty,
            hash: Digest::zero(),
            parity_pos,
            bad: false,
        }
    }

    pub fn new_chg(parity_pos: u32) -> Self {
        Self {
            state: BlockState::Chg,
            hash: Digest::zero(),
            parity_pos,
            bad: false,
        }
    }

    /// CHG/REP -> BLK after sync confirms the hash and writes parity.
    pub fn mark_synced(&mut self, hash: Digest) {
        debug_assert!(matches!(self.state, BlockState::Chg | BlockState::Rep));
        self.state = BlockState::Blk;
        self.hash = hash;
        self.bad = false;
    }

    /// BLK -> DELETED when the owning file is removed but parity still
    /// covers the slot.
    pub fn mark_deleted(&mut self) {
        debug_assert_eq!(self.state, BlockState::Blk);
        self.state = BlockState::Deleted;
    }

    /// DELETED -> EMPTY once a sync no longer needs the slot's old data.
    pub fn erase_tombstone(&mut self) {
        debug_assert_eq!(self.state, BlockState::Deleted);
        self.state = BlockState::Empty;
        self.hash = Digest::zero();
        self.bad = false;
    }

    /// DELETED/EMPTY -> CHG when scan allocates a new block here.
    pub fn allocate_chg(&mut self) {
        debug_assert!(matches!(self.state, BlockState::Empty | BlockState::Deleted));
        self.state = BlockState::Chg;
        self.hash = Digest::zero();
        self.bad = false;
    }

    /// Copy-detection: reuse a known-good hash from a source file
    /// instead of re-hashing.
    pub fn allocate_rep(&mut self, hash: Digest) {
        debug_assert_eq!(self.state, BlockState::Chg);
        self.state = BlockState::Rep;
        self.hash = hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_allocation_starts_chg() {
        let mut b = Block::empty(3);
        b.allocate_chg();
        assert_eq!(b.state, BlockState::Chg);
        assert!(b.hash.is_zero());
    }

    #[test]
    fn sync_transitions_chg_to_blk_and_clears_bad() {
        let mut b = Block::new_chg(0);
        b.bad = true;
        let h = Digest([1; 16]);
        b.mark_synced(h);
        assert_eq!(b.state, BlockState::Blk);
        assert_eq!(b.hash, h);
        assert!(!b.bad);
    }

    #[test]
    fn removal_then_resync_erases_tombstone() {
        let mut b = Block::new_chg(0);
        b.mark_synced(Digest([2; 16]));
        b.mark_deleted();
        assert_eq!(b.state, BlockState::Deleted);
        b.erase_tombstone();
        assert_eq!(b.state, BlockState::Empty);
        assert!(b.hash.is_zero());
    }

    #[test]
    fn copy_detection_reuses_hash_until_sync_confirms() {
        let mut b = Block::new_chg(0);
        let h = Digest([9; 16]);
        b.allocate_rep(h);
        assert_eq!(b.state, BlockState::Rep);
        assert_eq!(b.hash, h);
        b.mark_synced(h);
        assert_eq!(b.state, BlockState::Blk);
    }

    #[test]
    fn is_file_backed_excludes_empty_and_deleted() {
        assert!(!BlockState::Empty.is_file_backed());
        assert!(!BlockState::Deleted.is_file_backed());
        assert!(BlockState::Chg.is_file_backed());
        assert!(BlockState::Rep.is_file_backed());
        assert!(BlockState::Blk.is_file_backed());
    }
}
