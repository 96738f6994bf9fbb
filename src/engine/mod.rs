//! The parity-and-metadata engine: data model, manifest codec, RAID
//! codec, pipelined scheduler, and the sync/scrub/fix/scan operations
//! built on top of them.

pub mod allocate;
pub mod block;
pub mod disk;
pub mod extent;
pub mod fix;
pub mod hash;
pub mod io_sources;
pub mod manifest;
pub mod raid;
pub mod scan;
pub mod scheduler;
pub mod scrub;
pub mod sync;
pub mod varint;

pub use allocate::allocate_disk;
pub use block::{Block, BlockState};
pub use disk::{Dir, Disk, DeletedTombstone, File, FileId, Link, LinkKind};
pub use extent::{Extent, ExtentError, ExtentId, ExtentMap};
pub use hash::{Algorithm, Digest, Seed};
pub use manifest::{
    compute_parity_sign, read_manifest, verify_parity_sign, write_manifest, write_manifest_parts,
    InfoEntry, Manifest, ManifestError, ManifestHeader, ParityDescriptor, SplitDescriptor,
};
