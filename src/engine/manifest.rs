//! Content manifest I/O: a tag-length-value binary stream, written
//! tee'd to N redundant copies with a trailing CRC32C, read back with a
//! fatal check on CRC mismatch or unknown tag.

use crate::engine::disk::{Dir, DeletedTombstone, Disk, File, Link, LinkKind};
use crate::engine::block::{Block, BlockState};
use crate::engine::hash::{Algorithm, Digest, Seed, HASH_SIZE};
use crate::engine::varint::{read_str, read_u32, read_u64, write_str, write_u32, write_u64};
use crc::{Crc, CRC_32_ISCSI};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 16] = b"SNAPCNT1\n\x03\0\0\0\0\0\0\0";
const FORMAT_VERSION: u8 = 1;

const TAG_DISK: &[u8; 4] = b"disk";
const TAG_FILE: &[u8; 4] = b"file";
const TAG_FILD: &[u8; 4] = b"fild";
const TAG_BLKK: &[u8; 4] = b"blkk";
const TAG_LINK: &[u8; 4] = b"link";
const TAG_DIR: &[u8; 4] = b"dir ";
const TAG_INF: &[u8; 4] = b"inf ";
const TAG_PAR: &[u8; 4] = b"par ";
const TAG_END: &[u8; 4] = b"end ";

fn crc32c(data: &[u8]) -> u32 {
    const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    CRC.checksum(data)
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("manifest has bad magic header")]
    BadMagic,
    #[error("manifest version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("manifest CRC mismatch: stored {stored:08x}, computed {computed:08x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("manifest contains unknown record tag {0:?}")]
    UnknownTag([u8; 4]),
    #[error("double-CRC verification disagreed before flush: {first:08x} vs {second:08x}")]
    DoubleCrcDisagreement { first: u32, second: u32 },
    #[error("file record referenced a parent file path not yet defined: {0}")]
    DanglingFileReference(PathBuf),
    #[error("parity_sign mismatch: this content manifest was not written for the configured parity set")]
    ParitySignMismatch,
}

type Result<T> = std::result::Result<T, ManifestError>;

fn write_zigzag(w: &mut impl Write, value: i64) -> io::Result<()> {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    write_u64(w, zigzag)
}

fn read_zigzag(r: &mut impl Read) -> io::Result<i64> {
    let zigzag = read_u64(r)?;
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

pub struct InfoEntry {
    pub last_scrub_time: i64,
    pub rehash: bool,
    pub bad: bool,
}

pub struct SplitDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub valid_size: u64,
}

pub struct ParityDescriptor {
    pub level: u8,
    pub uuid: uuid::Uuid,
    pub splits: Vec<SplitDescriptor>,
}

/// The totality of on-disk state: disks, parity descriptors, info
/// vector, block size, and hash algorithm identity.
pub struct Manifest {
    pub algorithm: Algorithm,
    pub seed: Seed,
    pub block_size: u32,
    /// Derived from the parity descriptors' UUIDs at first sync and
    /// verified (never regenerated) on every later load, so a content
    /// manifest copy can't silently get paired with the wrong parity
    /// set.
    pub parity_sign: [u8; 16],
    pub disks: Vec<Disk>,
    pub info: Vec<InfoEntry>,
    pub parities: Vec<ParityDescriptor>,
}

/// Derive the manifest's `parity_sign` from its parity descriptors'
/// UUIDs, in level order. Only the UUIDs feed the sign: split paths and
/// sizes are allowed to change (a split can be moved or resized)
/// without invalidating it.
pub fn compute_parity_sign(parities: &[ParityDescriptor]) -> [u8; 16] {
    let mut bytes = Vec::with_capacity(parities.len() * 16);
    for p in parities {
        bytes.extend_from_slice(p.uuid.as_bytes());
    }
    crate::engine::hash::digest(Algorithm::Murmur3_128, Seed::default(), &bytes).0
}

fn write_block(w: &mut impl Write, b: &Block) -> io::Result<()> {
    let state = match b.state {
        BlockState::Empty => 0u8,
        BlockState::Chg => 1,
        BlockState::Rep => 2,
        BlockState::Blk => 3,
        BlockState::Deleted => 4,
    };
    w.write_all(&[state])?;
    w.write_all(&b.hash.0)?;
    write_u32(w, b.parity_pos)?;
    w.write_all(&[b.bad as u8])
}

fn read_block(r: &mut impl Read) -> io::Result<Block> {
    let mut state_byte = [0u8; 1];
    r.read_exact(&mut state_byte)?;
    let state = match state_byte[0] {
        0 => BlockState::Empty,
        1 => BlockState::Chg,
        2 => BlockState::Rep,
        3 => BlockState::Blk,
        4 => BlockState::Deleted,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown block state tag {other}"),
            ))
        }
    };
    let mut hash = [0u8; HASH_SIZE];
    r.read_exact(&mut hash)?;
    let parity_pos = read_u32(r)?;
    let mut bad_byte = [0u8; 1];
    r.read_exact(&mut bad_byte)?;
    Ok(Block {
        state,
        hash: Digest(hash),
        parity_pos,
        bad: bad_byte[0] != 0,
    })
}

/// Everything a serialized manifest needs besides the disks themselves,
/// borrowed rather than owned so a caller holding only `&mut [Disk]`
/// (the sync engine's periodic autosave callback, notably) can still
/// flush a complete manifest.
pub struct ManifestHeader<'a> {
    pub algorithm: Algorithm,
    pub seed: Seed,
    pub block_size: u32,
    pub parity_sign: [u8; 16],
    pub info: &'a [InfoEntry],
    pub parities: &'a [ParityDescriptor],
}

impl<'a> ManifestHeader<'a> {
    pub fn of(m: &'a Manifest) -> Self {
        Self {
            algorithm: m.algorithm,
            seed: m.seed,
            block_size: m.block_size,
            parity_sign: m.parity_sign,
            info: &m.info,
            parities: &m.parities,
        }
    }
}

fn serialize_parts(h: &ManifestHeader, disks: &[Disk]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_all(MAGIC)?;
    buf.write_all(&[FORMAT_VERSION])?;
    buf.write_all(&[match h.algorithm {
        Algorithm::Murmur3_128 => 0u8,
        Algorithm::Metro128 => 1u8,
    }])?;
    buf.write_all(&h.seed.0)?;
    write_u32(&mut buf, h.block_size)?;
    buf.write_all(&h.parity_sign)?;

    for disk in disks {
        buf.write_all(TAG_DISK)?;
        write_str(&mut buf, &disk.name)?;
        write_str(&mut buf, &disk.mount_point.to_string_lossy())?;
        buf.write_all(disk.uuid.as_bytes())?;

        for (_, file) in disk.files() {
            buf.write_all(TAG_FILE)?;
            write_str(&mut buf, &file.path.to_string_lossy())?;
            write_u64(&mut buf, file.size)?;
            write_zigzag(&mut buf, file.mtime_sec)?;
            write_u32(&mut buf, file.mtime_nsec)?;
            write_u64(&mut buf, file.inode)?;
            write_u32(&mut buf, file.blocks.len() as u32)?;
            for b in &file.blocks {
                write_block(&mut buf, b)?;
            }
        }

        for tomb in &disk.tombstones {
            buf.write_all(TAG_FILD)?;
            write_str(&mut buf, &tomb.path.to_string_lossy())?;
            write_u32(&mut buf, tomb.blocks.len() as u32)?;
            for (b, &pos) in tomb.blocks.iter().zip(tomb.positions.iter()) {
                write_block(&mut buf, b)?;
                write_u32(&mut buf, pos)?;
            }
        }

        for extent in disk.extents.iter_by_parity() {
            let file_path = disk
                .file(extent.file)
                .map(|f| f.path.clone())
                .unwrap_or_default();
            buf.write_all(TAG_BLKK)?;
            write_u32(&mut buf, extent.parity_pos)?;
            write_str(&mut buf, &file_path.to_string_lossy())?;
            write_u32(&mut buf, extent.file_pos)?;
            write_u32(&mut buf, extent.count)?;
        }

        for link in &disk.links {
            buf.write_all(TAG_LINK)?;
            write_str(&mut buf, &link.sub.to_string_lossy())?;
            write_str(&mut buf, &link.linkto)?;
            let kind = match link.kind {
                LinkKind::Symlink => 0u8,
                LinkKind::Hardlink => 1u8,
            };
            buf.write_all(&[kind])?;
        }

        for dir in &disk.dirs {
            buf.write_all(TAG_DIR)?;
            write_str(&mut buf, &dir.sub.to_string_lossy())?;
        }
    }

    buf.write_all(TAG_INF)?;
    write_u32(&mut buf, h.info.len() as u32)?;
    for entry in h.info {
        write_zigzag(&mut buf, entry.last_scrub_time)?;
        buf.write_all(&[entry.rehash as u8, entry.bad as u8])?;
    }

    for parity in h.parities {
        buf.write_all(TAG_PAR)?;
        buf.write_all(&[parity.level])?;
        buf.write_all(parity.uuid.as_bytes())?;
        write_u32(&mut buf, parity.splits.len() as u32)?;
        for split in &parity.splits {
            write_str(&mut buf, &split.path.to_string_lossy())?;
            write_u64(&mut buf, split.size)?;
            write_u64(&mut buf, split.valid_size)?;
        }
    }

    buf.write_all(TAG_END)?;
    Ok(buf)
}

fn serialize(m: &Manifest) -> io::Result<Vec<u8>> {
    serialize_parts(&ManifestHeader::of(m), &m.disks)
}

/// Double-CRC the buffer and tee-write it to every path in `paths`,
/// atomically via a `.tmp` rename. Computing the CRC32C twice
/// independently — once over the freshly serialized buffer, once over a
/// second pass after it has been handed off — catches memory corruption
/// between generation and flush.
fn flush(paths: &[impl AsRef<Path>], mut buf: Vec<u8>) -> Result<()> {
    let first_crc = crc32c(&buf);
    let handoff = buf.clone();
    let second_crc = crc32c(&handoff);
    if first_crc != second_crc {
        return Err(ManifestError::DoubleCrcDisagreement {
            first: first_crc,
            second: second_crc,
        });
    }
    buf.extend_from_slice(&first_crc.to_le_bytes());

    for path in paths {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&buf)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
    }
    Ok(())
}

/// Write the manifest to every path in `paths`, tee'd so every copy is
/// byte-identical.
pub fn write_manifest(paths: &[impl AsRef<Path>], manifest: &Manifest) -> Result<()> {
    flush(paths, serialize(manifest)?)
}

/// Write a manifest built from a header plus a disk slice the caller
/// only holds by `&mut` (or `&`) reference, without needing to own a
/// `Manifest`. Used by the sync engine's periodic autosave, which is
/// handed `&mut [Disk]` and nothing else.
pub fn write_manifest_parts(
    paths: &[impl AsRef<Path>],
    header: &ManifestHeader,
    disks: &[Disk],
) -> Result<()> {
    flush(paths, serialize_parts(header, disks)?)
}

/// Verify that a loaded manifest's `parity_sign` still matches its own
/// parity descriptors. Never regenerates the sign — a mismatch means
/// the content file and the parity set have drifted apart and is a
/// fatal structural inconsistency.
pub fn verify_parity_sign(m: &Manifest) -> Result<()> {
    if m.parity_sign != compute_parity_sign(&m.parities) {
        return Err(ManifestError::ParitySignMismatch);
    }
    Ok(())
}

/// Read and validate a single manifest copy, rejecting CRC mismatches
/// and unknown tags as fatal structural errors.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < MAGIC.len() + 4 {
        return Err(ManifestError::BadMagic);
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    let computed_crc = crc32c(body);
    if stored_crc != computed_crc {
        return Err(ManifestError::CrcMismatch {
            stored: stored_crc,
            computed: computed_crc,
        });
    }

    let mut cur = Cursor::new(body);
    let mut magic = [0u8; 16];
    cur.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ManifestError::BadMagic);
    }
    let mut version = [0u8; 1];
    cur.read_exact(&mut version)?;
    if version[0] != FORMAT_VERSION {
        return Err(ManifestError::UnsupportedVersion(version[0]));
    }
    let mut algo_byte = [0u8; 1];
    cur.read_exact(&mut algo_byte)?;
    let algorithm = match algo_byte[0] {
        0 => Algorithm::Murmur3_128,
        1 => Algorithm::Metro128,
        other => return Err(ManifestError::UnknownTag([other, 0, 0, 0])),
    };
    let mut seed = [0u8; 16];
    cur.read_exact(&mut seed)?;
    let block_size = read_u32(&mut cur)?;
    let mut parity_sign = [0u8; 16];
    cur.read_exact(&mut parity_sign)?;

    let mut disks: Vec<Disk> = Vec::new();
    let mut info = Vec::new();
    let mut parities = Vec::new();

    loop {
        let mut tag = [0u8; 4];
        cur.read_exact(&mut tag)?;
        match &tag {
            t if t == TAG_DISK => {
                let name = read_str(&mut cur)?;
                let mount_point = PathBuf::from(read_str(&mut cur)?);
                let mut uuid_bytes = [0u8; 16];
                cur.read_exact(&mut uuid_bytes)?;
                disks.push(Disk::new(name, mount_point, uuid::Uuid::from_bytes(uuid_bytes)));
            }
            t if t == TAG_FILE => {
                let disk = disks.last_mut().ok_or_else(|| {
                    ManifestError::DanglingFileReference(PathBuf::from("<no disk>"))
                })?;
                let path = PathBuf::from(read_str(&mut cur)?);
                let size = read_u64(&mut cur)?;
                let mtime_sec = read_zigzag(&mut cur)?;
                let mtime_nsec = read_u32(&mut cur)?;
                let inode = read_u64(&mut cur)?;
                let block_count = read_u32(&mut cur)?;
                let mut blocks = Vec::with_capacity(block_count as usize);
                for _ in 0..block_count {
                    blocks.push(read_block(&mut cur)?);
                }
                let mut file = File::new(path, size, mtime_sec, mtime_nsec, inode, block_size as u64);
                file.blocks = blocks;
                disk.insert_file(file);
            }
            t if t == TAG_FILD => {
                let disk = disks.last_mut().ok_or_else(|| {
                    ManifestError::DanglingFileReference(PathBuf::from("<no disk>"))
                })?;
                let path = PathBuf::from(read_str(&mut cur)?);
                let block_count = read_u32(&mut cur)?;
                let mut blocks = Vec::with_capacity(block_count as usize);
                let mut positions = Vec::with_capacity(block_count as usize);
                for _ in 0..block_count {
                    blocks.push(read_block(&mut cur)?);
                    positions.push(read_u32(&mut cur)?);
                }
                disk.tombstones.push(DeletedTombstone {
                    path,
                    blocks,
                    positions,
                });
            }
            t if t == TAG_BLKK => {
                let disk = disks.last_mut().ok_or_else(|| {
                    ManifestError::DanglingFileReference(PathBuf::from("<no disk>"))
                })?;
                let parity_pos = read_u32(&mut cur)?;
                let file_path = PathBuf::from(read_str(&mut cur)?);
                let file_pos = read_u32(&mut cur)?;
                let count = read_u32(&mut cur)?;
                let file_id = disk
                    .file_by_path(&file_path)
                    .ok_or(ManifestError::DanglingFileReference(file_path))?;
                for i in 0..count {
                    disk.extents
                        .allocate(parity_pos + i, file_id, file_pos + i)
                        .map_err(|_| ManifestError::BadMagic)?;
                }
            }
            t if t == TAG_LINK => {
                let disk = disks.last_mut().ok_or_else(|| {
                    ManifestError::DanglingFileReference(PathBuf::from("<no disk>"))
                })?;
                let sub = PathBuf::from(read_str(&mut cur)?);
                let linkto = read_str(&mut cur)?;
                let mut kind_byte = [0u8; 1];
                cur.read_exact(&mut kind_byte)?;
                let kind = if kind_byte[0] == 0 {
                    LinkKind::Symlink
                } else {
                    LinkKind::Hardlink
                };
                disk.links.push(Link { sub, linkto, kind });
            }
            t if t == TAG_DIR => {
                let disk = disks.last_mut().ok_or_else(|| {
                    ManifestError::DanglingFileReference(PathBuf::from("<no disk>"))
                })?;
                let sub = PathBuf::from(read_str(&mut cur)?);
                disk.dirs.push(Dir { sub });
            }
            t if t == TAG_INF => {
                let count = read_u32(&mut cur)?;
                for _ in 0..count {
                    let last_scrub_time = read_zigzag(&mut cur)?;
                    let mut flags = [0u8; 2];
                    cur.read_exact(&mut flags)?;
                    info.push(InfoEntry {
                        last_scrub_time,
                        rehash: flags[0] != 0,
                        bad: flags[1] != 0,
                    });
                }
            }
            t if t == TAG_PAR => {
                let mut level_byte = [0u8; 1];
                cur.read_exact(&mut level_byte)?;
                let mut uuid_bytes = [0u8; 16];
                cur.read_exact(&mut uuid_bytes)?;
                let split_count = read_u32(&mut cur)?;
                let mut splits = Vec::with_capacity(split_count as usize);
                for _ in 0..split_count {
                    let path = PathBuf::from(read_str(&mut cur)?);
                    let size = read_u64(&mut cur)?;
                    let valid_size = read_u64(&mut cur)?;
                    splits.push(SplitDescriptor {
                        path,
                        size,
                        valid_size,
                    });
                }
                parities.push(ParityDescriptor {
                    level: level_byte[0],
                    uuid: uuid::Uuid::from_bytes(uuid_bytes),
                    splits,
                });
            }
            t if t == TAG_END => break,
            other => return Err(ManifestError::UnknownTag(*other)),
        }
    }

    Ok(Manifest {
        algorithm,
        seed: Seed(seed),
        block_size,
        parity_sign,
        disks,
        info,
        parities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_manifest() -> Manifest {
        let mut disk = Disk::new("d1", PathBuf::from("/mnt/d1"), uuid::Uuid::nil());
        let mut file = File::new(PathBuf::from("a.txt"), 10, 100, 200, 1, 65536);
        file.blocks[0].allocate_chg();
        file.blocks[0].mark_synced(Digest([7; 16]));
        let fid = disk.insert_file(file);
        disk.extents.allocate(0, fid, 0).unwrap();
        disk.links.push(Link {
            sub: PathBuf::from("l"),
            linkto: "a.txt".to_string(),
            kind: LinkKind::Symlink,
        });
        disk.dirs.push(Dir {
            sub: PathBuf::from("subdir"),
        });

        Manifest {
            algorithm: Algorithm::Metro128,
            seed: Seed([3; 16]),
            block_size: 65536,
            parity_sign: compute_parity_sign(&[ParityDescriptor {
                level: 0,
                uuid: uuid::Uuid::nil(),
                splits: vec![],
            }]),
            disks: vec![disk],
            info: vec![InfoEntry {
                last_scrub_time: 123456,
                rehash: false,
                bad: false,
            }],
            parities: vec![ParityDescriptor {
                level: 0,
                uuid: uuid::Uuid::nil(),
                splits: vec![SplitDescriptor {
                    path: PathBuf::from("/parity/p0"),
                    size: 65536,
                    valid_size: 65536,
                }],
            }],
        }
    }

    #[test]
    fn roundtrip_through_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let manifest = sample_manifest();
        write_manifest(&[&path], &manifest).unwrap();
        let loaded = read_manifest(&path).unwrap();
        assert_eq!(loaded.block_size, 65536);
        assert_eq!(loaded.disks.len(), 1);
        assert_eq!(loaded.disks[0].name, "d1");
        let (_, f) = loaded.disks[0].files().next().unwrap();
        assert_eq!(f.path, PathBuf::from("a.txt"));
        assert_eq!(f.blocks[0].state, BlockState::Blk);
        assert_eq!(loaded.disks[0].links.len(), 1);
        assert_eq!(loaded.disks[0].dirs.len(), 1);
        assert_eq!(loaded.info.len(), 1);
        assert_eq!(loaded.parities.len(), 1);
    }

    #[test]
    fn serialize_twice_is_byte_identical() {
        let manifest = sample_manifest();
        let first = serialize(&manifest).unwrap();
        let second = serialize(&manifest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parity_sign_matches_its_own_descriptors() {
        let manifest = sample_manifest();
        assert!(verify_parity_sign(&manifest).is_ok());
    }

    #[test]
    fn parity_sign_mismatch_is_rejected() {
        let mut manifest = sample_manifest();
        manifest.parities[0].uuid = uuid::Uuid::from_u128(1);
        assert!(matches!(
            verify_parity_sign(&manifest),
            Err(ManifestError::ParitySignMismatch)
        ));
    }

    #[test]
    fn corrupted_trailer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        write_manifest(&[&path], &sample_manifest()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_manifest(&path),
            Err(ManifestError::CrcMismatch { .. })
        ));
    }
}
