//! End-to-end scenarios run against the real engine: actual files under
//! a temp directory, actual parity files on disk, no mocked backend.

use parisync::config::{Config, DiskConfig, ParityConfig};
use parisync::Array;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Harness {
    _root: TempDir,
    content: PathBuf,
    disks: Vec<PathBuf>,
    parity: PathBuf,
}

fn harness(n_disks: usize) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut disks = Vec::new();
    for i in 0..n_disks {
        let d = root.path().join(format!("disk{i}"));
        fs::create_dir_all(&d).unwrap();
        disks.push(d);
    }
    let parity_dir = root.path().join("parity");
    fs::create_dir_all(&parity_dir).unwrap();
    let content = root.path().join("content.bin");
    Harness {
        parity: parity_dir.join("p0"),
        content,
        disks,
        _root: root,
    }
}

impl Harness {
    fn config(&self, block_size: u32) -> Config {
        Config {
            block_size,
            autosave_interval_bytes: 1024 * 1024 * 1024,
            io_error_limit: 100,
            algorithm: "murmur3".to_string(),
            scrub_percentage: 100.0,
            scrub_older_than_days: 0,
            content: vec![self.content.clone()],
            disk: self
                .disks
                .iter()
                .enumerate()
                .map(|(i, path)| DiskConfig {
                    name: format!("d{i}"),
                    mount_point: path.clone(),
                })
                .collect(),
            parity: vec![ParityConfig {
                level: 0,
                splits: vec![self.parity.clone()],
            }],
            smartctl: None,
        }
    }

    fn open(&self, block_size: u32) -> Array {
        Array::open(self.config(block_size)).unwrap()
    }
}

#[test]
fn s1_empty_array_sync() {
    let h = harness(2);
    let mut array = h.open(65536);

    let report = array.sync(1_700_000_000).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.columns_processed, 0);

    assert_eq!(fs::metadata(&h.parity).unwrap().len(), 0);
    assert!(array.manifest.disks.iter().all(|d| d.files().count() == 0));
}

#[test]
fn s2_single_block_write_sync_then_scrub() {
    // A single data disk keeps the parity arithmetic an identity
    // mapping (first-level coefficient 1), so parity bytes can be
    // compared directly against the source file's bytes.
    let h = harness(1);
    fs::write(h.disks[0].join("hello.txt"), b"hello\n!!!").unwrap();

    let mut array = h.open(65536);
    let report = array.sync(1_700_000_000).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.columns_processed, 1);

    let parity_bytes = fs::read(&h.parity).unwrap();
    assert_eq!(parity_bytes.len(), 65536);
    assert_eq!(&parity_bytes[0..9], b"hello\n!!!");
    assert!(parity_bytes[9..].iter().all(|&b| b == 0));

    let now = 1_700_000_000;
    let scrub_report = array.scrub(100.0, 0, now).unwrap();
    assert!(scrub_report.is_clean());
    assert_eq!(array.manifest.info[0].last_scrub_time, now);
    assert!(!array.manifest.info[0].bad);
}

#[test]
fn s3_silent_corruption_detected_then_fixed() {
    let h = harness(1);
    let path = h.disks[0].join("hello.txt");
    fs::write(&path, b"hello\n!!!").unwrap();

    let mut array = h.open(65536);
    array.sync(1_700_000_000).unwrap();

    // Flip byte 0 in place without touching mtime/size, simulating bit
    // rot rather than an edit scan would notice.
    let mut bytes = fs::read(&path).unwrap();
    let before = bytes[0];
    bytes[0] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let scrub_report = array.scrub(100.0, 0, 1_700_000_000).unwrap();
    assert!(!scrub_report.is_clean());
    assert_eq!(scrub_report.silent_errors, 1);
    assert!(array.manifest.info[0].bad);

    let positions = array.fix_positions(&[], true, &[]);
    let fix_report = array.fix(&positions).unwrap();
    assert_eq!(fix_report.columns_unrecoverable, 0);

    let restored = fs::read(&path).unwrap();
    assert_eq!(restored[0], before);
}

#[test]
fn s4_file_moved_on_same_disk() {
    let h = harness(2);
    fs::write(h.disks[0].join("a.txt"), b"some content here").unwrap();

    let mut array = h.open(65536);
    array.sync(1_700_000_000).unwrap();

    fs::rename(h.disks[0].join("a.txt"), h.disks[0].join("b.txt")).unwrap();

    let summary = array.diff().unwrap();
    assert_eq!(summary.moved, 1);
    assert_eq!(summary.equal, 0);
    assert_eq!(summary.added, 0);

    let disk = &array.manifest.disks[0];
    assert!(disk.file_by_path(&PathBuf::from("b.txt")).is_some());
    assert!(disk.file_by_path(&PathBuf::from("a.txt")).is_none());
}

#[test]
fn s5_file_copied_across_disks() {
    let h = harness(2);
    let data = vec![7u8; 130_000];
    fs::write(h.disks[0].join("big.bin"), &data).unwrap();

    let mut array = h.open(65536);
    array.sync(1_700_000_000).unwrap();

    let src_meta = fs::metadata(h.disks[0].join("big.bin")).unwrap();
    fs::write(h.disks[1].join("big.bin"), &data).unwrap();
    filetime_copy(&src_meta, &h.disks[1].join("big.bin"));

    let summary = array.scan();
    assert_eq!(summary.copied, 1);

    // blocks start as REP (copy-detected hash, parity not yet updated).
    {
        let disk1 = &array.manifest.disks[1];
        let fid = disk1.file_by_path(&PathBuf::from("big.bin")).unwrap();
        let file = disk1.file(fid).unwrap();
        assert!(file
            .blocks
            .iter()
            .all(|b| b.state == parisync::engine::block::BlockState::Rep));
    }

    let report = array.sync(1_700_000_000).unwrap();
    assert!(report.is_clean());

    let disk1 = &array.manifest.disks[1];
    let fid = disk1.file_by_path(&PathBuf::from("big.bin")).unwrap();
    let file = disk1.file(fid).unwrap();
    assert!(file
        .blocks
        .iter()
        .all(|b| b.state == parisync::engine::block::BlockState::Blk));
}

/// Force disk 2's copy to share disk 1's exact mtime, the way a
/// bit-identical filesystem copy normally would (`fs::write` alone
/// stamps a fresh mtime).
fn filetime_copy(src: &fs::Metadata, dst: &PathBuf) {
    use std::os::unix::fs::MetadataExt;
    let atime = std::time::UNIX_EPOCH + std::time::Duration::new(src.atime() as u64, src.atime_nsec() as u32);
    let mtime = std::time::UNIX_EPOCH + std::time::Duration::new(src.mtime() as u64, src.mtime_nsec() as u32);
    let times = fs::FileTimes::new().set_accessed(atime).set_modified(mtime);
    fs::File::options()
        .write(true)
        .open(dst)
        .unwrap()
        .set_times(times)
        .unwrap();
}

#[test]
fn s6_reopen_after_sync_is_stable() {
    // Not a literal crash simulation (nothing here can kill the process
    // mid-write), but it exercises the same recovery path: a fresh
    // `Array` reloads the just-written manifest and parity, and a
    // second sync over unchanged data finds nothing left to do.
    let h = harness(2);
    for i in 0..10 {
        fs::write(h.disks[0].join(format!("f{i}.bin")), vec![i as u8; 9000]).unwrap();
    }

    let mut array = h.open(65536);
    let first = array.sync(1_700_000_000).unwrap();
    assert!(first.is_clean());
    assert_eq!(first.columns_processed, 10);

    let mut reopened = h.open(65536);
    let second = reopened.sync(1_700_000_000).unwrap();
    assert!(second.is_clean());
    assert_eq!(second.columns_processed, 0);
}
