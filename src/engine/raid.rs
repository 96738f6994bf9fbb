//! RAID codec: `raid_gen` and `raid_rec`. The engine treats the coding
//! theory as a black box behind a fixed signature; this module supplies
//! a Cauchy Reed-Solomon codec over GF(256) behind that signature, so
//! any `parity_level` up to the field's limits is supported rather than
//! hard-coding XOR-only RAID 4.

use std::sync::OnceLock;
use thiserror::Error;

const POLY: u16 = 0x11d;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    })
}

fn gmul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    let s = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[s]
}

fn ginv(a: u8) -> u8 {
    assert!(a != 0, "GF(256) inverse of zero is undefined");
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaidError {
    #[error("{failed} failed blocks exceed parity_level {parity_level}, column unrecoverable")]
    TooManyFailures { failed: usize, parity_level: usize },
    #[error("buffer count {got} does not match disk_count + parity_level ({want})")]
    BufferCountMismatch { got: usize, want: usize },
    #[error("block size mismatch: expected {expected}, got {got}")]
    BlockSizeMismatch { expected: usize, got: usize },
}

/// Row `row` (0-indexed within `0..disk_count + parity_level`) of the
/// `(disk_count + parity_level) x disk_count` Cauchy generator matrix.
/// Rows `0..disk_count` are the identity (data passes through
/// unchanged); rows `disk_count..` are Cauchy rows `1 / (col xor row)`,
/// chosen so that `col` ranges over `0..disk_count` and `row` ranges
/// over `disk_count..disk_count+parity_level` — disjoint domains, which
/// guarantees every square submatrix of the full generator is
/// invertible (the standard Cauchy-matrix erasure-coding property).
fn generator_row(disk_count: usize, row: usize) -> Vec<u8> {
    let mut out = vec![0u8; disk_count];
    if row < disk_count {
        out[row] = 1;
        return out;
    }
    for col in 0..disk_count {
        let x = (col as u16) ^ (row as u16);
        out[col] = ginv(x as u8);
    }
    out
}

fn check_buffers(disk_count: usize, parity_level: usize, buffers: &[Vec<u8>]) -> Result<usize, RaidError> {
    let want = disk_count + parity_level;
    if buffers.len() != want {
        return Err(RaidError::BufferCountMismatch {
            got: buffers.len(),
            want,
        });
    }
    let block_size = buffers[0].len();
    for b in buffers {
        if b.len() != block_size {
            return Err(RaidError::BlockSizeMismatch {
                expected: block_size,
                got: b.len(),
            });
        }
    }
    Ok(block_size)
}

/// Compute parity for a column: `buffers[0..disk_count]` are data
/// (input), `buffers[disk_count..disk_count+parity_level]` are
/// overwritten with the computed parity.
pub fn raid_gen(
    disk_count: usize,
    parity_level: usize,
    buffers: &mut [Vec<u8>],
) -> Result<(), RaidError> {
    let block_size = check_buffers(disk_count, parity_level, buffers)?;
    for p in 0..parity_level {
        let row = generator_row(disk_count, disk_count + p);
        let mut out = vec![0u8; block_size];
        for (col, &coeff) in row.iter().enumerate() {
            if coeff == 0 {
                continue;
            }
            let data = &buffers[col];
            for i in 0..block_size {
                out[i] ^= gmul(coeff, data[i]);
            }
        }
        buffers[disk_count + p] = out;
    }
    Ok(())
}

/// Invert the `n x n` matrix `a` (row-major, entries in GF(256)) via
/// Gauss-Jordan elimination, returning `None` if singular.
fn invert(mut a: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let n = a.len();
    let mut inv: Vec<Vec<u8>> = (0..n)
        .map(|i| {
            let mut row = vec![0u8; n];
            row[i] = 1;
            row
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|&r| a[r][col] != 0)?;
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let inv_pivot = ginv(a[col][col]);
        for j in 0..n {
            a[col][j] = gmul(a[col][j], inv_pivot);
            inv[col][j] = gmul(inv[col][j], inv_pivot);
        }

        for r in 0..n {
            if r == col || a[r][col] == 0 {
                continue;
            }
            let factor = a[r][col];
            for j in 0..n {
                a[r][j] ^= gmul(factor, a[col][j]);
                inv[r][j] ^= gmul(factor, inv[col][j]);
            }
        }
    }
    Some(inv)
}

/// Recover the blocks in `failed` (indices into the combined
/// `0..disk_count+parity_level` numbering, data then parity) from the
/// surviving blocks in `buffers`. A no-op when `failed` is empty. Fails
/// with [`RaidError::TooManyFailures`] when `failed.len() >
/// parity_level`.
pub fn raid_rec(
    failed: &[usize],
    disk_count: usize,
    parity_level: usize,
    buffers: &mut [Vec<u8>],
) -> Result<(), RaidError> {
    if failed.is_empty() {
        return Ok(());
    }
    let block_size = check_buffers(disk_count, parity_level, buffers)?;
    if failed.len() > parity_level {
        return Err(RaidError::TooManyFailures {
            failed: failed.len(),
            parity_level,
        });
    }

    let total = disk_count + parity_level;
    let available: Vec<usize> = (0..total).filter(|i| !failed.contains(i)).collect();
    let chosen = &available[..disk_count];

    let a: Vec<Vec<u8>> = chosen
        .iter()
        .map(|&row| generator_row(disk_count, row))
        .collect();
    let a_inv = invert(a).expect("Cauchy submatrices are always invertible");

    // Solve A * D = Y column-by-column (one GF(256) byte at a time).
    let mut data = vec![vec![0u8; block_size]; disk_count];
    for byte in 0..block_size {
        let y: Vec<u8> = chosen.iter().map(|&row| buffers[row][byte]).collect();
        for (d_row, inv_row) in data.iter_mut().zip(a_inv.iter()) {
            let mut acc = 0u8;
            for (coeff, &yi) in inv_row.iter().zip(y.iter()) {
                acc ^= gmul(*coeff, yi);
            }
            d_row[byte] = acc;
        }
    }

    for &row in failed {
        let gen = generator_row(disk_count, row);
        let mut out = vec![0u8; block_size];
        for (col, &coeff) in gen.iter().enumerate() {
            if coeff == 0 {
                continue;
            }
            for i in 0..block_size {
                out[i] ^= gmul(coeff, data[col][i]);
            }
        }
        buffers[row] = out;
    }
    Ok(())
}
