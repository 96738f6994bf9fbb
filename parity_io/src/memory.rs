use crate::{Result, SplitBackend};

/// An in-memory split backend used by unit and property tests so the
/// parity handle logic can be exercised without touching a real
/// filesystem.
pub struct MemorySplit {
    buf: Vec<u8>,
}

impl MemorySplit {
    pub fn new(size: u64) -> Self {
        Self {
            buf: vec![0u8; size as usize],
        }
    }
}

impl SplitBackend for MemorySplit {
    fn size(&self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        self.buf.resize(size as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self.buf[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        self.buf[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_then_write_read() {
        let mut m = MemorySplit::new(0);
        m.resize(64).unwrap();
        m.write_at(0, &[5u8; 64]).unwrap();
        let mut out = [0u8; 64];
        m.read_at(0, &mut out).unwrap();
        assert_eq!(out, [5u8; 64]);
    }
}
