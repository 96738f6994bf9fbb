//! Continuation-bit varint encoding.
//!
//! Each byte contributes 7 bits, least-significant first. The byte with
//! the top bit set is the last byte of the value. This format is part of
//! the on-disk manifest layout and must stay bit-exact.

use std::io::{self, Read, Write};

/// Write `value` as a varint to `w`.
pub fn write_u64(w: &mut impl Write, mut value: u64) -> io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            byte |= 0x80;
            w.write_all(&[byte])?;
            return Ok(());
        }
        w.write_all(&[byte])?;
    }
}

pub fn write_u32(w: &mut impl Write, value: u32) -> io::Result<()> {
    write_u64(w, value as u64)
}

/// Read a varint-encoded value from `r`.
pub fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let b = byte[0];
        value |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 != 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint too long",
            ));
        }
    }
}

pub fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let value = read_u64(r)?;
    u32::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "varint overflows u32"))
}

/// Write a length-prefixed string (varint length, then raw UTF-8 bytes).
pub fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s.as_bytes())
}

pub fn read_str(r: &mut impl Read) -> io::Result<String> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_byte_values_fit_in_one_byte() {
        for v in 0u64..128 {
            let mut buf = Vec::new();
            write_u64(&mut buf, v).unwrap();
            assert_eq!(buf.len(), 1);
            assert_eq!(buf[0], v as u8 | 0x80);
        }
    }

    #[test]
    fn known_multi_byte_value() {
        // 300 = 0b1_0010_1100 -> low7=0101100=0x2c, high=10 -> last byte 0x82
        let mut buf = Vec::new();
        write_u64(&mut buf, 300).unwrap();
        assert_eq!(buf, vec![0x2c, 0x82]);
        let mut cur = std::io::Cursor::new(buf);
        assert_eq!(read_u64(&mut cur).unwrap(), 300);
    }

    proptest! {
        #[test]
        fn roundtrip_u64(v in any::<u64>()) {
            let mut buf = Vec::new();
            write_u64(&mut buf, v).unwrap();
            let mut cur = std::io::Cursor::new(buf);
            prop_assert_eq!(read_u64(&mut cur).unwrap(), v);
        }

        #[test]
        fn roundtrip_u32(v in any::<u32>()) {
            let mut buf = Vec::new();
            write_u32(&mut buf, v).unwrap();
            let mut cur = std::io::Cursor::new(buf);
            prop_assert_eq!(read_u32(&mut cur).unwrap(), v);
        }

        #[test]
        fn roundtrip_str(s in "[a-zA-Z0-9/_.-]{0,64}") {
            let mut buf = Vec::new();
            write_str(&mut buf, &s).unwrap();
            let mut cur = std::io::Cursor::new(buf);
            prop_assert_eq!(read_str(&mut cur).unwrap(), s);
        }
    }
}
