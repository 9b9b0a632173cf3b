//! Variable-width address and length fields.
//!
//! Addresses and lengths are stored little-endian in 2, 4 or 8 bytes, as
//! chosen by the file's size-of-offsets and size-of-lengths.  An address of
//! all one bits in its width is the undefined sentinel.

use std::io::{self, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Serialize, Deserialize};

use crate::error::{FileError, Result};
use crate::medium::{addr_defined, ADDR_UNDEF};

/// Widths of the file's address and length fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizes {
    pub addr: u8,
    pub len:  u8,
}

impl Sizes {
    pub fn new(addr: u8, len: u8) -> Result<Self> {
        check_width("size-of-offsets", addr)?;
        check_width("size-of-lengths", len)?;
        Ok(Self { addr, len })
    }
}

impl Default for Sizes {
    fn default() -> Self {
        Self { addr: 8, len: 8 }
    }
}

fn check_width(field: &'static str, width: u8) -> Result<()> {
    match width {
        2 | 4 | 8 => Ok(()),
        _ => Err(FileError::BadFieldWidth { field, width }),
    }
}

#[inline]
fn all_ones(width: u8) -> u64 {
    if width >= 8 { u64::MAX } else { (1u64 << (width as u32 * 8)) - 1 }
}

pub(crate) fn write_addr<W: Write>(w: &mut W, addr: u64, width: u8) -> Result<()> {
    let raw = if addr_defined(addr) {
        // The all-ones pattern is reserved for the sentinel.
        if addr >= all_ones(width) {
            return Err(FileError::FieldOverflow { value: addr, width });
        }
        addr
    } else {
        all_ones(width)
    };
    w.write_uint::<LittleEndian>(raw, width as usize)?;
    Ok(())
}

pub(crate) fn read_addr<R: Read>(r: &mut R, width: u8) -> io::Result<u64> {
    let raw = r.read_uint::<LittleEndian>(width as usize)?;
    Ok(if raw == all_ones(width) { ADDR_UNDEF } else { raw })
}

pub(crate) fn write_len<W: Write>(w: &mut W, len: u64, width: u8) -> Result<()> {
    if len > all_ones(width) {
        return Err(FileError::FieldOverflow { value: len, width });
    }
    w.write_uint::<LittleEndian>(len, width as usize)?;
    Ok(())
}

pub(crate) fn read_len<R: Read>(r: &mut R, width: u8) -> io::Result<u64> {
    r.read_uint::<LittleEndian>(width as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn undefined_uses_full_width_sentinel() {
        let mut buf = Vec::new();
        write_addr(&mut buf, ADDR_UNDEF, 4).unwrap();
        assert_eq!(buf, [0xFF; 4]);
        assert_eq!(read_addr(&mut Cursor::new(&buf), 4).unwrap(), ADDR_UNDEF);
    }

    #[test]
    fn narrow_address_overflow_is_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_addr(&mut buf, 0x1_0000, 2),
            Err(FileError::FieldOverflow { value: 0x1_0000, width: 2 })
        ));
    }

    #[test]
    fn odd_widths_are_rejected() {
        assert!(Sizes::new(8, 8).is_ok());
        assert!(matches!(Sizes::new(3, 8), Err(FileError::BadFieldWidth { width: 3, .. })));
        assert!(matches!(Sizes::new(8, 16), Err(FileError::BadFieldWidth { width: 16, .. })));
    }
}
