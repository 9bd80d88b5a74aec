//! Random-access reader over a GBA ROM image
//!
//! All pointers embedded in Krawall data are absolute GBA bus addresses in
//! the `0x08xxxxxx`/`0x09xxxxxx` range; the low 25 bits are the file offset.

use crate::error::{Error, Result};
use std::path::Path;

/// ROM region bit of a GBA cartridge address.
pub const REGION_BIT: u32 = 0x0800_0000;

/// Bits that are never set in a valid cartridge address.
pub const FOREIGN_BITS: u32 = 0xF600_0000;

/// Mask converting a cartridge address to a file offset.
pub const OFFSET_MASK: u32 = 0x01FF_FFFF;

/// Convert a cartridge address to a ROM file offset.
pub fn mask_offset(pointer: u32) -> u32 {
    pointer & OFFSET_MASK
}

/// Whether a word has the shape of a cartridge ROM address.
pub fn is_rom_pointer(pointer: u32) -> bool {
    pointer & REGION_BIT != 0 && pointer & FOREIGN_BITS == 0
}

/// An in-memory ROM image. Reads are bounds-checked and little-endian;
/// the image is never mutated.
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    /// Load a ROM image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Rom> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Rom(format!("{}: {}", path.display(), e)))?;
        Ok(Rom { data })
    }

    /// Wrap an in-memory image.
    pub fn from_bytes(data: Vec<u8>) -> Rom {
        Rom { data }
    }

    /// Image size in bytes.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Read a single byte.
    pub fn read_u8(&self, offset: u32) -> Result<u8> {
        self.data
            .get(offset as usize)
            .copied()
            .ok_or_else(|| Error::Rom(format!("read past end of ROM at {:#010X}", offset)))
    }

    pub fn read_i8(&self, offset: u32) -> Result<i8> {
        Ok(self.read_u8(offset)? as i8)
    }

    /// Read a 16-bit little-endian value.
    pub fn read_u16(&self, offset: u32) -> Result<u16> {
        let lo = self.read_u8(offset)? as u16;
        let hi = self.read_u8(offset + 1)? as u16;
        Ok(lo | (hi << 8))
    }

    /// Read a 32-bit little-endian value.
    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let lo = self.read_u16(offset)? as u32;
        let hi = self.read_u16(offset + 2)? as u32;
        Ok(lo | (hi << 16))
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start + len as usize;
        self.data
            .get(start..end)
            .ok_or_else(|| Error::Rom(format!("read past end of ROM at {:#010X}", offset)))
    }

    /// Everything from `offset` to the end of the image.
    pub fn tail(&self, offset: u32) -> &[u8] {
        self.data.get(offset as usize..).unwrap_or(&[])
    }

    /// Find the first occurrence of `needle` at or after `from`.
    pub fn find(&self, needle: &[u8], from: u32) -> Option<u32> {
        if needle.is_empty() || (from as usize) >= self.data.len() {
            return None;
        }
        self.data[from as usize..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|p| from + p as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_masking() {
        assert_eq!(mask_offset(0x0800_1234), 0x1234);
        assert_eq!(mask_offset(0x0900_0010), 0x0100_0010);
        assert!(is_rom_pointer(0x0800_0000));
        assert!(is_rom_pointer(0x09FF_FFFF));
        assert!(!is_rom_pointer(0x0000_1234));
        assert!(!is_rom_pointer(0x1800_0000));
        assert!(!is_rom_pointer(0x0A00_0000));
    }

    #[test]
    fn test_little_endian_reads() {
        let rom = Rom::from_bytes(vec![0x78, 0x56, 0x34, 0x12, 0xFF]);
        assert_eq!(rom.read_u8(0).unwrap(), 0x78);
        assert_eq!(rom.read_u16(0).unwrap(), 0x5678);
        assert_eq!(rom.read_u32(0).unwrap(), 0x1234_5678);
        assert_eq!(rom.read_i8(4).unwrap(), -1);
        assert!(rom.read_u32(2).is_err());
    }

    #[test]
    fn test_find() {
        let rom = Rom::from_bytes(b"abcKrawallxyzKrawall".to_vec());
        assert_eq!(rom.find(b"Krawall", 0), Some(3));
        assert_eq!(rom.find(b"Krawall", 4), Some(13));
        assert_eq!(rom.find(b"Missing", 0), None);
    }
}
