//! Positioned binary output
//!
//! Both tracker writers emit strictly in order but backpatch record sizes
//! after the fact, so the writer tracks its own position and patches via
//! seek without disturbing the append point.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub struct Out {
    file: File,
    pos: u64,
}

impl Out {
    /// Create the output file, truncating any existing one.
    pub fn create(path: &Path) -> Result<Out> {
        let file = File::create(path)
            .map_err(|_| Error::OutputOpen(path.display().to_string()))?;
        Ok(Out { file, pos: 0 })
    }

    /// Current write position.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    pub fn u8(&mut self, v: u8) -> Result<()> {
        self.bytes(&[v])
    }

    pub fn i8(&mut self, v: i8) -> Result<()> {
        self.bytes(&[v as u8])
    }

    pub fn u16(&mut self, v: u16) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    /// Write `n` zero bytes.
    pub fn zeros(&mut self, n: usize) -> Result<()> {
        self.bytes(&vec![0u8; n])
    }

    /// Write a fixed-width text field, truncated and padded with `pad`.
    pub fn text(&mut self, s: &str, width: usize, pad: u8) -> Result<()> {
        let mut field = vec![pad; width];
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        field[..n].copy_from_slice(&bytes[..n]);
        self.bytes(&field)
    }

    /// Overwrite bytes at an earlier position, then return to the end.
    pub fn patch_bytes(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(data)?;
        self.file.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub fn patch_u16(&mut self, pos: u64, v: u16) -> Result<()> {
        self.patch_bytes(pos, &v.to_le_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_patch_preserves_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut out = Out::create(&path).unwrap();
        out.u32(0).unwrap();
        out.u16(0xBEEF).unwrap();
        out.patch_u16(1, 0x1234).unwrap();
        out.u8(0x7F).unwrap();
        out.flush().unwrap();
        assert_eq!(out.pos(), 7);
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, vec![0x00, 0x34, 0x12, 0x00, 0xEF, 0xBE, 0x7F]);
    }

    #[test]
    fn test_text_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut out = Out::create(&path).unwrap();
        out.text("hi", 4, b' ').unwrap();
        out.text("overlong", 4, 0).unwrap();
        out.flush().unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data, b"hi  over");
    }
}
