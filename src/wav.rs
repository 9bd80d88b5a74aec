//! Raw sample export as WAV
//!
//! Dumps one sample record as a mono 8-bit PCM RIFF file at the record's
//! C-2 frequency, for auditioning samples outside a tracker.

use crate::emit::Out;
use crate::error::Result;
use crate::krawall::read_sample;
use crate::rom::Rom;
use std::path::Path;

pub fn write_sample_to_wav(rom: &Rom, offset: u32, path: &Path) -> Result<()> {
    let sample = read_sample(rom, offset)?;
    let data: Vec<u8> = sample.data.iter().map(|b| b.wrapping_add(0x80)).collect();

    let mut out = Out::create(path)?;
    out.bytes(b"RIFF")?;
    out.u32(36 + data.len() as u32)?;
    out.bytes(b"WAVE")?;
    out.bytes(b"fmt ")?;
    out.u32(16)?;
    out.u16(1)?; // PCM
    out.u16(1)?; // mono
    out.u32(sample.c2_freq)?;
    out.u32(sample.c2_freq)?; // byte rate, one byte per frame
    out.u16(1)?; // block align
    out.u16(8)?; // bits per sample
    out.bytes(b"data")?;
    out.u32(data.len() as u32)?;
    out.bytes(&data)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wav_layout() {
        let pcm: Vec<u8> = vec![0x00, 0x7F, 0x80, 0xFF];
        let mut rom = vec![0u8; 0];
        let end = 0x0800_0000u32 + 18 + pcm.len() as u32;
        rom.extend_from_slice(&0u32.to_le_bytes());
        rom.extend_from_slice(&end.to_le_bytes());
        rom.extend_from_slice(&22050u32.to_le_bytes());
        rom.extend_from_slice(&[0, 0, 64, 0, 0, 0]);
        rom.extend_from_slice(&pcm);
        let rom = Rom::from_bytes(rom);

        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.wav");
        write_sample_to_wav(&rom, 0, &path).unwrap();

        let wav = std::fs::read(&path).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 22050);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 4);
        assert_eq!(&wav[44..], &[0x80, 0xFF, 0x00, 0x7F]);
    }
}
