//! S3M module emitter
//!
//! ScreamTracker addresses records by 16-byte paragraph, so the file is
//! laid out on paper first: sample headers, pattern bodies and sample data
//! each get a parapointer, with padding inserted wherever a record would
//! start unaligned. Pattern bodies stay in Krawall's own packed encoding,
//! lightly transformed field by field.

use super::effects;
use crate::emit::Out;
use crate::error::{Error, Result};
use crate::krawall::pattern::EventReader;
use crate::krawall::sample::read_sample_size;
use crate::krawall::{read_module, read_sample};
use crate::rom::Rom;
use crate::version::EngineVersion;
use std::collections::HashMap;
use std::path::Path;

/// Bytes in an S3M sample header record.
const SAMPLE_HEADER_LEN: u32 = 0x50;

pub struct S3mOptions<'a> {
    /// Emit only the samples the module references, renumbered in
    /// first-encounter order.
    pub trim_instruments: bool,
    /// Song name for the header (at most 28 characters used).
    pub name: Option<&'a str>,
    pub version: EngineVersion,
}

impl Default for S3mOptions<'_> {
    fn default() -> Self {
        S3mOptions {
            trim_instruments: true,
            name: None,
            version: EngineVersion::DEFAULT,
        }
    }
}

fn align16(offset: u32) -> u32 {
    (offset + 15) & !15
}

fn pad_to(out: &mut Out, target: u64) -> Result<()> {
    let gap = target.saturating_sub(out.pos());
    out.zeros(gap as usize)
}

/// Convert one module to an S3M file. Instrument-based modules and
/// modules without 64-row patterns don't fit the format and are rejected.
pub fn write_module_to_s3m(
    rom: &Rom,
    module_offset: u32,
    sample_offsets: &[u32],
    path: &Path,
    options: &S3mOptions,
    alt_sample_rom: Option<&Rom>,
) -> Result<()> {
    let module = read_module(rom, module_offset, options.version)?;
    if module.instrument_based {
        return Err(Error::Unsupported(
            "instrument-based module cannot be written as S3M".into(),
        ));
    }
    match module.patterns.first() {
        Some(first) if first.rows == 64 => {}
        _ => {
            return Err(Error::Unsupported(
                "S3M patterns must have exactly 64 rows".into(),
            ))
        }
    }

    let sample_rom = alt_sample_rom.unwrap_or(rom);

    // Sample numbering for the output: either the samples the patterns
    // actually use, in first-encounter order, or the whole list.
    let (ids, map): (Vec<u16>, HashMap<u16, u8>) = if options.trim_instruments {
        let mut order = Vec::new();
        let mut map = HashMap::new();
        for pattern in &module.patterns {
            let mut reader = EventReader::new(&pattern.data, options.version);
            for _ in 0..pattern.rows {
                while let Some(event) = reader.next_in_row()? {
                    if event.has_note && event.instrument != 0 && !map.contains_key(&event.instrument)
                    {
                        let next = order.len() + 1;
                        if next > 254 {
                            return Err(Error::TooManyInstruments(next));
                        }
                        order.push(event.instrument);
                        map.insert(event.instrument, next as u8);
                    }
                }
            }
        }
        (order, map)
    } else {
        if sample_offsets.len() > 255 {
            return Err(Error::TooManySamples(sample_offsets.len()));
        }
        let order: Vec<u16> = (1..=sample_offsets.len() as u16).collect();
        let map = order.iter().map(|&v| (v, v as u8)).collect();
        (order, map)
    };

    let sample_offset_of = |id: u16| -> Result<u32> {
        sample_offsets
            .get(id as usize - 1)
            .copied()
            .ok_or_else(|| {
                Error::Rom(format!(
                    "module references sample {} outside the sample list",
                    id
                ))
            })
    };

    let mut sample_sizes = Vec::with_capacity(ids.len());
    for &id in &ids {
        sample_sizes.push(read_sample_size(sample_rom, sample_offset_of(id)?)?);
    }

    let sample_count = ids.len() as u32;
    let pattern_count = module.pattern_count() as u32;
    let num_orders = module.num_orders as u32;

    // Lay the file out on paper to compute every parapointer.
    let base = 0x60 + num_orders + sample_count * 2 + pattern_count * 2 + 32;
    let mut offset = base;
    let mut sample_ptrs = Vec::with_capacity(ids.len());
    for _ in &ids {
        offset = align16(offset);
        sample_ptrs.push((offset / 16) as u16);
        offset += SAMPLE_HEADER_LEN;
    }
    let mut pattern_ptrs = Vec::with_capacity(module.patterns.len());
    for pattern in &module.patterns {
        offset = align16(offset);
        pattern_ptrs.push((offset / 16) as u16);
        offset += pattern.s3m_len as u32 + 2;
    }
    let mut memsegs = Vec::with_capacity(ids.len());
    for &size in &sample_sizes {
        offset = align16(offset);
        memsegs.push(offset / 16);
        offset += size;
    }

    let mut out = Out::create(path)?;
    out.text(options.name.unwrap_or("Krawall conversion"), 28, 0)?;
    out.u8(0x1A)?;
    out.u8(16)?; // ST3 module
    out.zeros(2)?;
    out.u16(module.num_orders as u16)?;
    out.u16(sample_count as u16)?;
    out.u16(pattern_count as u16)?;
    let flags = (module.amiga_limits as u16) * 16
        | (module.vol_opt as u16) * 8
        | (module.vol_slides as u16) * 64;
    out.u16(flags)?;
    out.u16(0x1320)?; // ScreamTracker 3.20
    out.u16(2)?; // unsigned samples
    out.bytes(b"SCRM")?;
    out.u8(module.vol_global)?;
    out.u8(module.init_speed)?;
    out.u8(module.init_bpm)?;
    out.u8(64)?; // master volume
    out.u8(0)?; // ultra-click removal
    out.u8(252)?; // pan positions present
    out.zeros(10)?;
    for i in 0..32u8 {
        if (i as usize) < module.channels as usize {
            out.u8(if i < module.channels / 2 { i } else { i | 8 })?;
        } else {
            out.u8(0xFF)?;
        }
    }
    out.bytes(&module.order[..module.num_orders as usize])?;
    for &ptr in &sample_ptrs {
        out.u16(ptr)?;
    }
    for &ptr in &pattern_ptrs {
        out.u16(ptr)?;
    }
    for i in 0..32usize {
        if i < module.channels as usize {
            let pan = module.channel_pan[i];
            out.u8(if pan == 0 {
                0x27
            } else {
                ((pan as u8) >> 4) | 0x20
            })?;
        } else {
            out.u8(0x08)?;
        }
    }

    for (i, &id) in ids.iter().enumerate() {
        pad_to(&mut out, sample_ptrs[i] as u64 * 16)?;
        let sample = read_sample(sample_rom, sample_offset_of(id)?)?;
        out.u8(1)?; // PCM instrument
        out.text(&format!("Sample{}", id), 12, 0)?;
        out.u8((memsegs[i] >> 16) as u8)?;
        out.u16(memsegs[i] as u16)?;
        out.u32(sample.size)?;
        out.u32(sample.size.wrapping_sub(sample.loop_length))?;
        out.u32(sample.size + 1)?;
        out.u8(sample.vol_default)?;
        out.zeros(2)?;
        out.u8(sample.looped as u8)?;
        out.u32(sample.c2_freq)?;
        out.zeros(12)?;
        out.text(&format!("Sample{}", id), 28, 0)?;
        out.bytes(b"SCRS")?;
    }

    for (i, pattern) in module.patterns.iter().enumerate() {
        pad_to(&mut out, pattern_ptrs[i] as u64 * 16)?;
        out.u16(pattern.s3m_len)?;
        let body_start = out.pos();
        let mut reader = EventReader::new(&pattern.data, options.version);
        for _ in 0..pattern.rows {
            while let Some(event) = reader.next_in_row()? {
                let mut follow = event.channel;
                if event.has_note {
                    follow |= 0x20;
                }
                if event.has_volume {
                    follow |= 0x40;
                }
                if event.has_effect {
                    follow |= 0x80;
                }
                out.u8(follow)?;
                if event.has_note {
                    out.u8(effects::map_note(event.note))?;
                    out.u8(map.get(&event.instrument).copied().unwrap_or(0))?;
                }
                if event.has_volume {
                    out.u8(effects::map_volume(event.volume))?;
                }
                if event.has_effect {
                    match effects::remap(event.effect, event.effect_op) {
                        Some((command, op)) => {
                            out.u8(command)?;
                            out.u8(op)?;
                        }
                        None => out.zeros(2)?,
                    }
                }
            }
            out.u8(0)?;
        }
        debug_assert_eq!(out.pos() - body_start, pattern.s3m_len as u64);
    }

    for (i, &id) in ids.iter().enumerate() {
        pad_to(&mut out, memsegs[i] as u64 * 16)?;
        let sample = read_sample(sample_rom, sample_offset_of(id)?)?;
        let unsigned: Vec<u8> = sample.data.iter().map(|b| b.wrapping_add(0x80)).collect();
        out.bytes(&unsigned)?;
    }

    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align16() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(0x61), 0x70);
    }
}
