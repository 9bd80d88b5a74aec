//! XM module emitter
//!
//! Produces a FastTracker II 1.04 file: header, dense packed patterns,
//! then instruments with their sample headers and delta-encoded data.
//! Record sizes are backpatched once known. A set of optional
//! compatibility fixes papers over semantic gaps between Krawall playback
//! and XM players.

use crate::emit::Out;
use crate::error::{Error, Result};
use crate::krawall::instrument::Instrument;
use crate::krawall::module::Module;
use crate::krawall::pattern::{EventReader, NOTE_OFF};
use crate::krawall::sample::Sample;
use crate::krawall::{read_instrument, read_module, read_sample};
use crate::rom::Rom;
use crate::version::EngineVersion;
use crate::xm::effects::{self, ChannelState, PortaOutcome, Remapped};
use log::warn;
use std::collections::HashMap;
use std::path::Path;

pub struct XmOptions<'a> {
    /// Emit only the instruments the module references, renumbered in
    /// first-encounter order.
    pub trim_instruments: bool,
    /// Module name for the header banner (at most 20 characters used).
    pub name: Option<&'a str>,
    /// Apply the playback-compatibility fixes.
    pub fix_compatibility: bool,
    pub version: EngineVersion,
}

impl Default for XmOptions<'_> {
    fn default() -> Self {
        XmOptions {
            trim_instruments: true,
            name: None,
            fix_compatibility: true,
            version: EngineVersion::DEFAULT,
        }
    }
}

/// One channel's slot in the dense row grid.
#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    present: bool,
    has_note: bool,
    note: u8,
    instrument: u8,
    has_volume: bool,
    volume: u8,
    has_effect: bool,
    effect: u8,
    op: u8,
}

/// A sample-offset effect whose operand can only be validated once the
/// sample sizes are known; `pos` addresses the effect byte in the file.
struct OffsetFix {
    pos: u64,
    instrument: u16,
    note: u8,
    op: u8,
}

/// Sample sizes gathered while instruments are written, keyed by the
/// original pattern instrument number.
#[derive(Default)]
struct SampleSizes {
    sample_based: HashMap<u16, u32>,
    instrument_based: HashMap<u16, ([u16; 96], HashMap<u16, u32>)>,
}

/// Instrument renumbering for the pattern data.
struct InstrumentTable {
    trim: bool,
    order: Vec<u16>,
    index: HashMap<u16, u8>,
    total: usize,
}

impl InstrumentTable {
    fn new(trim: bool, total: usize) -> InstrumentTable {
        InstrumentTable {
            trim,
            order: Vec::new(),
            index: HashMap::new(),
            total,
        }
    }

    /// Byte to emit for a pattern instrument; trimming assigns 1-based
    /// positions in first-encounter order, capped at 254.
    fn emit_byte(&mut self, instrument: u16) -> Result<u8> {
        if instrument == 0 {
            return Ok(0);
        }
        if !self.trim {
            return Ok(instrument as u8);
        }
        if let Some(&position) = self.index.get(&instrument) {
            return Ok(position);
        }
        let next = self.order.len() + 1;
        if next > 254 {
            return Err(Error::TooManyInstruments(next));
        }
        self.order.push(instrument);
        self.index.insert(instrument, next as u8);
        Ok(next as u8)
    }

    /// Original instrument numbers to write, in output order.
    fn final_list(&self) -> Vec<u16> {
        if self.trim {
            self.order.clone()
        } else {
            (1..=self.total as u16).collect()
        }
    }
}

#[derive(Default)]
struct Warned {
    effect: bool,
    pan: bool,
    volume_column: bool,
}

/// Convert one module to an XM file.
pub fn write_module_to_xm(
    rom: &Rom,
    module_offset: u32,
    sample_offsets: &[u32],
    instrument_offsets: &[u32],
    path: &Path,
    options: &XmOptions,
    alt_instrument_rom: Option<&Rom>,
) -> Result<()> {
    let module = read_module(rom, module_offset, options.version)?;
    if module.instrument_based && instrument_offsets.is_empty() {
        return Err(Error::MissingInstruments);
    }
    let source_count = if module.instrument_based {
        instrument_offsets.len()
    } else {
        sample_offsets.len()
    };
    if !options.trim_instruments && source_count > 255 {
        return Err(Error::TooManyInstruments(source_count));
    }

    let mut out = Out::create(path)?;
    write_header(&mut out, &module, options, module.pattern_count())?;
    let instrument_count_pos = 60 + 4 + 2 + 2 + 2 + 2;
    if !options.trim_instruments {
        out.patch_u16(instrument_count_pos, source_count as u16)?;
    }

    let mut table = InstrumentTable::new(options.trim_instruments, source_count);
    let mut fixes = Vec::new();
    write_patterns(&mut out, &module, options, &mut table, &mut fixes)?;

    let final_list = table.final_list();
    let mut sizes = SampleSizes::default();
    let instrument_rom = alt_instrument_rom.unwrap_or(rom);
    for (seq, &value) in final_list.iter().enumerate() {
        if module.instrument_based {
            let index = value as usize - 1;
            if index >= instrument_offsets.len() {
                write_empty_instrument(&mut out, seq)?;
                continue;
            }
            let instrument = read_instrument(instrument_rom, instrument_offsets[index])?;
            write_instrument(&mut out, rom, &instrument, seq, value, sample_offsets, &mut sizes)?;
        } else {
            let index = value as usize - 1;
            if index >= sample_offsets.len() {
                write_empty_instrument(&mut out, seq)?;
                continue;
            }
            let sample = read_sample(rom, sample_offsets[index])?;
            sizes.sample_based.insert(value, sample.size);
            write_synthetic_instrument(&mut out, &sample, seq)?;
        }
    }

    if options.fix_compatibility {
        apply_offset_fixes(&mut out, &module, &fixes, &sizes)?;
    }
    if options.trim_instruments {
        out.patch_u16(instrument_count_pos, final_list.len() as u16)?;
    }
    out.flush()
}

fn write_header(out: &mut Out, module: &Module, options: &XmOptions, patterns: usize) -> Result<()> {
    out.bytes(b"Extended Module: ")?;
    out.text(options.name.unwrap_or("Krawall conversion"), 20, b' ')?;
    out.u8(0x1A)?;
    out.bytes(b"FastTracker II      ")?;
    out.u16(0x0104)?;
    out.u32(276)?;
    out.u8(module.num_orders)?;
    out.u8(0)?;
    out.u8(module.song_restart)?;
    out.u8(0)?;
    out.u8(module.channels)?;
    out.u8(0)?;
    out.u16(patterns as u16)?;
    out.u16(0)?; // instrument count, patched later
    out.u8(module.linear_slides as u8)?;
    out.u8(0)?;
    out.u8(module.init_speed)?;
    out.u8(0)?;
    out.u8(module.init_bpm)?;
    out.u8(0)?;
    out.bytes(&module.order)
}

fn write_patterns(
    out: &mut Out,
    module: &Module,
    options: &XmOptions,
    table: &mut InstrumentTable,
    fixes: &mut Vec<OffsetFix>,
) -> Result<()> {
    let channels = module.channels as usize;
    let clip_portas =
        options.fix_compatibility && !module.amiga_limits && !module.instrument_based;
    let inject_pan = options.fix_compatibility && !module.instrument_based;

    for pattern in &module.patterns {
        out.u8(9)?;
        out.zeros(4)?;
        out.u16(pattern.rows)?;
        let size_pos = out.pos();
        out.u16(0)?;
        let data_start = out.pos();

        let mut states = vec![ChannelState::default(); channels];
        let mut last_note = vec![0u8; channels];
        let mut speed = module.init_speed;
        let mut warned = Warned::default();
        let mut reader = EventReader::new(&pattern.data, options.version);

        for _ in 0..pattern.rows {
            let mut cells = vec![Cell::default(); channels];
            while let Some(event) = reader.next_in_row()? {
                let ch = event.channel as usize;
                if ch >= channels {
                    continue;
                }
                let state = &mut states[ch];
                let mut cell = Cell {
                    present: true,
                    ..Cell::default()
                };

                let introduces = event.has_note
                    && event.instrument != 0
                    && event.instrument != state.last_instrument;
                if event.has_note {
                    cell.has_note = true;
                    cell.note = event.note;
                    cell.instrument = table.emit_byte(event.instrument)?;
                    if event.instrument != 0 {
                        state.last_instrument = event.instrument;
                    }
                    if event.note != NOTE_OFF {
                        last_note[ch] = event.note;
                        if clip_portas {
                            state.porta = event.note as i32 * 16;
                        }
                    }
                }
                if event.has_volume {
                    cell.has_volume = true;
                    cell.volume = event.volume;
                }
                if event.has_effect {
                    match effects::remap(event.effect, event.effect_op, state) {
                        Remapped::Effect { effect, op } => {
                            cell.has_effect = true;
                            cell.effect = effect;
                            cell.op = op;
                        }
                        Remapped::FineVolume { volume, effect } => {
                            if cell.has_volume {
                                // volume column taken: fall back to the
                                // coarse slide
                                cell.has_effect = true;
                                cell.effect = if effect == 0x03 { 0x05 } else { 0x06 };
                                cell.op = event.effect_op;
                                if !warned.volume_column {
                                    warned.volume_column = true;
                                    warn!("fine volume slide kept coarse: volume column in use");
                                }
                            } else {
                                cell.has_volume = true;
                                cell.volume = volume;
                                cell.has_effect = true;
                                cell.effect = effect;
                                cell.op = 0;
                            }
                        }
                        Remapped::Lost => {
                            if !warned.effect {
                                warned.effect = true;
                                warn!(
                                    "effect {} (operand {:#04X}) has no XM equivalent; dropped",
                                    event.effect, event.effect_op
                                );
                            }
                        }
                        Remapped::None => {}
                    }
                }
                if cell.has_effect && cell.effect == 0x0F && cell.op != 0 && cell.op < 0x20 {
                    speed = cell.op;
                }
                if clip_portas && cell.has_effect {
                    if let Some(kind) = effects::porta_kind(cell.effect, cell.op) {
                        match effects::clip_porta(kind, cell.op, &mut states[ch], speed) {
                            PortaOutcome::Keep(op) => cell.op = op,
                            PortaOutcome::Cut => {
                                cell.has_note = true;
                                cell.note = NOTE_OFF;
                                cell.has_effect = false;
                                cell.effect = 0;
                                cell.op = 0;
                            }
                        }
                    }
                }
                if inject_pan && introduces {
                    let pan = (module.channel_pan[ch] as u8).wrapping_add(0x80);
                    if pan != 0x80 {
                        if !cell.has_effect {
                            cell.has_effect = true;
                            cell.effect = 0x08;
                            cell.op = pan;
                        } else if !cell.has_volume {
                            cell.has_volume = true;
                            cell.volume = 0xC0 | (pan >> 4);
                        } else if !warned.pan {
                            warned.pan = true;
                            warn!("channel default pan lost: both columns in use");
                        }
                    }
                }
                cells[ch] = cell;
            }

            for (ch, cell) in cells.iter().enumerate() {
                if !cell.present {
                    out.u8(0x80)?;
                    continue;
                }
                let mut flag = 0x80u8;
                if cell.has_note {
                    flag |= 0x03;
                }
                if cell.has_volume {
                    flag |= 0x04;
                }
                if cell.has_effect {
                    flag |= 0x18;
                }
                out.u8(flag)?;
                if cell.has_note {
                    out.u8(cell.note)?;
                    out.u8(cell.instrument)?;
                }
                if cell.has_volume {
                    out.u8(cell.volume)?;
                }
                if cell.has_effect {
                    if cell.effect == 0x09 {
                        fixes.push(OffsetFix {
                            pos: out.pos(),
                            instrument: states[ch].last_instrument,
                            note: last_note[ch],
                            op: cell.op,
                        });
                    }
                    out.u8(cell.effect)?;
                    out.u8(cell.op)?;
                }
            }
        }

        let size = (out.pos() - data_start) as u16;
        out.patch_u16(size_pos, size)?;
    }
    Ok(())
}

fn write_empty_instrument(out: &mut Out, seq: usize) -> Result<()> {
    out.u32(29)?;
    out.text(&format!("Instrument{}", seq), 22, 0)?;
    out.u8(0)?;
    out.u16(0)
}

fn write_instrument(
    out: &mut Out,
    rom: &Rom,
    instrument: &Instrument,
    seq: usize,
    value: u16,
    sample_offsets: &[u32],
    sizes: &mut SampleSizes,
) -> Result<()> {
    // the map entries rise slowly, so consecutive dedup yields the sample set
    let mut unique: Vec<u16> = instrument.samples.to_vec();
    unique.dedup();
    let snum = unique.len() as u16;
    if snum == 0 {
        return write_empty_instrument(out, seq);
    }

    out.u32(252)?;
    out.text(&format!("Instrument{}", seq), 22, 0)?;
    out.u8(0)?;
    out.u16(snum)?;
    out.u32(40)?;
    let local: HashMap<u16, u8> = unique
        .iter()
        .enumerate()
        .map(|(i, &s)| (s, i as u8))
        .collect();
    for &entry in instrument.samples.iter() {
        out.u8(local[&entry])?;
    }
    for node in &instrument.env_vol.nodes {
        out.u16(node.x)?;
        out.u16(node.y)?;
    }
    for node in &instrument.env_pan.nodes {
        out.u16(node.x)?;
        out.u16(node.y)?;
    }
    out.u8(instrument.env_vol.max.wrapping_add(1))?;
    out.u8(instrument.env_pan.max.wrapping_add(1))?;
    out.u8(instrument.env_vol.sus)?;
    out.u8(instrument.env_vol.loop_start)?;
    out.u8(instrument.env_vol.max)?;
    out.u8(instrument.env_pan.sus)?;
    out.u8(instrument.env_pan.loop_start)?;
    out.u8(instrument.env_pan.max)?;
    out.u8(instrument.env_vol.flags)?;
    out.u8(instrument.env_pan.flags)?;
    out.u8(instrument.vib_type)?;
    out.u8(instrument.vib_sweep)?;
    out.u8(instrument.vib_depth)?;
    out.u8(instrument.vib_rate)?;
    out.u16(instrument.vol_fade)?;
    out.zeros(11)?;

    let mut bodies = Vec::new();
    let mut size_map = HashMap::new();
    for &sample_id in &unique {
        if sample_id as usize >= sample_offsets.len() {
            continue;
        }
        let sample = read_sample(rom, sample_offsets[sample_id as usize])?;
        write_sample_header(out, &sample, sample_id as usize)?;
        size_map.insert(sample_id, sample.size);
        bodies.push(sample);
    }
    for sample in &bodies {
        write_sample_data(out, sample)?;
    }
    sizes
        .instrument_based
        .insert(value, (instrument.samples, size_map));
    Ok(())
}

/// A sample-based module presents each sample as its own instrument with a
/// blank note map.
fn write_synthetic_instrument(out: &mut Out, sample: &Sample, seq: usize) -> Result<()> {
    out.u32(252)?;
    out.text(&format!("Instrument{}", seq), 22, 0)?;
    out.u8(0)?;
    out.u16(1)?;
    out.u32(40)?;
    out.zeros(96)?;
    out.zeros(96)?; // both envelopes
    out.zeros(10)?; // envelope scalars
    out.zeros(4)?; // vibrato
    out.u16(0)?;
    out.zeros(11)?;
    write_sample_header(out, sample, seq)?;
    write_sample_data(out, sample)
}

fn write_sample_header(out: &mut Out, sample: &Sample, id: usize) -> Result<()> {
    if sample.hq {
        out.u32(sample.size / 2)?;
    } else {
        out.u32(sample.size)?;
    }
    if sample.loop_length == 0 {
        out.u32(0)?;
    } else {
        out.u32(sample.size.saturating_sub(sample.loop_length))?;
    }
    out.u32(sample.loop_length)?;
    out.u8(sample.vol_default)?;
    out.i8(sample.fine_tune)?;
    out.u8(sample.looped as u8)?;
    out.u8((sample.pan_default as u8).wrapping_add(0x80))?;
    out.i8(sample.relative_note)?;
    out.u8(0)?;
    out.text(&format!("Sample{}", id), 22, 0)
}

fn write_sample_data(out: &mut Out, sample: &Sample) -> Result<()> {
    if sample.hq {
        // walks every other 16-bit sample, bounded by the byte count, and
        // truncates each delta to one byte
        let mut old: i16 = 0;
        let mut bytes = Vec::with_capacity(sample.size as usize / 2 + 1);
        let mut k = 0usize;
        while k < sample.size as usize {
            let v = sample.short_at(k);
            bytes.push(v.wrapping_sub(old) as u8);
            old = v;
            k += 2;
        }
        out.bytes(&bytes)
    } else {
        let mut old: u8 = 0;
        let mut bytes = Vec::with_capacity(sample.size as usize);
        for &raw in &sample.data {
            let unsigned = raw.wrapping_add(0x80);
            bytes.push(unsigned.wrapping_sub(old));
            old = unsigned;
        }
        out.bytes(&bytes)
    }
}

/// Zero out sample-offset effects that point past their sample's end. The
/// two module flavors use deliberately different thresholds.
fn apply_offset_fixes(
    out: &mut Out,
    module: &Module,
    fixes: &[OffsetFix],
    sizes: &SampleSizes,
) -> Result<()> {
    for fix in fixes {
        let out_of_range = if module.instrument_based {
            match sizes.instrument_based.get(&fix.instrument) {
                Some((map, size_map)) => {
                    if fix.note == 0 || fix.note >= NOTE_OFF {
                        false
                    } else {
                        let sample_id = map[(fix.note - 1) as usize];
                        size_map
                            .get(&sample_id)
                            .is_some_and(|&size| fix.op as u32 > size >> 8)
                    }
                }
                None => false,
            }
        } else {
            sizes
                .sample_based
                .get(&fix.instrument)
                .is_some_and(|&size| (fix.op as u32) << 8 > size)
        };
        if out_of_range {
            out.patch_bytes(fix.pos, &[0, 0])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_table_trimming() {
        let mut table = InstrumentTable::new(true, 10);
        assert_eq!(table.emit_byte(5).unwrap(), 1);
        assert_eq!(table.emit_byte(2).unwrap(), 2);
        assert_eq!(table.emit_byte(5).unwrap(), 1);
        assert_eq!(table.emit_byte(0).unwrap(), 0);
        assert_eq!(table.final_list(), vec![5, 2]);
    }

    #[test]
    fn test_instrument_table_untrimmed() {
        let mut table = InstrumentTable::new(false, 3);
        assert_eq!(table.emit_byte(7).unwrap(), 7);
        assert_eq!(table.final_list(), vec![1, 2, 3]);
    }

    #[test]
    fn test_instrument_table_overflow() {
        let mut table = InstrumentTable::new(true, 1000);
        for value in 1..=254u16 {
            table.emit_byte(value).unwrap();
        }
        assert!(matches!(
            table.emit_byte(300),
            Err(Error::TooManyInstruments(255))
        ));
    }
}
