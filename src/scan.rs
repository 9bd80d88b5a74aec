//! Offset discovery engine
//!
//! Krawall ships no directory: the sample list, instrument list and module
//! records are found by scanning the image for runs of cartridge-address
//! words and probing what each run points at. A run that survives the
//! probes with exactly one plausible interpretation is kept.

use crate::error::Result;
use crate::rom::{self, Rom};
use crate::version::EngineVersion;
use log::info;
use serde::Serialize;

/// Classification bits for a candidate run.
const KIND_MODULE: u8 = 0b001;
const KIND_SAMPLE: u8 = 0b010;
const KIND_INSTRUMENT: u8 = 0b100;

/// Runs at least this long never hold Krawall tables.
const RUN_LIMIT: u32 = 1024;

/// Module headers this many bytes precede their pattern-pointer array.
const MODULE_HEADER_LEN: u32 = 364;

/// Result of a discovery pass over one ROM image.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResult {
    /// True when a sample list and at least one module were found.
    pub success: bool,
    pub instrument_addr: u32,
    pub instrument_count: u32,
    pub sample_addr: u32,
    pub sample_count: u32,
    /// File offsets of module headers.
    pub modules: Vec<u32>,
}

/// A run of consecutive candidate pointers.
#[derive(Debug, Clone, Copy)]
pub struct Run {
    pub addr: u32,
    pub count: u32,
}

/// Whether a word has the shape of an entry in a Krawall pointer table.
/// Besides the cartridge-address checks this excludes the `0x08080808`
/// filler constant and Thumb instruction pairs that happen to carry the
/// region bits in both halves.
pub fn is_candidate(word: u32, rom_size: u32) -> bool {
    if word & rom::REGION_BIT == 0 || word & rom::FOREIGN_BITS != 0 {
        return false;
    }
    if rom::mask_offset(word) >= rom_size || word == 0x0808_0808 {
        return false;
    }
    let hi = (word >> 16) as u16 as i32;
    let lo = (word & 0xFFFF) as u16 as i32;
    !(hi - lo < 4 && word & 0x00FF_00FF == 0x0008_0008)
}

/// Scan the image for runs of candidate pointers with
/// `threshold <= count < 1024`.
pub fn find_pointer_runs(rom: &Rom, threshold: u32) -> Vec<Run> {
    let rom_size = rom.len();
    let mut runs = Vec::new();
    let mut start = 0u32;
    let mut count = 0u32;
    let mut offset = 0u32;
    while offset + 4 <= rom_size {
        let Ok(word) = rom.read_u32(offset) else {
            break;
        };
        if is_candidate(word, rom_size) {
            if count == 0 {
                start = offset;
            }
            count += 1;
        } else {
            if count >= threshold && count < RUN_LIMIT {
                runs.push(Run { addr: start, count });
            }
            count = 0;
        }
        offset += 4;
    }
    runs
}

/// Drop runs whose leading pointers sit within 16 bytes of each other:
/// those index tightly packed small records, never Krawall tables.
fn is_packed_run(rom: &Rom, run: &Run) -> bool {
    let n = run.count.min(4);
    let mut prev = 0u32;
    for i in 0..n {
        let value = match rom.read_u32(run.addr + i * 4) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if i > 0 && (value as i32).wrapping_sub(prev as i32) < 0x10 {
            return true;
        }
        prev = value;
    }
    false
}

/// Probe the bytes before a run for the tail of a module header and the
/// first pattern pointer for the start of a pattern record.
fn probe_module(rom: &Rom, run: &Run, version: EngineVersion) -> bool {
    let Some(tail) = run.addr.checked_sub(8) else {
        return false;
    };
    let probe = || -> Result<bool> {
        let init_speed = rom.read_u8(tail)?;
        if init_speed == 0 || init_speed > 0x10 {
            return Ok(false);
        }
        let init_bpm = rom.read_u8(tail + 1)?;
        if !(30..=200).contains(&init_bpm) {
            return Ok(false);
        }
        for i in 0..5 {
            if rom.read_u8(tail + 2 + i)? & 0xFE != 0 {
                return Ok(false);
            }
        }
        if rom.read_u8(tail + 7)? != 0 {
            return Ok(false);
        }
        let target = rom::mask_offset(rom.read_u32(run.addr)?);
        if rom.read_u8(target)? != 0 || rom.read_u8(target + 1)? != 0 {
            return Ok(false);
        }
        if rom.read_u8(target + 3)? != 0 {
            return Ok(false);
        }
        let rows = if version.wide_rows() {
            rom.read_u16(target + 32)?
        } else {
            rom.read_u8(target + 32)? as u16
        };
        Ok(rows <= 256 && rows & 7 == 0)
    };
    probe().unwrap_or(false)
}

/// Probe up to four pointed-at records for the shape of a sample header.
fn probe_sample_list(rom: &Rom, run: &Run) -> bool {
    let probe = |pointer: u32| -> Result<bool> {
        let target = rom::mask_offset(pointer);
        let loop_length = rom.read_u32(target)?;
        let end = rom.read_u32(target + 4)?;
        if !rom::is_rom_pointer(end) || end <= pointer + 18 || loop_length > end - pointer - 18 {
            return Ok(false);
        }
        if rom.read_u32(target + 8)? > 0xFFFF {
            return Ok(false);
        }
        Ok(rom.read_u8(target + 16)? & 0xFE == 0 && rom.read_u8(target + 17)? & 0xFE == 0)
    };
    for i in 0..run.count.min(4) {
        let pointer = match rom.read_u32(run.addr + i * 4) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if !probe(pointer).unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Probe up to four pointed-at records for the shape of an instrument:
/// a slowly varying 96-entry sample map and small envelope indices.
fn probe_instrument_list(rom: &Rom, run: &Run) -> bool {
    let probe = |pointer: u32| -> Result<bool> {
        let target = rom::mask_offset(pointer);
        let mut last = 0u16;
        for i in 0..96u32 {
            let entry = rom.read_u16(target + i * 2)?;
            // the map rises slowly, but the last two entries may jump
            if entry > 256 || (i > 0 && i < 94 && (entry as i32 - last as i32).abs() > 16) {
                return Ok(false);
            }
            last = entry;
        }
        for env in [target + 240, target + 292] {
            for i in 0..3 {
                if rom.read_u8(env + i)? > 12 {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    };
    for i in 0..run.count.min(4) {
        let pointer = match rom.read_u32(run.addr + i * 4) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if !probe(pointer).unwrap_or(false) {
            return false;
        }
    }
    true
}

fn classify(rom: &Rom, run: &Run, version: EngineVersion) -> u8 {
    let mut mask = 0u8;
    if probe_module(rom, run, version) {
        mask |= KIND_MODULE;
    }
    if probe_sample_list(rom, run) {
        mask |= KIND_SAMPLE;
    }
    if probe_instrument_list(rom, run) {
        mask |= KIND_INSTRUMENT;
    }
    mask
}

fn kind_name(mask: u8) -> &'static str {
    match mask {
        0 => "unknown",
        KIND_MODULE => "module",
        KIND_SAMPLE => "sample",
        KIND_INSTRUMENT => "instrument",
        0b011 => "module or sample",
        0b101 => "instrument or module",
        0b110 => "instrument or sample",
        _ => "any",
    }
}

/// Scan a ROM for the Krawall tables. Runs classified ambiguously are
/// discarded; the largest sample and instrument lists win; every uniquely
/// identified module contributes its header offset.
pub fn search_for_offsets(
    rom: &Rom,
    threshold: u32,
    verbose: bool,
    version: EngineVersion,
) -> SearchResult {
    let mut result = SearchResult::default();
    let runs: Vec<Run> = find_pointer_runs(rom, threshold)
        .into_iter()
        .filter(|run| !is_packed_run(rom, run))
        .collect();

    for run in &runs {
        let mask = classify(rom, run, version);
        if verbose {
            println!(
                "Found {} entries at {:08X} with type {}",
                run.count,
                run.addr,
                kind_name(mask)
            );
        }
        match mask {
            KIND_MODULE => {
                if let Some(header) = rom::mask_offset(run.addr).checked_sub(MODULE_HEADER_LEN) {
                    result.modules.push(header);
                }
            }
            KIND_SAMPLE if run.count > result.sample_count => {
                result.sample_addr = run.addr;
                result.sample_count = run.count;
            }
            KIND_INSTRUMENT if run.count > result.instrument_count => {
                result.instrument_addr = run.addr;
                result.instrument_count = run.count;
            }
            _ => {}
        }
    }

    if result.instrument_addr != 0 {
        info!(
            "found instrument list at {:08X} ({} entries)",
            result.instrument_addr, result.instrument_count
        );
    }
    if result.sample_addr != 0 {
        info!(
            "found sample list at {:08X} ({} entries)",
            result.sample_addr, result.sample_count
        );
    }
    for module in &result.modules {
        info!("found module at {:08X}", module);
    }

    result.success = result.sample_addr != 0 && !result.modules.is_empty();
    result
}

/// Read `count` pointers at `addr`, masked down to file offsets.
pub fn read_pointer_table(rom: &Rom, addr: u32, count: u32) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(count as usize);
    for i in 0..count {
        offsets.push(rom::mask_offset(rom.read_u32(addr + i * 4)?));
    }
    Ok(offsets)
}

/// Read pointers at `addr` until a word stops looking like one. Used when
/// the caller supplies a table address but no length.
pub fn read_pointer_table_auto(rom: &Rom, addr: u32) -> Vec<u32> {
    let mut offsets = Vec::new();
    let mut pos = addr;
    while let Ok(word) = rom.read_u32(pos) {
        if !rom::is_rom_pointer(word) {
            break;
        }
        offsets.push(rom::mask_offset(word));
        pos += 4;
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_words(words: &[u32]) -> Rom {
        let mut data = vec![0u8; 16];
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.extend_from_slice(&[0u8; 0x100]);
        Rom::from_bytes(data)
    }

    #[test]
    fn test_candidate_filters() {
        let size = 0x0010_0000;
        assert!(is_candidate(0x0800_1000, size));
        assert!(!is_candidate(0x0000_1000, size)); // region bit clear
        assert!(!is_candidate(0x1800_1000, size)); // foreign bits
        assert!(!is_candidate(0x0810_0000, size)); // out of range
        assert!(!is_candidate(0x0808_0808, size)); // filler constant
        assert!(!is_candidate(0x0808_0A08, size)); // Thumb pair shape
        // same byte shape but halfword distance >= 4 is allowed
        assert!(is_candidate(0x0808_0108, size));
    }

    #[test]
    fn test_threshold() {
        let words = [0x0800_0020, 0x0800_0040, 0x0800_0060, 0];
        let rom = rom_with_words(&words);
        assert!(find_pointer_runs(&rom, 4).is_empty());
        let runs = find_pointer_runs(&rom, 3);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].addr, 16);
        assert_eq!(runs[0].count, 3);
    }

    #[test]
    fn test_run_must_be_terminated() {
        // a run still open at end of image is discarded
        let mut data = vec![0u8; 16];
        for w in [0x0800_0004u32, 0x0800_0008, 0x0800_000C] {
            data.extend_from_slice(&w.to_le_bytes());
        }
        let rom = Rom::from_bytes(data);
        assert!(find_pointer_runs(&rom, 3).is_empty());
    }

    #[test]
    fn test_packed_run_filter() {
        let rom = rom_with_words(&[0x0800_0020, 0x0800_0024, 0x0800_0060, 0]);
        let runs = find_pointer_runs(&rom, 3);
        assert_eq!(runs.len(), 1);
        assert!(is_packed_run(&rom, &runs[0]));
        let rom = rom_with_words(&[0x0800_0020, 0x0800_0040, 0x0800_0060, 0]);
        let runs = find_pointer_runs(&rom, 3);
        assert!(!is_packed_run(&rom, &runs[0]));
    }

    #[test]
    fn test_search_failure_is_not_fatal() {
        let rom = Rom::from_bytes(vec![0u8; 4096]);
        let result = search_for_offsets(&rom, 4, false, EngineVersion::DEFAULT);
        assert!(!result.success);
        assert!(result.modules.is_empty());
    }

    #[test]
    fn test_pointer_table_auto() {
        let rom = rom_with_words(&[0x0800_0100, 0x0800_0200, 0x0000_0000]);
        let table = read_pointer_table_auto(&rom, 16);
        assert_eq!(table, vec![0x100, 0x200]);
        let table = read_pointer_table(&rom, 16, 2).unwrap();
        assert_eq!(table, vec![0x100, 0x200]);
    }
}
