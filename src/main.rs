use clap::Parser;
use krawallrip::error::{Error, Result};
use krawallrip::{
    rom, scan, wav, write_module_to_s3m, write_module_to_xm, EngineVersion, Rom, S3mOptions,
    SearchResult, XmOptions,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "krawallrip")]
#[command(version = "0.1.0")]
#[command(about = "Extract Krawall sound-engine music from GBA ROMs to XM/S3M", long_about = None)]
struct Args {
    /// Input GBA ROM image
    rom: PathBuf,

    /// Output directory (defaults to the current directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Minimum pointer-run length accepted by the offset search
    #[arg(short, long, default_value_t = 4)]
    threshold: u32,

    /// Print every candidate pointer run found while scanning
    #[arg(short, long)]
    verbose: bool,

    /// Engine build date as YYYYMMDD, overriding banner detection
    #[arg(short = 'e', long, value_parser = parse_version)]
    engine_version: Option<EngineVersion>,

    /// Text file with one module name per line
    #[arg(long)]
    names: Option<PathBuf>,

    /// Force XM output for every module
    #[arg(long, conflicts_with = "s3m")]
    xm: bool,

    /// Force S3M output for every module
    #[arg(long)]
    s3m: bool,

    /// Also dump every sample as a WAV file
    #[arg(long)]
    wav: bool,

    /// Keep the full instrument list instead of trimming unused entries
    #[arg(long)]
    no_trim: bool,

    /// Skip the playback-compatibility fixes
    #[arg(long)]
    no_fix: bool,

    /// Module header offset (hex), bypassing the search; repeatable
    #[arg(long = "module", value_parser = parse_hex)]
    modules: Vec<u32>,

    /// Sample list offset (hex), bypassing the search
    #[arg(long, value_parser = parse_hex)]
    sample_list: Option<u32>,

    /// Instrument list offset (hex), bypassing the search
    #[arg(long, value_parser = parse_hex)]
    instrument_list: Option<u32>,
}

fn parse_hex(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_version(s: &str) -> std::result::Result<EngineVersion, String> {
    EngineVersion::from_date(s).ok_or_else(|| "expected an 8-digit date (YYYYMMDD)".to_string())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(args: &Args) -> Result<()> {
    let rom = Rom::from_file(&args.rom)?;
    if rom.find(b"Krawall", 0).is_none() {
        eprintln!(
            "Warning: no Krawall signature found. Are you sure this game uses the Krawall engine?"
        );
    }
    let version = args
        .engine_version
        .unwrap_or_else(|| EngineVersion::detect_or_default(&rom));

    let offsets = if !args.modules.is_empty() || args.sample_list.is_some() {
        SearchResult {
            success: true,
            instrument_addr: args.instrument_list.unwrap_or(0),
            instrument_count: 0,
            sample_addr: args.sample_list.unwrap_or(0),
            sample_count: 0,
            modules: args.modules.clone(),
        }
    } else {
        let found = scan::search_for_offsets(&rom, args.threshold, args.verbose, version);
        if !found.success {
            eprintln!(
                "Could not find all of the required offsets.\n \
                 * Does the ROM use the Krawall engine?\n \
                 * Try lowering the search threshold (-t).\n \
                 * Supply --module/--sample-list overrides."
            );
            return Err(Error::OffsetsNotFound);
        }
        found
    };

    let sample_offsets = read_table(&rom, offsets.sample_addr, offsets.sample_count)?;
    let instrument_offsets = read_table(&rom, offsets.instrument_addr, offsets.instrument_count)?;

    let names: Vec<String> = match &args.names {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .map(|line| line.trim().to_string())
            .collect(),
        None => Vec::new(),
    };

    let outdir = args.output.clone().unwrap_or_else(|| PathBuf::from("."));

    if args.wav {
        for (i, &offset) in sample_offsets.iter().enumerate() {
            wav::write_sample_to_wav(&rom, offset, &outdir.join(format!("Sample{}.wav", i)))?;
        }
    }

    let mut failures = 0;
    let mut first_error = None;
    for (i, &module_offset) in offsets.modules.iter().enumerate() {
        let name = names.get(i).map(String::as_str).filter(|n| !n.is_empty());
        let use_s3m = if args.xm {
            false
        } else if args.s3m {
            true
        } else {
            prefers_s3m(&rom, module_offset, version)
        };
        let written = if use_s3m {
            let path = outdir.join(format!("Module{}.s3m", i));
            let options = S3mOptions {
                trim_instruments: !args.no_trim,
                name,
                version,
            };
            write_module_to_s3m(&rom, module_offset, &sample_offsets, &path, &options, None)
                .map(|_| path)
        } else {
            let path = outdir.join(format!("Module{}.xm", i));
            let options = XmOptions {
                trim_instruments: !args.no_trim,
                name,
                fix_compatibility: !args.no_fix,
                version,
            };
            write_module_to_xm(
                &rom,
                module_offset,
                &sample_offsets,
                &instrument_offsets,
                &path,
                &options,
                None,
            )
            .map(|_| path)
        };
        match written {
            Ok(path) => println!("Successfully wrote module to {}.", path.display()),
            Err(e) => {
                eprintln!("Module{}: {}", i, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
                failures += 1;
            }
        }
    }
    // a partial rip is still a rip; fail only when nothing converted
    if failures > 0 && failures == offsets.modules.len() {
        return Err(first_error.expect("failure recorded"));
    }
    Ok(())
}

fn read_table(rom: &Rom, addr: u32, count: u32) -> Result<Vec<u32>> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    if count > 0 {
        scan::read_pointer_table(rom, addr, count)
    } else {
        Ok(scan::read_pointer_table_auto(rom, addr))
    }
}

/// Sample-based modules with 64-row patterns fit S3M best; everything else
/// goes to XM.
fn prefers_s3m(rom: &Rom, module_offset: u32, version: EngineVersion) -> bool {
    let probe = || -> Result<bool> {
        if rom.read_u8(module_offset + 358)? != 0 {
            return Ok(false);
        }
        let pointer = rom.read_u32(module_offset + 364)?;
        if !rom::is_rom_pointer(pointer) {
            return Ok(false);
        }
        let rows_at = rom::mask_offset(pointer) + 32;
        let rows = if version.wide_rows() {
            rom.read_u16(rows_at)?
        } else {
            rom.read_u8(rows_at)? as u16
        };
        Ok(rows == 64)
    };
    probe().unwrap_or(false)
}
