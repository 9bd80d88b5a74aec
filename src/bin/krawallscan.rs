//! Offset discovery report tool
//!
//! Runs only the table search and prints what it found, optionally as
//! JSON, for users who rip with external tooling.

use clap::Parser;
use krawallrip::{scan, EngineVersion, Rom};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "krawallscan")]
#[command(version = "0.1.0")]
#[command(about = "Locate Krawall data tables in a GBA ROM", long_about = None)]
struct Args {
    /// Input GBA ROM image
    rom: PathBuf,

    /// Minimum pointer-run length accepted by the offset search
    #[arg(short, long, default_value_t = 4)]
    threshold: u32,

    /// Print every candidate pointer run found while scanning
    #[arg(short, long)]
    verbose: bool,

    /// Emit the result as JSON
    #[arg(short, long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let rom = Rom::from_file(&args.rom)?;
    let version = EngineVersion::detect_or_default(&rom);
    let result = scan::search_for_offsets(&rom, args.threshold, args.verbose, version);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if result.sample_addr != 0 {
            println!(
                "Sample list:     {:08X} ({} entries)",
                result.sample_addr, result.sample_count
            );
        }
        if result.instrument_addr != 0 {
            println!(
                "Instrument list: {:08X} ({} entries)",
                result.instrument_addr, result.instrument_count
            );
        }
        for module in &result.modules {
            println!("Module:          {:08X}", module);
        }
        if !result.success {
            println!("Search incomplete; try a lower threshold.");
        }
    }
    if result.success {
        Ok(())
    } else {
        std::process::exit(3);
    }
}
