// ppc2native-run - PowerPC binary loader/runner
//
// Loads a PowerPC ELF (or a headerless code blob with --raw-base),
// translates it to native code, and runs it from the entry point.
//
// Usage:
//   ppc2native-run game.elf
//   ppc2native-run blob.bin --raw-base 0x82000000 --arg 41

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use ppc2native::{ExportResolver, GuestMemory, OptLevel, Options, Processor};

#[derive(Parser, Debug)]
#[command(name = "ppc2native-run")]
#[command(about = "PowerPC to native-code translator and runner")]
#[command(version)]
struct Args {
    /// Input PowerPC ELF binary (or raw code blob with --raw-base)
    input: PathBuf,

    /// Treat the input as headerless code loaded at this guest address
    #[arg(long, value_parser = parse_address)]
    raw_base: Option<u32>,

    /// Guest memory size in bytes
    #[arg(long, default_value = "0x4000000", value_parser = parse_address)]
    memory_size: u32,

    /// Initial r3 (first argument / return register)
    #[arg(long, default_value = "0")]
    arg: u64,

    /// Optimization level (0-2)
    #[arg(short = 'O', default_value = "0")]
    opt_level: u8,

    /// Log generated IR per function
    #[arg(long)]
    dump_ir: bool,

    /// Write the discovered symbol map to this file
    #[arg(long)]
    dump_map: Option<PathBuf>,

    /// Cross-check discovery against an existing symbol map
    #[arg(long)]
    load_map: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let data = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let options = Options {
        opt_level: match args.opt_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        },
        dump_ir: args.dump_ir,
        load_map: args.load_map.clone(),
        dump_map: args.dump_map.clone(),
    };

    let memory = Arc::new(GuestMemory::new(args.memory_size).context("guest memory setup")?);
    let mut processor = Processor::new(memory, options).context("processor setup")?;

    let name = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    let resolver = ExportResolver::new();

    let entry = if let Some(base) = args.raw_base {
        processor
            .load_raw_binary(&name, base, &data, &resolver)
            .context("raw binary load")?;
        base
    } else {
        processor
            .load_image(&name, &data, &resolver)
            .context("image load")?
    };

    if args.verbose {
        for module in processor.modules() {
            let (low, high) = module.code_range();
            eprintln!("{}: code [{low:08X}, {high:08X})", module.name());
            module.dump();
        }
        eprintln!("entry: {entry:08X}");
    }

    let mut thread = processor.alloc_thread();
    thread.state_mut().r[3] = args.arg;
    let result = processor
        .execute(&mut thread, entry)
        .context("guest execution")?;

    let traps = processor.take_traps();
    if !traps.is_empty() {
        eprintln!("{} guest trap(s):", traps.len());
        for trap in &traps {
            eprintln!("  at {:08X}", trap.address);
        }
    }

    println!("{result}");
    Ok(())
}
