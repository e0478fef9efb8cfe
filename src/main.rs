//! vmpdump CLI - rebuilds the import table of a VMProtect-protected module.
//!
//! Attaches to a running process, resolves the import stubs of a module and
//! writes a dump whose calls go through a regular import address table.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[cfg(target_os = "windows")]
use vmpdump::{DumpConfig, ProgressInfo, ProgressStage, RemoteProcess, VmpDump};

#[cfg(target_os = "windows")]
use indicatif::{ProgressBar, ProgressStyle};

/// VMProtect x64 import recovery and dumping.
#[derive(Parser)]
#[command(name = "vmpdump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a module with its imports rebuilt
    Dump {
        /// Target process id (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_u32)]
        pid: u32,

        /// Module to dump; defaults to the process image
        #[arg(default_value = "")]
        module: String,

        /// New entry point rva (hex)
        #[arg(long = "ep", value_parser = parse_hex)]
        entry_point: Option<u32>,

        /// Mark relocations as stripped in the output
        #[arg(long)]
        disable_reloc: bool,

        /// Output file path; defaults to <module>.VMPDump.<ext> next to the process image
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List loaded modules of a process
    Modules {
        /// Target process id (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_u32)]
        pid: u32,
    },
}

fn parse_u32(value: &str) -> Result<u32, String> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", value, e))
}

fn parse_hex(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", value, e))
}

#[cfg(target_os = "windows")]
fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump {
            pid,
            module,
            entry_point,
            disable_reloc,
            output,
        } => {
            dump(pid, &module, entry_point, disable_reloc, output)?;
        }

        Commands::Modules { pid } => {
            list_modules(pid)?;
        }
    }

    Ok(())
}

#[cfg(target_os = "windows")]
fn dump(
    pid: u32,
    module: &str,
    entry_point: Option<u32>,
    disable_relocation: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let process = RemoteProcess::open(pid)?;
    let mut dumper = VmpDump::open(process, module)?;

    println!(
        "Dumping module: {} (process {})",
        dumper.target().module_name,
        pid
    );

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = DumpConfig {
        entry_point,
        disable_relocation,
        output,
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };

            let msg = match info.stage {
                ProgressStage::ScanningImports => {
                    let item = info.current_item.as_deref().unwrap_or("");
                    format!("{} - {}", info.stage.name(), item)
                }
                ProgressStage::ResolvingExports => {
                    format!(
                        "{} - {} imports, {} calls",
                        info.stage.name(),
                        info.imports_found,
                        info.calls_found
                    )
                }
                ProgressStage::ConvertingCalls => {
                    format!("{} - {} converted", info.stage.name(), info.calls_converted)
                }
                _ => info.stage.name().to_string(),
            };

            pb_clone.set_position(pct);
            pb_clone.set_message(msg);
        })),
        ..Default::default()
    };

    let (report, path) = dumper.dump_to_file(&config)?;

    pb.finish_with_message("Complete");
    println!(
        "\nConverted {}/{} calls to {} imports ({} failed, {} unresolved, {} trampolines)",
        report.calls_converted,
        report.calls_found,
        report.exports_resolved,
        report.calls_failed,
        report.calls_skipped,
        report.trampolines
    );
    println!("Dump complete: {}", path.display());

    Ok(())
}

#[cfg(target_os = "windows")]
fn list_modules(pid: u32) -> anyhow::Result<()> {
    use bytesize::ByteSize;
    use vmpdump::ProcessMemory;

    let process = RemoteProcess::open(pid)?;
    let modules = process.modules()?;

    println!("Loaded modules ({}):", modules.len());
    println!("{:<20} {:<16} Name", "Base", "Size");

    for module in &modules {
        println!(
            "0x{:016X} {:>12}     {}",
            module.base,
            ByteSize::b(u64::from(module.size)),
            module.name
        );
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("vmpdump is only supported on Windows");
    std::process::exit(1);
}
