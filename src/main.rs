/// Ratsnake CLI (ratsnake)
/// Orchestrates the parse, assemble, and execute pipeline for .rtsk
/// sources. The external front end writes `<source>.bytecode`; the
/// assembler turns that into `<source>.rtskbin`; the VM runs the image.
/// Both intermediates are removed on exit unless kept by flag.

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Parser;
use colored::Colorize;
use miette::{miette, IntoDiagnostic, Result};

use ratsnake::assembler;
use ratsnake::vm::Vm;

#[derive(Parser)]
#[command(
    name = "ratsnake",
    version = "0.1.0",
    about = "The Ratsnake Language Toolchain",
    long_about = "ratsnake - parse, assemble, and execute Ratsnake (.rtsk) scripts."
)]
struct Cli {
    /// Keep the intermediate textual IR (<source>.bytecode)
    #[arg(long = "keep-ir", alias = "keep_ir")]
    keep_ir: bool,

    /// Keep the assembled binary image (<source>.rtskbin)
    #[arg(long = "keep-bin", alias = "keep_bin")]
    keep_bin: bool,

    /// Ratsnake source file (.rtsk)
    source: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.source.extension().and_then(|e| e.to_str()) != Some("rtsk") {
        return Err(miette!("Provided source file is not a .rtsk file."));
    }

    let ir_path = cli.source.with_extension("bytecode");
    let bin_path = cli.source.with_extension("rtskbin");

    // Stale intermediates from a previous run must not be picked up.
    let _ = std::fs::remove_file(&ir_path);
    let _ = std::fs::remove_file(&bin_path);

    let outcome = pipeline(&cli.source, &ir_path, &bin_path);

    if !cli.keep_ir {
        let _ = std::fs::remove_file(&ir_path);
    }
    if !cli.keep_bin {
        let _ = std::fs::remove_file(&bin_path);
    }

    outcome
}

fn pipeline(source: &Path, ir_path: &Path, bin_path: &Path) -> Result<()> {
    run_frontend(source)?;

    if let Err(e) = assembler::assemble_file(ir_path, bin_path) {
        eprintln!("{} {e}", "IR compilation failed:".red());
        return Err(miette!("{e}"));
    }

    let mut vm = Vm::new();
    if let Err(e) = vm.run_file(bin_path) {
        eprintln!("{} {e}", "VM error:".red());
        return Err(miette!("{e}"));
    }

    Ok(())
}

/// The front-end parser ships next to the interpreter binary and writes
/// `<source>.bytecode` beside the source file.
fn run_frontend(source: &Path) -> Result<()> {
    let exe = std::env::current_exe().into_diagnostic()?;
    let exe_dir = exe.parent().unwrap_or_else(|| Path::new("."));
    let frontend = exe_dir.join("FrontEndParts").join("frontend_manager.py");

    let status = Command::new("python")
        .arg(&frontend)
        .arg("-i")
        .arg(source)
        .status()
        .into_diagnostic()?;

    if !status.success() {
        return Err(miette!("Failed to generate IR from source file."));
    }
    Ok(())
}
