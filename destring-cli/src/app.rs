use std::path::PathBuf;

use clap::Parser;

/// destring - static string deobfuscation for .NET assemblies
#[derive(Debug, Parser)]
#[command(name = "destring", version, about, long_about = None)]
pub struct Cli {
    /// Path to the obfuscated .NET assembly.
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Destination path for the rewritten assembly.
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present_any = ["dry_run", "scan"]
    )]
    pub output: Option<PathBuf>,

    /// Run the pipeline and report statistics without writing.
    #[arg(long)]
    pub dry_run: bool,

    /// Report the decoder type and recovered strings, then exit.
    #[arg(long)]
    pub scan: bool,

    /// Skip the `<input>.backup` copy made before writing.
    #[arg(long)]
    pub no_backup: bool,

    /// Emit the report as JSON instead of human-readable text.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,
}
