use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "unxip",
    about = "Extract Xcode .xip archives in parallel.",
    version
)]
pub struct Cli {
    /// Archive to extract
    pub input: PathBuf,

    /// Output directory (defaults to the current directory)
    pub output: Option<PathBuf>,

    /// Store file data uncompressed instead of decmpfs/LZFSE
    #[arg(short = 'c', long = "no-compression")]
    pub no_compression: bool,

    /// Parse and schedule everything without touching the filesystem
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Log scheduled entries and swallowed per-file errors
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Parallelism (defaults to the CPU count)
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,
}
