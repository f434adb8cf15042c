//! Command-line arguments for the `casemerge` binary.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "casemerge",
    version,
    about = "Merge partial test-case exports into one import bundle"
)]
pub struct Cli {
    /// Run configuration (JSON)
    #[arg(long, short = 'c', env = "CASEMERGE_CONFIG")]
    pub config: PathBuf,

    /// Override the configured worker count
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Override where the run report is written
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Print the full report as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}
