//! casemerge binary: load a run configuration, merge, report.

#![forbid(unsafe_code)]

use std::io;

use anyhow::{Context, Result};
use casemerge::cli::Cli;
use casemerge::{CancellationToken, MergeConfig, MergeReport, run_merge};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = MergeConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(report) = cli.report.clone() {
        config.report_path = Some(report);
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; stopping after in-flight fragments");
        handler_token.cancel();
    })
    .context("install interrupt handler")?;

    let outcome = run_merge(&config, &cancel)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print_summary(&config, &outcome.report);
    }
    Ok(())
}

fn print_summary(config: &MergeConfig, report: &MergeReport) {
    println!("Bundle: {}", config.output_path.display());
    println!("Accepted: {}", report.accepted_count);
    println!("Rejected: {}", report.rejected_count);
    for rejection in &report.rejections {
        println!(
            "  [fragment {}] {}: {}",
            rejection.fragment_sequence, rejection.external_id, rejection.reason
        );
    }
    if !report.skipped_fragments.is_empty() {
        println!("Skipped fragments: {}", report.skipped_fragments.len());
        for skipped in &report.skipped_fragments {
            println!("  {}: {}", skipped.path.display(), skipped.reason);
        }
    }
    if !report.pruned_sections.is_empty() {
        println!(
            "Pruned sections (ancestor in a skipped fragment): {:?}",
            report.pruned_sections
        );
    }
    if let Some(digest) = &report.bundle_sha256 {
        println!("SHA-256: {digest}");
    }
}
