use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod cli;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, miette};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use xip_format::{
    DefaultSink, DryRunSink, ExtractOptions, ExtractProgress, ExtractStats, extract_with_sink,
};

use cli::Cli;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse_from(wild::args_os());

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let output = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
    if !cli.dry_run {
        tokio::fs::create_dir_all(&output).await.into_diagnostic()?;
    }

    // Spinner only when a human is watching and tracing isn't chatty.
    let show_progress = !cli.verbose && std::io::stdout().is_terminal();
    let (progress, progress_task) = spawn_progress(show_progress);

    let options = ExtractOptions {
        concurrency: cli.jobs,
        progress,
    };

    let stats = run(&cli, &output, options)
        .await
        .map_err(|err| miette!("{}: {err}", cli.input.display()))?;

    if let Some(task) = progress_task {
        let _ = task.await;
    }

    report(&cli, &stats);
    Ok(())
}

async fn run(
    cli: &Cli,
    output: &Path,
    options: ExtractOptions,
) -> xip_format::Result<ExtractStats> {
    if cli.dry_run {
        return extract_with_sink(&cli.input, Arc::new(DryRunSink), options).await;
    }

    #[cfg(target_os = "macos")]
    if !cli.no_compression {
        let batch = cli.jobs.unwrap_or_else(num_cpus::get);
        let sink = xip_format::CompressedSink::new(output, batch);
        return extract_with_sink(&cli.input, Arc::new(sink), options).await;
    }

    extract_with_sink(&cli.input, Arc::new(DefaultSink::new(output)), options).await
}

fn report(cli: &Cli, stats: &ExtractStats) {
    let verb = if cli.dry_run {
        "would extract"
    } else {
        "extracted"
    };
    println!(
        "{verb} {} files, {} directories, {} symlinks, {} hardlinks ({} bytes)",
        stats.files_created,
        stats.dirs_created,
        stats.symlinks_created,
        stats.hardlinks_created,
        stats.bytes_written,
    );
}

fn spawn_progress(
    enabled: bool,
) -> (
    Option<UnboundedSender<ExtractProgress>>,
    Option<JoinHandle<()>>,
) {
    if !enabled {
        return (None, None);
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner:.green} {pos:>7} entries  {wide_msg}")
            .unwrap(),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));

    let task = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                ExtractProgress::Entry { name } => {
                    bar.inc(1);
                    bar.set_message(name);
                }
                ExtractProgress::Finished => bar.finish_and_clear(),
            }
        }
        bar.finish_and_clear();
    });
    (Some(tx), Some(task))
}
