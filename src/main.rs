use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use time::macros::format_description;

use scope_extractor::config::RunConfig;
use scope_extractor::pipeline::{AggregateSummary, Pipeline, RunSummary};
use scope_extractor::util::format_elapsed;

#[derive(Parser)]
#[command(name = "OpenAlex Scope Extractor")]
#[command(about = "Extracts per-scope relations from OpenAlex JSONL.gz shards and consolidates them into one CSV per scope.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[arg(short, long, global = true, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(short, long, global = true, default_value = "0", help = "Number of worker threads (0 for auto)")]
    threads: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Extract every pending shard, then aggregate if configured.
    Run {
        #[arg(long, help = "Path to the run configuration YAML file")]
        run_config: PathBuf,
        #[arg(long, help = "Reprocess shards that already have a completion manifest")]
        force: bool,
        #[arg(long, help = "Hide the progress bar")]
        no_progress: bool,
    },
    /// Consolidate existing artifacts without touching the corpus.
    Aggregate {
        #[arg(long, help = "Path to the run configuration YAML file")]
        run_config: PathBuf,
    },
    /// Check existing artifacts against their completion manifests.
    Verify {
        #[arg(long, help = "Path to the run configuration YAML file")]
        run_config: PathBuf,
    },
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", level);
            LevelFilter::Info
        }
    }
}

fn load_pipeline(run_config: &Path, threads: usize) -> Result<Pipeline> {
    info!("Loading run configuration from: {}", run_config.display());
    let config = RunConfig::load(run_config)?;
    info!(
        "Run config loaded: profile '{}', corpus {}, output {}",
        config.profile.name(),
        config.corpus_root.display(),
        config.output_root.display()
    );
    Ok(Pipeline::new(config).with_threads(Some(threads)))
}

fn log_aggregates(summary: &AggregateSummary) {
    for (scope, path) in &summary.written {
        info!("  - {}: {}", scope, path.display());
    }
    if let Some(rollup) = &summary.rollup {
        info!("  - citations per author: {}", rollup.display());
    }
    for (scope, e) in &summary.failed {
        warn!("  - {} not aggregated: {:#}", scope, e);
    }
}

fn log_run_summary(summary: &RunSummary) {
    let report = &summary.report;
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Run id: {} (profile '{}')", summary.run_id, summary.profile);
    info!("Total execution time: {}", format_elapsed(summary.elapsed));
    info!("Shards found: {}", summary.shards_found);
    info!("Shards already done before this run: {}", summary.already_done);
    info!("Shards processed successfully: {}", report.processed.len());
    info!("Worker invocations (retries included): {}", report.invocations);

    let rows: usize = report.processed.iter().map(|p| p.stats.total_rows()).sum();
    let decode_errors: u64 = report.processed.iter().map(|p| p.stats.decode_errors).sum();
    info!("Rows written: {}, undecodable lines skipped: {}", rows, decode_errors);

    if !report.failed.is_empty() {
        warn!("Shards with processing errors: {}", report.failed.len());
        for failed in report.failed.iter().take(10) {
            warn!("  - {} after {} attempts: {:#}", failed.shard, failed.attempts, failed.error);
        }
        if report.failed.len() > 10 {
            warn!("  ... (and {} more)", report.failed.len() - 10);
        }
    }
    if let Some(aggregates) = &summary.aggregates {
        info!("Aggregated datasets:");
        log_aggregates(aggregates);
    }
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    SimpleLogger::new()
        .with_level(parse_level(&cli.log_level))
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting OpenAlex Scope Extractor");

    let failed = match &cli.command {
        Command::Run { run_config, force, no_progress } => {
            let pipeline = load_pipeline(run_config, cli.threads)?.with_force(*force).with_progress(!no_progress);
            let summary = pipeline.run()?;
            log_run_summary(&summary);
            !summary.is_success()
        }
        Command::Aggregate { run_config } => {
            let summary = load_pipeline(run_config, cli.threads)?.aggregate()?;
            log_aggregates(&summary);
            !summary.failed.is_empty()
        }
        Command::Verify { run_config } => {
            let report = load_pipeline(run_config, cli.threads)?.verify()?;
            for (shard, scopes) in report.mismatched.iter().take(10) {
                warn!("  - {} has mismatched artifacts: {:?}", shard, scopes);
            }
            if !report.not_done.is_empty() {
                warn!("{} shards have no completion manifest", report.not_done.len());
            }
            !report.is_clean()
        }
    };

    info!("Finished in {}", format_elapsed(start_time.elapsed()));
    if failed {
        error!("Completed with failures.");
        std::process::exit(1);
    }
    Ok(())
}
