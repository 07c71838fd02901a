//! jobwatch command-line interface.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use jobwatch_adapters::spec_for_source;
use jobwatch_engine::{build_digest, SourceRegistry, WatchConfig, WatchPipeline, WatchRunSummary};
use jobwatch_notify::{EmailConfig, EmailNotifier, Notifier, NotifyError};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watches job boards and emails a digest of new postings")]
struct Cli {
    /// Path to the source registry YAML (overrides JOBWATCH_SOURCES).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding per-source state (overrides JOBWATCH_STATE_DIR).
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every enabled source, persist state, and email new postings.
    Run,
    /// Check every enabled source and persist state, but skip the email.
    Check,
    /// List the sources in the registry.
    Sources,
    /// Send a probe email to verify the mail channel.
    TestNotify,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WatchConfig::from_env();
    if let Some(path) = cli.config {
        config.registry_path = path;
    }
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = WatchPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);

            // State is already on disk at this point, so a failed or skipped
            // send never causes the same postings to be reported twice.
            let digest = build_digest(&summary.reports);
            if digest.is_empty() {
                println!("no new postings, skipping notification");
                return Ok(());
            }
            match EmailConfig::from_env() {
                Ok(email) => {
                    let notifier = EmailNotifier::from_config(&email)?;
                    notifier.send(&digest).await?;
                    println!("digest sent: {} new posting(s)", digest.total_new);
                }
                Err(NotifyError::Config(reason)) => {
                    warn!(%reason, "mail channel not configured, skipping notification");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Check => {
            let pipeline = WatchPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
            for report in &summary.reports {
                for job in &report.new_jobs {
                    println!("    {} | {} | {}", job.title, job.location, job.link);
                }
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.registry_path).await?;
            for entry in &registry.sources {
                let label = entry.display_name.as_deref().unwrap_or(&entry.source_id);
                let state = if entry.enabled { "enabled" } else { "disabled" };
                let adapter = if spec_for_source(&entry.source_id).is_some() {
                    ""
                } else {
                    " [no adapter]"
                };
                println!("- {} ({}): {}{}", label, entry.source_id, state, adapter);
            }
        }
        Commands::TestNotify => {
            let email = EmailConfig::from_env()?;
            let recipients = email.to.len();
            let notifier = EmailNotifier::from_config(&email)?;
            notifier.probe().await?;
            println!("probe email sent to {recipients} recipient(s)");
        }
    }

    Ok(())
}

fn print_summary(summary: &WatchRunSummary) {
    println!(
        "watch complete: run_id={} sources={} found={} new={}",
        summary.run_id, summary.sources_checked, summary.total_found, summary.total_new
    );
    for report in &summary.reports {
        println!(
            "- {} ({}): {} found, {} new, {}",
            report.display_name,
            report.source_id,
            report.found,
            report.new_jobs.len(),
            report.status.as_str()
        );
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports written to {dir}");
    }
}
