use anyhow::Result;
use clap::{Parser, Subcommand};
use harvest_core::{ProfileKey, Service};
use harvest_sync::{AdapterContext, HarvestPipeline, HarvestRunSummary};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Creator archive harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every catalog profile, or the targets listed in profiles.yaml.
    Harvest,
    /// Harvest a single profile.
    Profile { service: Service, id: String },
    /// Print the validated profile catalog.
    Catalog,
    /// Check that the remote service answers.
    Probe,
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,harvest=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(summary: &HarvestRunSummary) {
    println!(
        "harvest complete: run_id={} profiles={} pages={} skipped_pages={} files_ok={} duplicates={} failed={} not_dispatched={} cancelled={} reports={}",
        summary.run_id,
        summary.profiles_harvested,
        summary.pages_fetched,
        summary.pages_skipped,
        summary.files_succeeded,
        summary.files_duplicate,
        summary.files_failed,
        summary.files_not_dispatched,
        summary.cancelled,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let pipeline = harvest_sync::pipeline_from_env()?;

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => print_summary(&pipeline.run_once().await?),
        Commands::Profile { service, id } => {
            let summary = pipeline
                .run_for_profiles(&[ProfileKey::new(service, id)])
                .await?;
            print_summary(&summary);
        }
        Commands::Catalog => catalog(&pipeline).await,
        Commands::Probe => {
            let reachable = pipeline.probe(&AdapterContext::new_run()).await;
            println!("reachable={reachable}");
            if !reachable {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn catalog(pipeline: &HarvestPipeline) {
    let catalog = pipeline.fetch_profiles(&AdapterContext::new_run()).await;
    for profile in &catalog.accepted {
        println!(
            "{}\t{}\t{}\t{}",
            profile.service, profile.id, profile.favorited_count, profile.display_name
        );
    }
    println!(
        "accepted={} rejected={}",
        catalog.accepted.len(),
        catalog.rejected.len()
    );
}
