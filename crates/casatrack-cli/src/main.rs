use anyhow::Result;
use casatrack_core::ListingStatus;
use casatrack_engine::{run_fold_once_from_env, report_recent_markdown, PipelineConfig};
use casatrack_storage::CanonicalStore;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "casatrack")]
#[command(about = "Cross-portal real-estate listing tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fold pending snapshots into the canonical store and export results.
    Fold,
    /// Serve the listing JSON API.
    Serve,
    /// Print a markdown digest of recent fold runs.
    Report {
        /// How many runs to include, newest first.
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Print canonical store counts by status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Fold) {
        Commands::Fold => {
            let summary = run_fold_once_from_env().await?;
            println!(
                "fold complete: run_id={} batches={} skipped={} listings={} (active={} sold={} removed={}) reports={}",
                summary.run_id,
                summary.batches_processed,
                summary.batches_skipped,
                summary.listings_total,
                summary.active,
                summary.sold,
                summary.removed_by_portal,
                summary.reports_dir,
            );
        }
        Commands::Serve => {
            casatrack_web::serve_from_env().await?;
        }
        Commands::Report { runs } => {
            let config = PipelineConfig::from_env();
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
        Commands::Status => {
            let config = PipelineConfig::from_env();
            let store = CanonicalStore::load_or_default(&config.state_path).await?;
            let counts = store.counts_by_status();
            println!("canonical listings: {}", store.len());
            for status in [
                ListingStatus::Active,
                ListingStatus::Sold,
                ListingStatus::RemovedByPortal,
            ] {
                println!(
                    "  {}: {}",
                    status.as_str(),
                    counts.get(&status).copied().unwrap_or(0)
                );
            }
            let state = store.state();
            for (portal, ledger) in &state.ledgers {
                match ledger.last_processed() {
                    Some(date) => println!("  {portal}: last snapshot {date}"),
                    None => println!("  {portal}: no snapshots folded"),
                }
            }
        }
    }

    Ok(())
}
