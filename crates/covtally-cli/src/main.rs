use anyhow::Result;
use clap::{Parser, Subcommand};
use covtally_pipeline::{CountyQueryService, IngestPipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "covtally")]
#[command(about = "County COVID time-series fetch, enrichment, and lookup")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the enriched dataset, or reuse the local cache when the
    /// remote has not changed since the last run.
    Sync {
        /// Re-fetch even when the cache looks fresh.
        #[arg(long)]
        force: bool,
    },
    /// Print one county's chronological series.
    Query { state: String, county: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config)?;

    match cli.command.unwrap_or(Commands::Sync { force: false }) {
        Commands::Sync { force } => {
            let outcome = pipeline.run(force).await?;
            let history = match outcome.summary.history_persisted {
                Some(true) => "true",
                Some(false) => "false",
                None => "n/a",
            };
            println!(
                "sync complete: rows={} skipped={} refreshed={} history_persisted={}",
                outcome.summary.row_count,
                outcome.summary.skipped_rows,
                outcome.summary.refreshed,
                history
            );
        }
        Commands::Query { state, county } => {
            let service = CountyQueryService::load(&pipeline).await?;
            let rows = service.get_by_county(&state, &county);
            if rows.is_empty() {
                println!("no rows for {county}, {state}");
                return Ok(());
            }
            for row in rows {
                println!(
                    "{} {}, {} cases={} ({}) deaths={} ({})",
                    row.date,
                    row.county,
                    row.state,
                    fmt_count(row.cases),
                    fmt_change(row.cases_percent_change),
                    fmt_count(row.deaths),
                    fmt_change(row.deaths_percent_change)
                );
            }
        }
    }

    Ok(())
}

fn fmt_count(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_change(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:+.2}%"))
        .unwrap_or_else(|| "-".to_string())
}
