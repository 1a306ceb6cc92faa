//! oil-cli: drive the daily pipeline and read predictions.
//!
//! Usage:
//!   cargo run -p oil-cli -- run                       # yesterday UTC
//!   cargo run -p oil-cli -- run --date 2025-03-10
//!   cargo run -p oil-cli -- run --dry-run
//!   cargo run -p oil-cli -- backfill --start 2025-03-01 --end 2025-03-10
//!   cargo run -p oil-cli -- predict

use anyhow::{bail, Context};
use artifact_store::FsArtifactStore;
use chrono::NaiveDate;
use feature_pipeline::feature_names;
use gdelt_client::GdeltClient;
use pipeline_core::{PipelineConfig, PipelineContext};
use pipeline_orchestrator::{Orchestrator, RunOptions, RunState};
use prediction_engine::ModelLoader;
use price_client::PriceClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oil_cli=info,pipeline_orchestrator=info,gdelt_client=warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("");

    let config = PipelineConfig::from_env().context("loading pipeline configuration")?;
    let ctx = PipelineContext::new(config);

    let events = GdeltClient::new(&ctx);
    let prices = PriceClient::new(&ctx);
    let store = FsArtifactStore::new(&ctx, feature_names());
    let loader = ModelLoader::new(&ctx);
    let orchestrator = Orchestrator::new(ctx, events, prices, store, loader);

    match command {
        "run" => {
            let target = flag_value(&args, "--date")
                .map(parse_date)
                .transpose()?;
            let opts = RunOptions {
                dry_run: args.iter().any(|a| a == "--dry-run"),
            };

            let outcome = orchestrator.run(target, opts).await;
            tracing::info!(
                target_date = %outcome.target_date,
                state = ?outcome.state,
                bundles_ok = outcome.event_stats.bundles_ok,
                rows_parsed = outcome.event_stats.rows_parsed,
                price_stale = outcome.price_stale,
                "run finished"
            );
            if let Some(published) = &outcome.published {
                println!("published {} ({})", published.key, published.content_hash);
            }
            if outcome.state != RunState::Done {
                bail!(
                    "run for {} ended in {:?}: {}",
                    outcome.target_date,
                    outcome.state,
                    outcome.error.unwrap_or_default()
                );
            }
        }
        "backfill" => {
            let start = parse_date(required_flag(&args, "--start")?)?;
            let end = parse_date(required_flag(&args, "--end")?)?;
            if end < start {
                bail!("--end {end} precedes --start {start}");
            }
            let opts = RunOptions {
                dry_run: args.iter().any(|a| a == "--dry-run"),
            };

            let report = orchestrator.backfill(start, end, opts).await;
            println!(
                "backfill [{start}, {end}]: {} succeeded, {} failed",
                report.succeeded.len(),
                report.failed.len()
            );
            for (day, reason) in &report.failed {
                println!("  {day}: {reason}");
            }
        }
        "predict" => {
            let envelope = orchestrator.latest_report().await?;
            if let Some(stale_as_of) = envelope.stale_as_of {
                tracing::warn!(%stale_as_of, "latest run failed soft; serving previous data");
            }
            println!("{}", serde_json::to_string_pretty(&envelope.report)?);
        }
        _ => {
            eprintln!("Usage:");
            eprintln!("  oil-cli run [--date YYYY-MM-DD] [--dry-run]");
            eprintln!("  oil-cli backfill --start YYYY-MM-DD --end YYYY-MM-DD [--dry-run]");
            eprintln!("  oil-cli predict");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn required_flag<'a>(args: &'a [String], flag: &str) -> anyhow::Result<&'a str> {
    flag_value(args, flag).with_context(|| format!("{flag} is required"))
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date '{raw}'"))
}
