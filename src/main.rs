/// Warehouse Loader
///
/// An ETL pipeline for loading operational sales data into a PostgreSQL star schema.
mod cli;
mod config;
mod db;
mod error;
mod etl;
mod models;
mod pipeline;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::WarehouseConfig;
use db::Database;
use error::EtlError;
use etl::checkpoint::CheckpointStore;
use etl::jobs::JobTracker;
use pipeline::{LoadMode, Pipeline, RunSummary};
use serde::Serialize;
use std::env;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    let warehouse = WarehouseConfig::from_env().context("Invalid warehouse configuration")?;

    let database_url = match cli.database_url.clone() {
        Some(url) => url,
        None => env::var("DATABASE_URL").context("DATABASE_URL not found in environment. Please check your .env file")?,
    };

    if !cli.json {
        println!("💾 Connecting to PostgreSQL database...");
    }
    let database = Database::new(&database_url).await.context("Failed to connect to PostgreSQL database")?;
    database.test_connection().await.context("Database connection test failed")?;
    database.migrate().await.context("Failed to run database migrations")?;

    if !cli.json {
        println!("✅ Database connected, schema up to date");
    }

    let pipeline = Pipeline::new(database, cli.pipeline_config(warehouse));

    match cli.command.clone() {
        Command::Incremental { continuous: false, .. } => {
            run_once(&pipeline, LoadMode::Incremental, cli.json).await?;
        }
        Command::Incremental { continuous: true, interval } => {
            run_continuously(&pipeline, Duration::from_secs(interval), cli.json).await;
        }
        Command::Full => {
            run_once(&pipeline, LoadMode::Full, cli.json).await?;
        }
        Command::Jobs { stale_after } => {
            let tracker = JobTracker::new(pipeline.store());
            let runs = match stale_after {
                Some(secs) => tracker
                    .stale_runs(chrono::Duration::seconds(secs as i64), chrono::Utc::now())
                    .await
                    .context("Failed to list stale runs")?,
                None => tracker.running().await.context("Failed to list running jobs")?,
            };

            if cli.json {
                print_json(&runs)?;
            } else if runs.is_empty() {
                println!("No matching runs");
            } else {
                let now = chrono::Utc::now();
                for run in &runs {
                    println!("{}\n", RunSummary::from_job(run, now));
                }
            }
        }
        Command::ResolveJob { run_id, message } => {
            let tracker = JobTracker::new(pipeline.store());
            let run = tracker
                .get(run_id)
                .await
                .context("Failed to read job log")?
                .with_context(|| format!("Run {} not found", run_id))?;

            if run.status.is_terminal() {
                anyhow::bail!("Run {} already finished as {}", run_id, run.status);
            }

            tracker.fail(run_id, run.counts, &message).await.with_context(|| format!("Failed to resolve run {}", run_id))?;

            if !cli.json {
                println!("✅ Run {} ({}) marked failed: {}", run_id, run.job_name, message);
            } else if let Some(resolved) = tracker.get(run_id).await.context("Failed to read job log")? {
                print_json(&resolved)?;
            }
        }
        Command::Checkpoints => {
            let checkpoints = CheckpointStore::new(pipeline.store()).list().await.context("Failed to read checkpoints")?;

            if cli.json {
                print_json(&checkpoints)?;
            } else if checkpoints.is_empty() {
                println!("No checkpoints recorded yet");
            } else {
                for c in &checkpoints {
                    println!(
                        "📍 {:<12} id: {:<10} timestamp: {}  (last run {})",
                        c.source_name,
                        c.last_extracted_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                        c.last_extracted_timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                        c.last_run_time.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
            }
        }
    }

    Ok(())
}

/// Run one load and report it; a failed run is reported from its job log entry
async fn run_once(pipeline: &Pipeline<Database>, mode: LoadMode, json: bool) -> Result<RunSummary> {
    if !json {
        println!("\n🔄 Starting {} load...", if mode == LoadMode::Full { "full" } else { "incremental" });
    }

    let result = match mode {
        LoadMode::Incremental => pipeline.run_incremental().await,
        LoadMode::Full => pipeline.run_full_pipeline().await,
    };

    match result {
        Ok(summary) => {
            report(&summary, json)?;
            Ok(summary)
        }
        Err(e) => {
            if let EtlError::RunFailed { run_id, .. } = &e {
                if let Ok(Some(run)) = JobTracker::new(pipeline.store()).get(*run_id).await {
                    report(&RunSummary::from_job(&run, chrono::Utc::now()), json)?;
                }
            }
            Err(e).context("Pipeline execution failed")
        }
    }
}

async fn run_continuously(pipeline: &Pipeline<Database>, interval: Duration, json: bool) {
    tracing::info!("Continuous mode: running an incremental load every {:?}", interval);

    loop {
        if let Err(e) = run_once(pipeline, LoadMode::Incremental, json).await {
            tracing::error!("{:#}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping continuous mode");
                break;
            }
        }
    }
}

fn report(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        print_json(summary)
    } else {
        println!("\n{}", summary);
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}
