/// CLI Module
///
/// Command-line interface configuration using clap.
use crate::pipeline::PipelineConfig;
use clap::{Parser, Subcommand};
use std::time::Duration;

/// Warehouse Loader - ETL Pipeline
///
/// Load customer, product and sales data from operational PostgreSQL tables
/// into a star-schema warehouse with slowly changing dimensions
#[derive(Parser, Debug)]
#[command(name = "warehouse-loader")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Database connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long, value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Maximum number of attempts for a source read
    #[arg(long, value_name = "COUNT", default_value = "3", global = true)]
    pub max_retries: usize,

    /// Retry delay in seconds, multiplied by the attempt number
    #[arg(long, value_name = "SECONDS", default_value = "2", global = true)]
    pub retry_delay: u64,

    /// Fail a run that takes longer than this many seconds
    #[arg(long, value_name = "SECONDS", global = true)]
    pub timeout: Option<u64>,

    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load what changed since the last run
    Incremental {
        /// Keep running, one load per interval
        #[arg(short = 'c', long)]
        continuous: bool,

        /// Interval between continuous runs in seconds
        #[arg(long, value_name = "SECONDS", default_value = "60")]
        interval: u64,
    },

    /// Rebuild dimensions, reload facts and refresh the daily summary
    Full,

    /// List running jobs
    Jobs {
        /// Only show runs that have been running longer than this many seconds
        #[arg(long, value_name = "SECONDS")]
        stale_after: Option<u64>,
    },

    /// Mark a run left `running` by a killed process as failed
    ResolveJob {
        run_id: i64,

        #[arg(short = 'm', long, default_value = "resolved by operator")]
        message: String,
    },

    /// Show extraction checkpoints
    Checkpoints,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries == 0 {
            anyhow::bail!("Max retries must be greater than 0");
        }

        if self.timeout == Some(0) {
            anyhow::bail!("Timeout must be greater than 0 seconds");
        }

        match &self.command {
            Command::Incremental { continuous: true, interval: 0 } => {
                anyhow::bail!("Interval must be greater than 0 in continuous mode");
            }
            Command::ResolveJob { message, .. } if message.trim().is_empty() => {
                anyhow::bail!("Resolve message must not be empty");
            }
            _ => {}
        }

        Ok(())
    }

    /// Pipeline settings from the flags, on top of the business policy loaded from the environment
    pub fn pipeline_config(&self, warehouse: crate::config::WarehouseConfig) -> PipelineConfig {
        PipelineConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay),
            timeout: self.timeout.map(Duration::from_secs),
            warehouse,
        }
    }
}
