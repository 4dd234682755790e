/// Pipeline Module
///
/// Orchestrates a warehouse load: Job Tracker opens a run → changed source rows
/// are detected against their checkpoints → customer and product dimensions are
/// versioned → new sales lines become facts → the run is closed, with retry
/// logic for source reads and an optional time limit for the whole run.
use crate::config::{WarehouseConfig, DISCARDED_STATUSES_VAR};
use crate::error::{EtlError, Result};
use crate::etl::checkpoint::{self, CheckpointStore, SALES_SOURCE};
use crate::etl::extract::{find_changed, max_modified, DimensionSource};
use crate::etl::jobs::JobTracker;
use crate::etl::load::{self, CurrentIndex, DimensionPlan, TrackedAttributes};
use crate::etl::transform;
use crate::models::{CheckpointUpdate, JobRun, JobStatus, RowCounts, SourceCustomer, SourceProduct};
use crate::store::WarehouseStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

pub const INCREMENTAL_JOB: &str = "incremental_load";
pub const FULL_REFRESH_JOB: &str = "full_refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Checkpointed delta load
    Incremental,
    /// Rebuild every dimension and reload every eligible fact
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    CustomerDimension,
    ProductDimension,
    Facts,
    Summary,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::CustomerDimension => write!(f, "customer dimension"),
            PipelineStage::ProductDimension => write!(f, "product dimension"),
            PipelineStage::Facts => write!(f, "fact"),
            PipelineStage::Summary => write!(f, "summary"),
        }
    }
}

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: usize,
    pub retry_delay: Duration,
    /// Upper bound for a whole run; `None` lets it run to completion
    pub timeout: Option<Duration>,
    pub warehouse: WarehouseConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay: Duration::from_secs(2), timeout: None, warehouse: WarehouseConfig::default() }
    }
}

/// Structured result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn new(run_id: i64, job_name: &str, status: JobStatus, counts: RowCounts, elapsed: Duration) -> Self {
        Self {
            run_id,
            job_name: job_name.to_string(),
            status,
            rows_processed: counts.processed,
            rows_inserted: counts.inserted,
            rows_updated: counts.updated,
            rows_deleted: counts.deleted,
            duration_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    /// Summary of a job log entry; runs still going are measured up to `now`
    pub fn from_job(run: &JobRun, now: DateTime<Utc>) -> Self {
        let elapsed = (run.end_time.unwrap_or(now) - run.start_time).to_std().unwrap_or_default();
        Self { error: run.error_message.clone(), ..Self::new(run.run_id, &run.job_name, run.status, run.counts, elapsed) }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.rows_processed as f64 / secs
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "📊 {} run {}: {}", self.job_name, self.run_id, self.status)?;
        writeln!(f, "   ⏱️  Total time: {:.2}s", self.elapsed().as_secs_f64())?;
        writeln!(
            f,
            "   📝 Rows: {} processed, {} inserted, {} updated, {} deleted",
            self.rows_processed, self.rows_inserted, self.rows_updated, self.rows_deleted
        )?;
        write!(f, "   ⚡ Throughput: {:.0} rows/sec", self.rows_per_second())?;
        if let Some(error) = &self.error {
            write!(f, "\n   ❌ Error: {}", error)?;
        }
        Ok(())
    }
}

/// Where a run got to, kept up to date so a failure can be reported accurately
#[derive(Debug, Default)]
struct Progress {
    counts: RowCounts,
    stage: Option<PipelineStage>,
}

/// A dimension load ready to hand to the store
struct DimensionLoad<A> {
    plan: DimensionPlan<A>,
    processed: usize,
    checkpoint: CheckpointUpdate,
}

fn prepare_dimension_load<D>(
    mode: LoadMode,
    source: &[D],
    current: &CurrentIndex<D::Attributes>,
    since: DateTime<Utc>,
    config: &WarehouseConfig,
    today: NaiveDate,
) -> DimensionLoad<D::Attributes>
where
    D: DimensionSource,
    D::Attributes: TrackedAttributes,
{
    let (plan, processed, latest) = match mode {
        LoadMode::Incremental => {
            let delta: Vec<&D> = find_changed(source, since, current).collect();
            let latest = max_modified(delta.iter().copied());
            (load::plan_incremental(current, &delta, config, today), delta.len(), latest)
        }
        LoadMode::Full => (load::full_refresh(current, source, config, today), source.len(), max_modified(source)),
    };

    let cursor = latest.map_or(since, |latest| latest.max(since));
    DimensionLoad { plan, processed, checkpoint: checkpoint::prepare(D::SOURCE_NAME, None, cursor) }
}

/// Main warehouse loading pipeline
pub struct Pipeline<S> {
    store: S,
    config: PipelineConfig,
}

impl<S: WarehouseStore> Pipeline<S> {
    /// Create a new pipeline instance
    pub fn new(store: S, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load only what changed since the last successful run
    pub async fn run_incremental(&self) -> Result<RunSummary> {
        self.run_job(INCREMENTAL_JOB, LoadMode::Incremental).await
    }

    /// Rebuild all dimensions, reload every eligible fact and refresh the daily summary
    pub async fn run_full_pipeline(&self) -> Result<RunSummary> {
        self.run_job(FULL_REFRESH_JOB, LoadMode::Full).await
    }

    async fn run_job(&self, job_name: &str, mode: LoadMode) -> Result<RunSummary> {
        let start_time = Instant::now();
        let tracker = JobTracker::new(&self.store);
        let run_id = tracker.start(job_name).await?;

        let mut progress = Progress::default();
        let outcome = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute(mode, &mut progress))
                .await
                .unwrap_or(Err(EtlError::Timeout(limit))),
            None => self.execute(mode, &mut progress).await,
        };

        // A run whose completion cannot be recorded must not stay `running`
        let outcome = match outcome {
            Ok(()) => match tracker.complete(run_id, progress.counts).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    progress.stage = None;
                    Err(e)
                }
            },
            failed => failed,
        };

        match outcome {
            Ok(()) => Ok(RunSummary::new(run_id, job_name, JobStatus::Completed, progress.counts, start_time.elapsed())),
            Err(e) => {
                let message = match progress.stage {
                    Some(stage) => format!("{} stage: {}", stage, e),
                    None => e.to_string(),
                };
                tracing::error!("{} run {} failed: {}", job_name, run_id, message);

                if let Err(record_err) = tracker.fail(run_id, progress.counts, &message).await {
                    tracing::error!("Could not record failure of run {}: {}", run_id, record_err);
                }

                Err(EtlError::RunFailed { run_id, job_name: job_name.to_string(), source: Box::new(e) })
            }
        }
    }

    async fn execute(&self, mode: LoadMode, progress: &mut Progress) -> Result<()> {
        let today = Utc::now().date_naive();

        progress.stage = Some(PipelineStage::CustomerDimension);
        progress.counts += self.load_customers(mode, today).await?;

        progress.stage = Some(PipelineStage::ProductDimension);
        progress.counts += self.load_products(mode, today).await?;

        progress.stage = Some(PipelineStage::Facts);
        progress.counts += self.load_facts(mode).await?;

        if mode == LoadMode::Full {
            progress.stage = Some(PipelineStage::Summary);
            progress.counts += self.refresh_summary().await?;
        }

        Ok(())
    }

    async fn load_customers(&self, mode: LoadMode, today: NaiveDate) -> Result<RowCounts> {
        let since = CheckpointStore::new(&self.store).get(SourceCustomer::SOURCE_NAME).await;
        let changed_since = (mode == LoadMode::Incremental).then_some(since);
        let source = self.with_retry("customers", || self.store.source_customers(changed_since)).await?;
        let current =
            CurrentIndex::build(SourceCustomer::ENTITY, self.with_retry("dim_customer", || self.store.current_customers()).await?)?;

        let load = prepare_dimension_load(mode, &source, &current, since, &self.config.warehouse, today);
        if load.plan.is_empty() {
            tracing::debug!("Customer dimension is up to date");
        }
        let applied = self.store.apply_customer_changes(&load.plan, Some(&load.checkpoint)).await?;

        tracing::info!(
            "Customer dimension: {} candidate rows, {} versions expired, {} inserted",
            load.processed,
            applied.expired,
            applied.inserted
        );
        Ok(RowCounts { processed: load.processed as u64, inserted: applied.inserted, updated: applied.expired, deleted: 0 })
    }

    async fn load_products(&self, mode: LoadMode, today: NaiveDate) -> Result<RowCounts> {
        let since = CheckpointStore::new(&self.store).get(SourceProduct::SOURCE_NAME).await;
        let changed_since = (mode == LoadMode::Incremental).then_some(since);
        let source = self.with_retry("products", || self.store.source_products(changed_since)).await?;
        let current =
            CurrentIndex::build(SourceProduct::ENTITY, self.with_retry("dim_product", || self.store.current_products()).await?)?;

        let load = prepare_dimension_load(mode, &source, &current, since, &self.config.warehouse, today);
        if load.plan.is_empty() {
            tracing::debug!("Product dimension is up to date");
        }
        let applied = self.store.apply_product_changes(&load.plan, Some(&load.checkpoint)).await?;

        tracing::info!(
            "Product dimension: {} candidate rows, {} versions expired, {} inserted",
            load.processed,
            applied.expired,
            applied.inserted
        );
        Ok(RowCounts { processed: load.processed as u64, inserted: applied.inserted, updated: applied.expired, deleted: 0 })
    }

    async fn load_facts(&self, mode: LoadMode) -> Result<RowCounts> {
        let recorded = CheckpointStore::new(&self.store).recorded_id(SALES_SOURCE).await;
        let last_loaded = match mode {
            LoadMode::Incremental => recorded.unwrap_or(0),
            LoadMode::Full => 0,
        };

        let transactions = self.with_retry("sales", || self.store.source_transactions(last_loaded)).await?;
        let already_loaded = self.with_retry("fact_sales", || self.store.loaded_degenerate_keys(last_loaded)).await?;
        let customers =
            CurrentIndex::build(SourceCustomer::ENTITY, self.with_retry("dim_customer", || self.store.current_customers()).await?)?;
        let products =
            CurrentIndex::build(SourceProduct::ENTITY, self.with_retry("dim_product", || self.store.current_products()).await?)?;

        let plan =
            load::load_new_facts(last_loaded, &transactions, &already_loaded, &customers, &products, &self.config.warehouse);

        for skipped in &plan.skipped {
            tracing::info!("Deferring sales line {}: {}", skipped.degenerate_key, skipped.reason);
        }

        if let Some(held) = &plan.held_by {
            if recorded == Some(plan.watermark) {
                tracing::warn!(
                    "Sales watermark still at {} after another run: line {} (status '{}') is not settled. \
                     If that status is final, list it in {}",
                    plan.watermark,
                    held.degenerate_key,
                    held.status,
                    DISCARDED_STATUSES_VAR
                );
            }
        }

        let checkpoint = checkpoint::prepare(SALES_SOURCE, Some(plan.watermark), Utc::now());
        let inserted = self.store.append_facts(&plan, Some(&checkpoint)).await?;

        tracing::info!(
            "Facts: {} lines considered, {} inserted, {} deferred, {} pending, {} discarded, watermark {}",
            plan.considered,
            inserted,
            plan.skipped.len(),
            plan.pending,
            plan.discarded,
            plan.watermark
        );
        Ok(RowCounts { processed: plan.considered as u64, inserted, updated: 0, deleted: 0 })
    }

    async fn refresh_summary(&self) -> Result<RowCounts> {
        let facts = self.with_retry("fact_sales", || self.store.sales_facts()).await?;
        let rows = transform::summarize_daily(&facts);
        let (deleted, inserted) = self.store.replace_daily_summary(&rows).await?;

        tracing::info!("Daily summary rebuilt from {} facts: {} rows replaced by {}", facts.len(), deleted, inserted);
        Ok(RowCounts { processed: facts.len() as u64, inserted, updated: 0, deleted })
    }

    /// Run a read with retry logic; only retryable errors are retried
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry_count = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    retry_count += 1;

                    if retry_count >= self.config.max_retries {
                        tracing::error!("Reading {} failed after {} attempts: {}", what, retry_count, e);
                        return Err(e);
                    }

                    tracing::warn!(
                        "Reading {} failed, retrying ({}/{}): {}",
                        what,
                        retry_count,
                        self.config.max_retries,
                        e
                    );

                    tokio::time::sleep(self.config.retry_delay * retry_count as u32).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
