/// Jobs Module
///
/// Job log bookkeeping: every pipeline run opens a `running` entry and
/// closes it as `completed` or `failed`. Terminal entries are never reopened.
use crate::error::Result;
use crate::models::{JobRun, JobStatus, RowCounts};
use crate::store::WarehouseStore;
use chrono::{DateTime, Duration, Utc};

pub struct JobTracker<'a, S> {
    store: &'a S,
}

impl<'a, S: WarehouseStore> JobTracker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Open a run. Fails if any load is already running, under this name or another.
    pub async fn start(&self, job_name: &str) -> Result<i64> {
        let run_id = self.store.start_job(job_name).await?;
        tracing::info!("Started {} (run {})", job_name, run_id);
        Ok(run_id)
    }

    pub async fn complete(&self, run_id: i64, counts: RowCounts) -> Result<()> {
        self.store.finish_job(run_id, JobStatus::Completed, counts, None).await?;
        tracing::info!(
            "Run {} completed: {} processed, {} inserted, {} updated, {} deleted",
            run_id,
            counts.processed,
            counts.inserted,
            counts.updated,
            counts.deleted
        );
        Ok(())
    }

    /// Mark a run failed, keeping whatever counts it had reached
    pub async fn fail(&self, run_id: i64, counts: RowCounts, error_message: &str) -> Result<()> {
        self.store.finish_job(run_id, JobStatus::Failed, counts, Some(error_message)).await?;
        tracing::warn!("Run {} marked failed: {}", run_id, error_message);
        Ok(())
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<JobRun>> {
        self.store.job_run(run_id).await
    }

    pub async fn running(&self) -> Result<Vec<JobRun>> {
        self.store.running_jobs().await
    }

    /// Runs still `running` more than `max_age` after they started.
    ///
    /// A killed process leaves its run in this state; an operator resolves it with `fail`.
    pub async fn stale_runs(&self, max_age: Duration, now: DateTime<Utc>) -> Result<Vec<JobRun>> {
        let cutoff = now - max_age;
        let mut stale: Vec<JobRun> =
            self.store.running_jobs().await?.into_iter().filter(|run| run.start_time < cutoff).collect();
        stale.sort_by_key(|run| run.start_time);
        Ok(stale)
    }
}
