/// Store Module
///
/// The `WarehouseStore` trait is the persistence seam of the loader. Pipeline
/// stages compute plans as plain values and hand them to a store, which owns
/// transactions, surrogate key generation and the durable bookkeeping tables.
///
/// The PostgreSQL implementation lives in `crate::db`.
use crate::error::Result;
use crate::etl::load::{DimensionPlan, FactPlan};
use crate::models::{
    Checkpoint, CheckpointUpdate, CustomerAttributes, DailySalesSummary, DimensionRecord, JobRun, JobStatus,
    ProductAttributes, RowCounts, SalesFact, SourceCustomer, SourceProduct, SourceTransaction,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;

#[cfg(test)]
pub mod memory;

/// Rows touched when a dimension plan is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub expired: u64,
    pub inserted: u64,
}

/// Abstraction over a warehouse backend.
///
/// Every `apply_*`/`append_*` method commits its writes and the optional
/// checkpoint advance atomically: either all of them are visible afterwards or none are.
pub trait WarehouseStore: Send + Sync {
    // ── Checkpoints ───────────────────────────────────────────────────────

    fn checkpoint(&self, source_name: &str) -> impl Future<Output = Result<Option<Checkpoint>>> + Send;

    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<Checkpoint>>> + Send;

    /// Upsert a checkpoint. Stored id and timestamp never move backwards.
    fn upsert_checkpoint(&self, update: &CheckpointUpdate) -> impl Future<Output = Result<()>> + Send;

    // ── Operational sources ───────────────────────────────────────────────

    /// Customers modified after `changed_since` or without a current `dim_customer` version; all of them for `None`
    fn source_customers(
        &self,
        changed_since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<SourceCustomer>>> + Send;

    /// Products modified after `changed_since` or without a current `dim_product` version; all of them for `None`
    fn source_products(&self, changed_since: Option<DateTime<Utc>>) -> impl Future<Output = Result<Vec<SourceProduct>>> + Send;

    /// Sales lines with an id strictly greater than `after_id`, in id order
    fn source_transactions(&self, after_id: i64) -> impl Future<Output = Result<Vec<SourceTransaction>>> + Send;

    // ── Dimensions ────────────────────────────────────────────────────────

    fn current_customers(&self) -> impl Future<Output = Result<Vec<DimensionRecord<CustomerAttributes>>>> + Send;

    fn current_products(&self) -> impl Future<Output = Result<Vec<DimensionRecord<ProductAttributes>>>> + Send;

    /// Apply expirations, then inserts, then the checkpoint advance
    fn apply_customer_changes(
        &self,
        plan: &DimensionPlan<CustomerAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> impl Future<Output = Result<AppliedChanges>> + Send;

    fn apply_product_changes(
        &self,
        plan: &DimensionPlan<ProductAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> impl Future<Output = Result<AppliedChanges>> + Send;

    // ── Facts ─────────────────────────────────────────────────────────────

    /// Degenerate keys of facts already loaded above `after_id`
    fn loaded_degenerate_keys(&self, after_id: i64) -> impl Future<Output = Result<HashSet<i64>>> + Send;

    /// Append the planned facts and date rows. Returns the number of facts inserted.
    fn append_facts(
        &self,
        plan: &FactPlan,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn sales_facts(&self) -> impl Future<Output = Result<Vec<SalesFact>>> + Send;

    /// Replace the whole daily summary. Returns (rows deleted, rows inserted).
    fn replace_daily_summary(&self, rows: &[DailySalesSummary]) -> impl Future<Output = Result<(u64, u64)>> + Send;

    // ── Job log ───────────────────────────────────────────────────────────

    /// Open a `running` entry. Fails with `ConcurrentRun` if any job is already running.
    fn start_job(&self, job_name: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Move a `running` entry to a terminal status. Fails with `JobNotRunning` otherwise.
    fn finish_job(
        &self,
        run_id: i64,
        status: JobStatus,
        counts: RowCounts,
        error_message: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn job_run(&self, run_id: i64) -> impl Future<Output = Result<Option<JobRun>>> + Send;

    fn running_jobs(&self) -> impl Future<Output = Result<Vec<JobRun>>> + Send;
}
