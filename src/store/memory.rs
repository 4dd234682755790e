/// In-memory `WarehouseStore` used by the pipeline tests.
///
/// Writes are staged on a copy of the affected tables and swapped in only on
/// success, which gives the same all-or-nothing behaviour as a database
/// transaction. Fault injection hooks let tests break reads, fact appends and
/// job completion.
use super::{AppliedChanges, WarehouseStore};
use crate::error::{EtlError, Result};
use crate::etl::load::{DimensionPlan, FactPlan};
use crate::models::{
    Checkpoint, CheckpointUpdate, CustomerAttributes, DailySalesSummary, DateDimension, DimensionRecord, JobRun,
    JobStatus, ProductAttributes, RowCounts, SalesFact, SourceCustomer, SourceProduct, SourceTransaction,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    customers: BTreeMap<i64, SourceCustomer>,
    products: BTreeMap<i64, SourceProduct>,
    transactions: BTreeMap<i64, SourceTransaction>,

    dim_customer: Vec<DimensionRecord<CustomerAttributes>>,
    dim_product: Vec<DimensionRecord<ProductAttributes>>,
    next_surrogate_key: i64,
    facts: Vec<SalesFact>,
    dates: BTreeMap<i32, DateDimension>,
    summary: Vec<DailySalesSummary>,

    checkpoints: BTreeMap<String, Checkpoint>,
    jobs: BTreeMap<i64, JobRun>,
    next_run_id: i64,

    unavailable: bool,
    fact_fault_after: Option<usize>,
    completion_fault: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }

    fn readable(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if state.unavailable {
            return Err(EtlError::SourceUnavailable("memory store marked unavailable".into()));
        }
        Ok(state)
    }

    // ── Operational source setup ──────────────────────────────────────────

    pub fn put_customer(&self, customer: SourceCustomer) {
        self.lock().customers.insert(customer.customer_id, customer);
    }

    pub fn put_product(&self, product: SourceProduct) {
        self.lock().products.insert(product.product_id, product);
    }

    pub fn put_transaction(&self, transaction: SourceTransaction) {
        self.lock().transactions.insert(transaction.detail_id, transaction);
    }

    // ── Fault injection ───────────────────────────────────────────────────

    /// Make every read fail with `SourceUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make the next fact append commit `rows` facts and then fail, like a store without transactions
    pub fn fail_fact_load_after(&self, rows: usize) {
        self.lock().fact_fault_after = Some(rows);
    }

    /// Make the next attempt to mark a run completed fail
    pub fn fail_job_completion(&self) {
        self.lock().completion_fault = true;
    }

    // ── Inspection ────────────────────────────────────────────────────────

    pub fn customer_versions(&self, customer_id: i64) -> Vec<DimensionRecord<CustomerAttributes>> {
        self.lock().dim_customer.iter().filter(|r| r.natural_key == customer_id).cloned().collect()
    }

    pub fn product_versions(&self, product_id: i64) -> Vec<DimensionRecord<ProductAttributes>> {
        self.lock().dim_product.iter().filter(|r| r.natural_key == product_id).cloned().collect()
    }

    pub fn all_customer_versions(&self) -> Vec<DimensionRecord<CustomerAttributes>> {
        self.lock().dim_customer.clone()
    }

    pub fn facts(&self) -> Vec<SalesFact> {
        self.lock().facts.clone()
    }

    pub fn summary(&self) -> Vec<DailySalesSummary> {
        self.lock().summary.clone()
    }

    pub fn date_keys(&self) -> Vec<i32> {
        self.lock().dates.keys().copied().collect()
    }
}

fn upsert_checkpoint_in(checkpoints: &mut BTreeMap<String, Checkpoint>, update: &CheckpointUpdate) {
    let now = Utc::now();
    checkpoints
        .entry(update.source_name.clone())
        .and_modify(|c| {
            c.last_extracted_id = c.last_extracted_id.max(update.last_id);
            c.last_extracted_timestamp = c.last_extracted_timestamp.max(update.last_timestamp);
            c.last_run_time = now;
        })
        .or_insert_with(|| Checkpoint {
            source_name: update.source_name.clone(),
            last_extracted_id: update.last_id,
            last_extracted_timestamp: update.last_timestamp,
            last_run_time: now,
        });
}

fn apply_dimension<A: Clone>(
    entity: &'static str,
    records: &mut Vec<DimensionRecord<A>>,
    next_surrogate_key: &mut i64,
    plan: &DimensionPlan<A>,
) -> Result<AppliedChanges> {
    let mut staged = records.clone();
    let mut next_key = *next_surrogate_key;
    let mut applied = AppliedChanges::default();

    for expiration in &plan.expire {
        if let Some(record) = staged.iter_mut().find(|r| r.surrogate_key == expiration.surrogate_key && r.is_current) {
            record.is_current = false;
            record.expiry_date = expiration.expiry_date;
            applied.expired += 1;
        }
    }

    for version in &plan.insert {
        if staged.iter().any(|r| r.natural_key == version.natural_key && r.is_current) {
            return Err(EtlError::IntegrityViolation {
                entity,
                natural_key: version.natural_key,
                detail: "insert found an existing current version".into(),
            });
        }
        next_key += 1;
        staged.push(DimensionRecord {
            surrogate_key: next_key,
            natural_key: version.natural_key,
            attributes: version.attributes.clone(),
            effective_date: version.effective_date,
            expiry_date: version.expiry_date,
            is_current: true,
        });
        applied.inserted += 1;
    }

    *records = staged;
    *next_surrogate_key = next_key;
    Ok(applied)
}

/// Source rows modified after `since`, plus rows with no current version; everything when `since` is `None`
fn changed_rows<T: Clone, A>(
    rows: &BTreeMap<i64, T>,
    dimension: &[DimensionRecord<A>],
    since: Option<DateTime<Utc>>,
    updated_at: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    rows.iter()
        .filter(|(id, row)| match since {
            Some(since) => updated_at(row) > since || !dimension.iter().any(|r| r.natural_key == **id && r.is_current),
            None => true,
        })
        .map(|(_, row)| row.clone())
        .collect()
}

fn current_of<A: Clone>(records: &[DimensionRecord<A>]) -> Vec<DimensionRecord<A>> {
    records.iter().filter(|r| r.is_current).cloned().collect()
}

impl WarehouseStore for MemoryStore {
    async fn checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>> {
        Ok(self.readable()?.checkpoints.get(source_name).cloned())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.readable()?.checkpoints.values().cloned().collect())
    }

    async fn upsert_checkpoint(&self, update: &CheckpointUpdate) -> Result<()> {
        upsert_checkpoint_in(&mut self.lock().checkpoints, update);
        Ok(())
    }

    async fn source_customers(&self, changed_since: Option<DateTime<Utc>>) -> Result<Vec<SourceCustomer>> {
        let state = self.readable()?;
        Ok(changed_rows(&state.customers, &state.dim_customer, changed_since, |c| c.updated_at))
    }

    async fn source_products(&self, changed_since: Option<DateTime<Utc>>) -> Result<Vec<SourceProduct>> {
        let state = self.readable()?;
        Ok(changed_rows(&state.products, &state.dim_product, changed_since, |p| p.updated_at))
    }

    async fn source_transactions(&self, after_id: i64) -> Result<Vec<SourceTransaction>> {
        Ok(self.readable()?.transactions.range(after_id + 1..).map(|(_, t)| t.clone()).collect())
    }

    async fn current_customers(&self) -> Result<Vec<DimensionRecord<CustomerAttributes>>> {
        Ok(current_of(&self.readable()?.dim_customer))
    }

    async fn current_products(&self) -> Result<Vec<DimensionRecord<ProductAttributes>>> {
        Ok(current_of(&self.readable()?.dim_product))
    }

    async fn apply_customer_changes(
        &self,
        plan: &DimensionPlan<CustomerAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> Result<AppliedChanges> {
        let mut state = self.lock();
        let state = &mut *state;
        let applied = apply_dimension("customer", &mut state.dim_customer, &mut state.next_surrogate_key, plan)?;
        if let Some(update) = checkpoint {
            upsert_checkpoint_in(&mut state.checkpoints, update);
        }
        Ok(applied)
    }

    async fn apply_product_changes(
        &self,
        plan: &DimensionPlan<ProductAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> Result<AppliedChanges> {
        let mut state = self.lock();
        let state = &mut *state;
        let applied = apply_dimension("product", &mut state.dim_product, &mut state.next_surrogate_key, plan)?;
        if let Some(update) = checkpoint {
            upsert_checkpoint_in(&mut state.checkpoints, update);
        }
        Ok(applied)
    }

    async fn loaded_degenerate_keys(&self, after_id: i64) -> Result<HashSet<i64>> {
        Ok(self.readable()?.facts.iter().map(|f| f.degenerate_key).filter(|k| *k > after_id).collect())
    }

    async fn append_facts(&self, plan: &FactPlan, checkpoint: Option<&CheckpointUpdate>) -> Result<u64> {
        let mut state = self.lock();

        if let Some(rows) = state.fact_fault_after.take() {
            let partial: Vec<SalesFact> = plan.facts.iter().take(rows).cloned().collect();
            state.facts.extend(partial);
            return Err(EtlError::PartialWriteFailure(format!(
                "injected fault after {} of {} facts",
                rows.min(plan.facts.len()),
                plan.facts.len()
            )));
        }

        for date in &plan.dates {
            state.dates.entry(date.date_key).or_insert_with(|| date.clone());
        }
        state.facts.extend(plan.facts.iter().cloned());
        if let Some(update) = checkpoint {
            upsert_checkpoint_in(&mut state.checkpoints, update);
        }
        Ok(plan.facts.len() as u64)
    }

    async fn sales_facts(&self) -> Result<Vec<SalesFact>> {
        Ok(self.readable()?.facts.clone())
    }

    async fn replace_daily_summary(&self, rows: &[DailySalesSummary]) -> Result<(u64, u64)> {
        let mut state = self.lock();
        let deleted = state.summary.len() as u64;
        state.summary = rows.to_vec();
        Ok((deleted, rows.len() as u64))
    }

    async fn start_job(&self, job_name: &str) -> Result<i64> {
        let mut state = self.lock();
        if state.jobs.values().any(|run| run.status == JobStatus::Running) {
            return Err(EtlError::ConcurrentRun { job_name: job_name.to_string() });
        }

        state.next_run_id += 1;
        let run_id = state.next_run_id;
        state.jobs.insert(
            run_id,
            JobRun {
                run_id,
                job_name: job_name.to_string(),
                start_time: Utc::now(),
                end_time: None,
                status: JobStatus::Running,
                counts: RowCounts::default(),
                error_message: None,
            },
        );
        Ok(run_id)
    }

    async fn finish_job(
        &self,
        run_id: i64,
        status: JobStatus,
        counts: RowCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock();
        if status == JobStatus::Completed && std::mem::take(&mut state.completion_fault) {
            return Err(EtlError::PartialWriteFailure(format!("injected fault completing run {}", run_id)));
        }

        let run = state
            .jobs
            .get_mut(&run_id)
            .filter(|run| run.status == JobStatus::Running)
            .ok_or(EtlError::JobNotRunning(run_id))?;

        run.status = status;
        run.end_time = Some(Utc::now());
        run.counts = counts;
        run.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn job_run(&self, run_id: i64) -> Result<Option<JobRun>> {
        Ok(self.lock().jobs.get(&run_id).cloned())
    }

    async fn running_jobs(&self) -> Result<Vec<JobRun>> {
        Ok(self.lock().jobs.values().filter(|run| run.status == JobStatus::Running).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::checkpoint;
    use crate::etl::load::{Expiration, NewVersion};
    use crate::models::open_ended_expiry;
    use bigdecimal::BigDecimal;
    use chrono::{Duration, NaiveDate};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn version(customer_id: i64, city: &str, effective_date: NaiveDate) -> NewVersion<CustomerAttributes> {
        NewVersion {
            natural_key: customer_id,
            attributes: CustomerAttributes {
                full_name: "Ravi Menon".into(),
                email: format!("ravi{}@example.com", customer_id),
                city: Some(city.into()),
                tier: None,
                segment: "New".into(),
            },
            effective_date,
            expiry_date: open_ended_expiry(),
        }
    }

    fn inserts(versions: Vec<NewVersion<CustomerAttributes>>) -> DimensionPlan<CustomerAttributes> {
        DimensionPlan { expire: vec![], insert: versions }
    }

    fn source_customer(customer_id: i64, updated_at: DateTime<Utc>) -> SourceCustomer {
        SourceCustomer {
            customer_id,
            first_name: "Ravi".into(),
            last_name: "Menon".into(),
            email: format!("ravi{}@example.com", customer_id),
            city: None,
            tier_name: None,
            total_spend: BigDecimal::from(0),
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_insert_over_current_version_is_rejected_whole() {
        let store = MemoryStore::new();
        store.apply_customer_changes(&inserts(vec![version(1, "Kochi", day(1))]), None).await.unwrap();
        let before = store.all_customer_versions();

        let cursor = checkpoint::prepare("customers", None, Utc::now());
        let plan = inserts(vec![version(2, "Goa", day(2)), version(1, "Delhi", day(2))]);
        let err = store.apply_customer_changes(&plan, Some(&cursor)).await.unwrap_err();

        assert!(matches!(err, EtlError::IntegrityViolation { entity: "customer", natural_key: 1, .. }));
        assert_eq!(store.all_customer_versions(), before);
        assert!(store.checkpoint("customers").await.unwrap().is_none());

        // The rejected plan consumed no surrogate keys
        store.apply_customer_changes(&inserts(vec![version(2, "Goa", day(2))]), None).await.unwrap();
        assert_eq!(store.customer_versions(2)[0].surrogate_key, 2);
    }

    #[tokio::test]
    async fn test_replayed_expiration_leaves_history_untouched() {
        let store = MemoryStore::new();
        store.apply_customer_changes(&inserts(vec![version(1, "Kochi", day(1))]), None).await.unwrap();
        let first = store.customer_versions(1)[0].surrogate_key;

        let expiration = Expiration { surrogate_key: first, natural_key: 1, expiry_date: day(4) };
        let plan = DimensionPlan { expire: vec![expiration.clone()], insert: vec![version(1, "Delhi", day(5))] };
        let applied = store.apply_customer_changes(&plan, None).await.unwrap();
        assert_eq!(applied, AppliedChanges { expired: 1, inserted: 1 });
        let history = store.customer_versions(1);

        for expiry_date in [day(4), day(9)] {
            let replay = DimensionPlan { expire: vec![Expiration { expiry_date, ..expiration.clone() }], insert: vec![] };
            let applied = store.apply_customer_changes(&replay, None).await.unwrap();
            assert_eq!(applied.expired, 0);
            assert_eq!(store.customer_versions(1), history);
        }
    }

    #[tokio::test]
    async fn test_source_reads_return_only_the_delta() {
        let t0 = Utc::now() - Duration::days(2);
        let store = MemoryStore::new();
        store.put_customer(source_customer(1, t0));
        store.put_customer(source_customer(2, t0));
        store.put_customer(source_customer(3, t0 + Duration::days(1)));
        store.apply_customer_changes(&inserts(vec![version(1, "Kochi", day(1)), version(3, "Goa", day(1))]), None).await.unwrap();

        let ids = |rows: Vec<SourceCustomer>| rows.iter().map(|c| c.customer_id).collect::<Vec<_>>();
        // 1 is unchanged and loaded, 2 has never been loaded, 3 changed after the cursor
        assert_eq!(ids(store.source_customers(Some(t0)).await.unwrap()), vec![2, 3]);
        assert_eq!(ids(store.source_customers(None).await.unwrap()), vec![1, 2, 3]);
        assert!(store.source_products(Some(t0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_fault_fires_once() {
        let store = MemoryStore::new();
        let run_id = store.start_job("incremental_load").await.unwrap();
        store.fail_job_completion();

        let err = store.finish_job(run_id, JobStatus::Completed, RowCounts::default(), None).await.unwrap_err();
        assert!(matches!(err, EtlError::PartialWriteFailure(_)));
        store.finish_job(run_id, JobStatus::Failed, RowCounts::default(), Some("gave up")).await.unwrap();
        assert_eq!(store.job_run(run_id).await.unwrap().unwrap().status, JobStatus::Failed);
    }
}
