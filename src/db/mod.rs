/// Database Module
///
/// This module handles all PostgreSQL database operations including:
/// - Connection pool management
/// - Schema migrations
/// - Operational source reads and warehouse writes behind `WarehouseStore`
///
/// Every stage write runs in one transaction together with its checkpoint advance.
use crate::error::{EtlError, Result};
use crate::etl::load::{DimensionPlan, Expiration, FactPlan};
use crate::models::{
    Checkpoint, CheckpointUpdate, CustomerAttributes, DailySalesSummary, DimensionRecord, JobRun, JobStatus,
    ProductAttributes, RowCounts, SalesFact, SourceCustomer, SourceProduct, SourceTransaction,
};
use crate::store::{AppliedChanges, WarehouseStore};
use anyhow::Context;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool};
use std::collections::HashSet;

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>> {
        self.pool.begin().await.map_err(write_error("begin transaction"))
    }
}

// ========== Error mapping ==========

fn read_error(what: &'static str) -> impl FnOnce(sqlx::Error) -> EtlError {
    move |e| EtlError::SourceUnavailable(format!("reading {}: {}", what, e))
}

fn write_error(what: &'static str) -> impl FnOnce(sqlx::Error) -> EtlError {
    move |e| EtlError::PartialWriteFailure(format!("{}: {}", what, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ========== Raw rows ==========

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    customer_key: i64,
    customer_id: i64,
    full_name: String,
    email: String,
    city: Option<String>,
    tier: Option<String>,
    segment: String,
    effective_date: NaiveDate,
    expiry_date: NaiveDate,
    is_current: bool,
}

impl From<CustomerRow> for DimensionRecord<CustomerAttributes> {
    fn from(row: CustomerRow) -> Self {
        Self {
            surrogate_key: row.customer_key,
            natural_key: row.customer_id,
            attributes: CustomerAttributes {
                full_name: row.full_name,
                email: row.email,
                city: row.city,
                tier: row.tier,
                segment: row.segment,
            },
            effective_date: row.effective_date,
            expiry_date: row.expiry_date,
            is_current: row.is_current,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    product_key: i64,
    product_id: i64,
    product_name: String,
    category: Option<String>,
    unit_price: BigDecimal,
    cost_price: BigDecimal,
    price_range: String,
    effective_date: NaiveDate,
    expiry_date: NaiveDate,
    is_current: bool,
}

impl From<ProductRow> for DimensionRecord<ProductAttributes> {
    fn from(row: ProductRow) -> Self {
        Self {
            surrogate_key: row.product_key,
            natural_key: row.product_id,
            attributes: ProductAttributes {
                product_name: row.product_name,
                category: row.category,
                unit_price: row.unit_price,
                cost_price: row.cost_price,
                price_range: row.price_range,
            },
            effective_date: row.effective_date,
            expiry_date: row.expiry_date,
            is_current: row.is_current,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRunRow {
    run_id: i64,
    job_name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    rows_processed: i64,
    rows_inserted: i64,
    rows_updated: i64,
    rows_deleted: i64,
    error_message: Option<String>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = EtlError;

    fn try_from(row: JobRunRow) -> Result<Self> {
        let status = row.status.parse::<JobStatus>().map_err(|detail| EtlError::IntegrityViolation {
            entity: "job run",
            natural_key: row.run_id,
            detail,
        })?;

        Ok(Self {
            run_id: row.run_id,
            job_name: row.job_name,
            start_time: row.start_time,
            end_time: row.end_time,
            status,
            counts: RowCounts {
                processed: row.rows_processed.max(0) as u64,
                inserted: row.rows_inserted.max(0) as u64,
                updated: row.rows_updated.max(0) as u64,
                deleted: row.rows_deleted.max(0) as u64,
            },
            error_message: row.error_message,
        })
    }
}

const JOB_RUN_COLUMNS: &str = "run_id, job_name, start_time, end_time, status, rows_processed, rows_inserted, \
                               rows_updated, rows_deleted, error_message";

// ========== Shared statements ==========

/// Upsert a checkpoint; id and timestamp only ever move forward
async fn upsert_checkpoint_on(conn: &mut PgConnection, update: &CheckpointUpdate) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO etl_checkpoint (source_name, last_extracted_id, last_extracted_timestamp, last_run_time)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (source_name) DO UPDATE SET
             last_extracted_id = GREATEST(etl_checkpoint.last_extracted_id, EXCLUDED.last_extracted_id),
             last_extracted_timestamp = GREATEST(etl_checkpoint.last_extracted_timestamp, EXCLUDED.last_extracted_timestamp),
             last_run_time = EXCLUDED.last_run_time",
    )
    .bind(&update.source_name)
    .bind(update.last_id)
    .bind(update.last_timestamp)
    .execute(conn)
    .await?;

    Ok(())
}

/// Close current versions in `table`. Rows already expired are left alone.
async fn expire_versions(
    conn: &mut PgConnection,
    table: &'static str,
    key_column: &'static str,
    expirations: &[Expiration],
) -> Result<u64> {
    let statement = format!(
        "UPDATE {} SET is_current = FALSE, expiry_date = $2 WHERE {} = $1 AND is_current",
        table, key_column
    );
    let mut expired = 0;

    for expiration in expirations {
        let result = sqlx::query(&statement)
            .bind(expiration.surrogate_key)
            .bind(expiration.expiry_date)
            .execute(&mut *conn)
            .await
            .map_err(write_error("expiring dimension version"))?;
        expired += result.rows_affected();
    }

    Ok(expired)
}

fn insert_conflict(entity: &'static str, natural_key: i64) -> EtlError {
    EtlError::IntegrityViolation { entity, natural_key, detail: "insert found an existing current version".into() }
}

impl WarehouseStore for Database {
    // ── Checkpoints ───────────────────────────────────────────────────────

    async fn checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>> {
        sqlx::query_as::<_, Checkpoint>(
            "SELECT source_name, last_extracted_id, last_extracted_timestamp, last_run_time
             FROM etl_checkpoint WHERE source_name = $1",
        )
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error("etl_checkpoint"))
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        sqlx::query_as::<_, Checkpoint>(
            "SELECT source_name, last_extracted_id, last_extracted_timestamp, last_run_time
             FROM etl_checkpoint ORDER BY source_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("etl_checkpoint"))
    }

    async fn upsert_checkpoint(&self, update: &CheckpointUpdate) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(write_error("acquire connection"))?;
        upsert_checkpoint_on(&mut *conn, update).await.map_err(write_error("upserting checkpoint"))
    }

    // ── Operational sources ───────────────────────────────────────────────

    async fn source_customers(&self, changed_since: Option<DateTime<Utc>>) -> Result<Vec<SourceCustomer>> {
        sqlx::query_as::<_, SourceCustomer>(
            "SELECT c.customer_id, c.first_name, c.last_name, c.email, c.city, t.tier_name, c.total_spend, c.updated_at
             FROM customers c
             LEFT JOIN customer_tiers t ON t.tier_id = c.tier_id
             WHERE $1::TIMESTAMPTZ IS NULL
                OR c.updated_at > $1
                OR NOT EXISTS (SELECT 1 FROM dim_customer d WHERE d.customer_id = c.customer_id AND d.is_current)
             ORDER BY c.customer_id",
        )
        .bind(changed_since)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("customers"))
    }

    async fn source_products(&self, changed_since: Option<DateTime<Utc>>) -> Result<Vec<SourceProduct>> {
        sqlx::query_as::<_, SourceProduct>(
            "SELECT p.product_id, p.product_name, c.category_name, p.unit_price, p.cost_price, p.updated_at
             FROM products p
             LEFT JOIN categories c ON c.category_id = p.category_id
             WHERE $1::TIMESTAMPTZ IS NULL
                OR p.updated_at > $1
                OR NOT EXISTS (SELECT 1 FROM dim_product d WHERE d.product_id = p.product_id AND d.is_current)
             ORDER BY p.product_id",
        )
        .bind(changed_since)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("products"))
    }

    async fn source_transactions(&self, after_id: i64) -> Result<Vec<SourceTransaction>> {
        sqlx::query_as::<_, SourceTransaction>(
            "SELECT d.detail_id, d.sale_id, s.customer_id, d.product_id, s.sale_date, s.status,
                    d.quantity, d.unit_price, d.discount_pct, d.line_total
             FROM sales_details d
             JOIN sales s ON s.sale_id = d.sale_id
             WHERE d.detail_id > $1
             ORDER BY d.detail_id",
        )
        .bind(after_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("sales_details"))
    }

    // ── Dimensions ────────────────────────────────────────────────────────

    async fn current_customers(&self) -> Result<Vec<DimensionRecord<CustomerAttributes>>> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            "SELECT customer_key, customer_id, full_name, email, city, tier, segment,
                    effective_date, expiry_date, is_current
             FROM dim_customer WHERE is_current",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("dim_customer"))?;

        Ok(rows.into_iter().map(DimensionRecord::from).collect())
    }

    async fn current_products(&self) -> Result<Vec<DimensionRecord<ProductAttributes>>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            "SELECT product_key, product_id, product_name, category, unit_price, cost_price, price_range,
                    effective_date, expiry_date, is_current
             FROM dim_product WHERE is_current",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("dim_product"))?;

        Ok(rows.into_iter().map(DimensionRecord::from).collect())
    }

    async fn apply_customer_changes(
        &self,
        plan: &DimensionPlan<CustomerAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> Result<AppliedChanges> {
        let mut tx = self.begin().await?;
        let expired = expire_versions(&mut *tx, "dim_customer", "customer_key", &plan.expire).await?;

        let mut inserted = 0;
        for version in &plan.insert {
            let attributes = &version.attributes;
            let result = sqlx::query(
                "INSERT INTO dim_customer
                     (customer_id, full_name, email, city, tier, segment, effective_date, expiry_date, is_current)
                 SELECT $1::BIGINT, $2::TEXT, $3::TEXT, $4::TEXT, $5::TEXT, $6::TEXT, $7::DATE, $8::DATE, TRUE
                 WHERE NOT EXISTS (SELECT 1 FROM dim_customer WHERE customer_id = $1 AND is_current)",
            )
            .bind(version.natural_key)
            .bind(&attributes.full_name)
            .bind(&attributes.email)
            .bind(&attributes.city)
            .bind(&attributes.tier)
            .bind(&attributes.segment)
            .bind(version.effective_date)
            .bind(version.expiry_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    insert_conflict("customer", version.natural_key)
                } else {
                    write_error("inserting customer version")(e)
                }
            })?;

            if result.rows_affected() == 0 {
                return Err(insert_conflict("customer", version.natural_key));
            }
            inserted += 1;
        }

        if let Some(update) = checkpoint {
            upsert_checkpoint_on(&mut *tx, update).await.map_err(write_error("upserting checkpoint"))?;
        }
        tx.commit().await.map_err(write_error("committing customer dimension"))?;

        Ok(AppliedChanges { expired, inserted })
    }

    async fn apply_product_changes(
        &self,
        plan: &DimensionPlan<ProductAttributes>,
        checkpoint: Option<&CheckpointUpdate>,
    ) -> Result<AppliedChanges> {
        let mut tx = self.begin().await?;
        let expired = expire_versions(&mut *tx, "dim_product", "product_key", &plan.expire).await?;

        let mut inserted = 0;
        for version in &plan.insert {
            let attributes = &version.attributes;
            let result = sqlx::query(
                "INSERT INTO dim_product
                     (product_id, product_name, category, unit_price, cost_price, price_range,
                      effective_date, expiry_date, is_current)
                 SELECT $1::BIGINT, $2::TEXT, $3::TEXT, $4::NUMERIC, $5::NUMERIC, $6::TEXT, $7::DATE, $8::DATE, TRUE
                 WHERE NOT EXISTS (SELECT 1 FROM dim_product WHERE product_id = $1 AND is_current)",
            )
            .bind(version.natural_key)
            .bind(&attributes.product_name)
            .bind(&attributes.category)
            .bind(&attributes.unit_price)
            .bind(&attributes.cost_price)
            .bind(&attributes.price_range)
            .bind(version.effective_date)
            .bind(version.expiry_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    insert_conflict("product", version.natural_key)
                } else {
                    write_error("inserting product version")(e)
                }
            })?;

            if result.rows_affected() == 0 {
                return Err(insert_conflict("product", version.natural_key));
            }
            inserted += 1;
        }

        if let Some(update) = checkpoint {
            upsert_checkpoint_on(&mut *tx, update).await.map_err(write_error("upserting checkpoint"))?;
        }
        tx.commit().await.map_err(write_error("committing product dimension"))?;

        Ok(AppliedChanges { expired, inserted })
    }

    // ── Facts ─────────────────────────────────────────────────────────────

    async fn loaded_degenerate_keys(&self, after_id: i64) -> Result<HashSet<i64>> {
        let keys: Vec<i64> = sqlx::query_scalar("SELECT degenerate_key FROM fact_sales WHERE degenerate_key > $1")
            .bind(after_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_error("fact_sales"))?;

        Ok(keys.into_iter().collect())
    }

    async fn append_facts(&self, plan: &FactPlan, checkpoint: Option<&CheckpointUpdate>) -> Result<u64> {
        let mut tx = self.begin().await?;

        for date in &plan.dates {
            sqlx::query(
                "INSERT INTO dim_date (date_key, full_date, year, quarter, month, day, weekday, is_weekend)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (date_key) DO NOTHING",
            )
            .bind(date.date_key)
            .bind(date.full_date)
            .bind(date.year)
            .bind(date.quarter)
            .bind(date.month)
            .bind(date.day)
            .bind(&date.weekday)
            .bind(date.is_weekend)
            .execute(&mut *tx)
            .await
            .map_err(write_error("inserting date dimension row"))?;
        }

        let mut inserted = 0;
        for fact in &plan.facts {
            let result = sqlx::query(
                "INSERT INTO fact_sales
                     (degenerate_key, sale_id, customer_key, product_key, date_key, sale_date, quantity,
                      unit_price, discount_amount, line_total, tax_amount, cost_amount, profit_amount)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (degenerate_key) DO NOTHING",
            )
            .bind(fact.degenerate_key)
            .bind(fact.sale_id)
            .bind(fact.customer_key)
            .bind(fact.product_key)
            .bind(fact.date_key)
            .bind(fact.sale_date)
            .bind(fact.quantity)
            .bind(&fact.unit_price)
            .bind(&fact.discount_amount)
            .bind(&fact.line_total)
            .bind(&fact.tax_amount)
            .bind(&fact.cost_amount)
            .bind(&fact.profit_amount)
            .execute(&mut *tx)
            .await
            .map_err(write_error("inserting sales fact"))?;

            inserted += result.rows_affected();
        }

        if let Some(update) = checkpoint {
            upsert_checkpoint_on(&mut *tx, update).await.map_err(write_error("upserting checkpoint"))?;
        }
        tx.commit().await.map_err(write_error("committing fact load"))?;

        Ok(inserted)
    }

    async fn sales_facts(&self) -> Result<Vec<SalesFact>> {
        sqlx::query_as::<_, SalesFact>(
            "SELECT degenerate_key, sale_id, customer_key, product_key, date_key, sale_date, quantity,
                    unit_price, discount_amount, line_total, tax_amount, cost_amount, profit_amount
             FROM fact_sales ORDER BY degenerate_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("fact_sales"))
    }

    async fn replace_daily_summary(&self, rows: &[DailySalesSummary]) -> Result<(u64, u64)> {
        let mut tx = self.begin().await?;

        let deleted = sqlx::query("DELETE FROM fact_daily_sales_summary")
            .execute(&mut *tx)
            .await
            .map_err(write_error("clearing daily summary"))?
            .rows_affected();

        for row in rows {
            sqlx::query(
                "INSERT INTO fact_daily_sales_summary
                     (sale_date, transactions, units_sold, gross_revenue, discount_total, tax_total, cost_total,
                      profit_total, refreshed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())",
            )
            .bind(row.sale_date)
            .bind(row.transactions)
            .bind(row.units_sold)
            .bind(&row.gross_revenue)
            .bind(&row.discount_total)
            .bind(&row.tax_total)
            .bind(&row.cost_total)
            .bind(&row.profit_total)
            .execute(&mut *tx)
            .await
            .map_err(write_error("inserting daily summary"))?;
        }

        tx.commit().await.map_err(write_error("committing daily summary"))?;
        Ok((deleted, rows.len() as u64))
    }

    // ── Job log ───────────────────────────────────────────────────────────

    async fn start_job(&self, job_name: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO etl_job_log (job_name, start_time, status) VALUES ($1, NOW(), 'running') RETURNING run_id",
        )
        .bind(job_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EtlError::ConcurrentRun { job_name: job_name.to_string() }
            } else {
                write_error("opening job log entry")(e)
            }
        })
    }

    async fn finish_job(
        &self,
        run_id: i64,
        status: JobStatus,
        counts: RowCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE etl_job_log
             SET status = $2, end_time = NOW(), rows_processed = $3, rows_inserted = $4,
                 rows_updated = $5, rows_deleted = $6, error_message = $7
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(counts.processed as i64)
        .bind(counts.inserted as i64)
        .bind(counts.updated as i64)
        .bind(counts.deleted as i64)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(write_error("closing job log entry"))?;

        if result.rows_affected() == 0 {
            return Err(EtlError::JobNotRunning(run_id));
        }
        Ok(())
    }

    async fn job_run(&self, run_id: i64) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(&format!("SELECT {} FROM etl_job_log WHERE run_id = $1", JOB_RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_error("etl_job_log"))?;

        row.map(JobRun::try_from).transpose()
    }

    async fn running_jobs(&self) -> Result<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM etl_job_log WHERE status = 'running' ORDER BY start_time",
            JOB_RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("etl_job_log"))?;

        rows.into_iter().map(JobRun::try_from).collect()
    }
}
